//! Integration tests for interface management and the handle lifecycle
//!
//! Covers:
//! - Claiming interfaces held by kernel drivers or other usbfs users
//! - Release after the device is gone
//! - Reattaching displaced drivers when the handle closes
//! - Configuration, alternate setting, reset and halt requests

use protocol::{EndpointAddress, EndpointInfo};
use usbhost::Error;
use usbhost::test_utils::MockUsbfs;

mod claim {
    use super::*;

    #[test]
    fn test_free_interface() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        handle.claim_interface(0).unwrap();
        assert_eq!(mock.claimed(), vec![0]);
        assert_eq!(handle.claimed_interfaces().collect::<Vec<_>>(), vec![0]);
        assert!(mock.disconnects().is_empty());
    }

    #[test]
    fn test_kernel_driver_is_detached() {
        let mock = MockUsbfs::new();
        mock.hold_interface(0, "usbhid");
        let mut handle = mock.handle();

        handle.claim_interface(0).unwrap();
        assert_eq!(mock.disconnects(), vec![0]);
        assert_eq!(mock.claim_attempts(), 2);
        assert_eq!(mock.claimed(), vec![0]);
    }

    #[test]
    fn test_detach_is_retried_once() {
        let mock = MockUsbfs::new();
        mock.hold_interface_sticky(0, "usbhid");
        let mut handle = mock.handle();

        let result = handle.claim_interface(0);
        match result {
            Err(Error::InterfaceBusy { interface, driver }) => {
                assert_eq!(interface, 0);
                assert_eq!(driver, "usbhid");
            }
            other => panic!("expected busy interface, got {:?}", other),
        }
        assert_eq!(mock.claim_attempts(), 2);
        assert_eq!(mock.disconnects(), vec![0]);
    }

    #[test]
    fn test_other_usbfs_user_is_left_alone() {
        let mock = MockUsbfs::new();
        mock.hold_interface(1, "usbfs");
        let mut handle = mock.handle();

        assert!(matches!(
            handle.claim_interface(1),
            Err(Error::InterfaceBusy { interface: 1, .. })
        ));
        assert!(mock.disconnects().is_empty());
        assert_eq!(mock.claim_attempts(), 1);
    }
}

mod release {
    use super::*;

    #[test]
    fn test_release_claimed_interface() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.claim_interface(2).unwrap();

        handle.release_interface(2).unwrap();
        assert!(mock.claimed().is_empty());
        assert_eq!(handle.claimed_interfaces().count(), 0);
    }

    #[test]
    fn test_release_after_unplug_succeeds() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.claim_interface(0).unwrap();
        mock.unplug();

        handle.release_interface(0).unwrap();
    }

    #[test]
    fn test_release_unclaimed_interface_fails() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.ensure_open().unwrap();

        assert!(matches!(handle.release_interface(3), Err(Error::Os { .. })));
    }

    #[test]
    fn test_release_on_unopened_unplugged_handle() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        mock.unplug();

        handle.release_interface(0).unwrap();
        assert!(!handle.is_open());
        assert_eq!(mock.opens(), 0);
    }

    #[test]
    fn test_release_after_close() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.claim_interface(0).unwrap();
        handle.close();

        handle.release_interface(0).unwrap();
        assert_eq!(mock.opens(), 1);
        assert!(!handle.is_open());
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_open_after_unplug_reports_no_device() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        mock.unplug();

        assert!(matches!(handle.ensure_open(), Err(Error::NoDevice)));
        assert!(!handle.is_open());
    }

    #[test]
    fn test_open_is_lazy() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        assert!(!handle.is_open());
        assert_eq!(mock.opens(), 0);

        handle.claim_interface(0).unwrap();
        assert!(handle.is_open());
        assert_eq!(mock.opens(), 1);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let mock = MockUsbfs::new();
        mock.fail_open();
        let mut handle = mock.handle();

        assert!(matches!(handle.claim_interface(0), Err(Error::Io(_))));
        assert!(!handle.is_open());
    }

    #[test]
    fn test_close_reattaches_displaced_driver() {
        let mock = MockUsbfs::new();
        mock.hold_interface(0, "usbhid");
        let mut handle = mock.handle();
        handle.claim_interface(0).unwrap();

        handle.close();
        assert!(mock.claimed().is_empty());
        assert_eq!(mock.connects(), vec![0]);
        assert!(!mock.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.claim_interface(0).unwrap();
        handle
            .submit(EndpointInfo::bulk(0x81, 8), vec![0; 8], 0)
            .unwrap();

        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert_eq!(handle.pending_requests(), 0);
        assert_eq!(mock.in_custody(), 0);
        assert!(mock.connects().is_empty());
    }

    #[test]
    fn test_drop_closes() {
        let mock = MockUsbfs::new();
        {
            let mut handle = mock.handle();
            handle.claim_interface(0).unwrap();
            assert!(mock.is_open());
        }
        assert!(!mock.is_open());
        assert!(mock.claimed().is_empty());
    }

    #[test]
    fn test_reopen_after_close() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.claim_interface(0).unwrap();
        handle.close();

        handle.claim_interface(0).unwrap();
        assert_eq!(mock.opens(), 2);
        assert_eq!(mock.claimed(), vec![0]);
    }
}

mod device_requests {
    use super::*;

    #[test]
    fn test_configuration_and_alternate() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        handle.set_configuration(1).unwrap();
        handle.set_alternate(0, 2).unwrap();
        assert_eq!(mock.configuration(), Some(1));
        assert_eq!(mock.alternates(), vec![(0, 2)]);
    }

    #[test]
    fn test_reset_and_clear_halt() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        handle.reset_device().unwrap();
        handle.clear_halt(EndpointAddress(0x81)).unwrap();
        assert_eq!(mock.resets(), 1);
        assert_eq!(mock.cleared_halts(), vec![0x81]);
    }

    #[test]
    fn test_requests_fail_once_unplugged() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.ensure_open().unwrap();
        mock.unplug();

        assert!(matches!(handle.reset_device(), Err(Error::NoDevice)));
        assert!(matches!(handle.set_configuration(1), Err(Error::NoDevice)));
    }
}
