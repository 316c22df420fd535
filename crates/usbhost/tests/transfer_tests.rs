//! Integration tests for the transfer engine
//!
//! Runs against the in-memory usbfs device:
//! - Synchronous control and bulk transfers
//! - Interrupt submission on kernels that refuse bulk-typed URBs
//! - Blocking interrupt transfers and polled input

use protocol::{Direction, EndpointAddress, EndpointInfo, Recipient, RequestType, requests};
use std::time::Duration;
use usbhost::Error;
use usbhost::sys::{URB_TYPE_BULK, URB_TYPE_INTERRUPT};
use usbhost::test_utils::MockUsbfs;

const INPUT: u8 = 0x81;
const OUTPUT: u8 = 0x02;

mod control {
    use super::*;

    #[test]
    fn test_vendor_read_fills_buffer() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        mock.queue_control_response(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let mut buffer = [0u8; 8];
        let count = handle
            .control_read(
                Recipient::Interface,
                RequestType::Vendor,
                0x01,
                0x0000,
                0x0000,
                &mut buffer,
                Duration::from_millis(1000),
            )
            .unwrap();

        assert_eq!(count, 8);
        assert_eq!(buffer, [1, 2, 3, 4, 5, 6, 7, 8]);

        let log = mock.control_log();
        assert_eq!(log.len(), 1);
        let (setup, _) = &log[0];
        assert_eq!(setup.request_type, 0xc1);
        assert_eq!(setup.request, 0x01);
        assert_eq!(setup.length, 8);
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn test_class_write_sends_payload() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let count = handle
            .control_write(
                Recipient::Interface,
                RequestType::Class,
                0x09,
                0x0200,
                0x0001,
                &[0xde, 0xad],
                Duration::from_millis(100),
            )
            .unwrap();

        assert_eq!(count, 2);
        let (setup, payload) = mock.control_log().remove(0);
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.value, 0x0200);
        assert_eq!(setup.index, 0x0001);
        assert_eq!(payload, vec![0xde, 0xad]);
    }

    #[test]
    fn test_stall_is_reported() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let mut buffer = [0u8; 4];
        let result = handle.get_descriptor(requests::DESCRIPTOR_STRING, 0, 0, &mut buffer);
        assert!(matches!(result, Err(Error::Os { .. })));
    }

    #[test]
    fn test_transfer_on_unplugged_device() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.ensure_open().unwrap();
        mock.unplug();

        let result = handle.control_write(
            Recipient::Device,
            RequestType::Standard,
            requests::SET_FEATURE,
            1,
            0,
            &[],
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(Error::NoDevice)));
    }
}

mod bulk {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let written = handle
            .bulk_write(EndpointAddress(OUTPUT), b"ping", Duration::from_millis(100))
            .unwrap();
        assert_eq!(written, 4);
        assert_eq!(mock.output(), vec![(OUTPUT, b"ping".to_vec())]);

        mock.push_input(INPUT, b"pong");
        let mut buffer = [0u8; 16];
        let read = handle
            .bulk_read(EndpointAddress(INPUT), &mut buffer, Duration::from_millis(100))
            .unwrap();
        assert_eq!(&buffer[..read], b"pong");
    }

    #[test]
    fn test_read_without_data_would_block() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let mut buffer = [0u8; 8];
        let result = handle.bulk_read(EndpointAddress(INPUT), &mut buffer, Duration::from_millis(10));
        assert!(matches!(result, Err(Error::WouldBlock)));
    }

    #[test]
    fn test_direction_is_checked() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let mut buffer = [0u8; 8];
        assert!(matches!(
            handle.bulk_read(EndpointAddress(OUTPUT), &mut buffer, Duration::ZERO),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            handle.bulk_write(EndpointAddress(INPUT), b"x", Duration::ZERO),
            Err(Error::Unsupported(_))
        ));
    }
}

mod interrupt {
    use super::*;

    #[test]
    fn test_retry_as_interrupt_once() {
        let mock = MockUsbfs::new();
        mock.reject_bulk_on(INPUT);
        let mut handle = mock.handle();

        handle
            .submit(EndpointInfo::interrupt(INPUT, 8, 10), vec![0; 8], 0)
            .unwrap();

        assert_eq!(
            mock.submit_attempts(),
            vec![(INPUT, URB_TYPE_BULK), (INPUT, URB_TYPE_INTERRUPT)]
        );
        assert_eq!(handle.pending_requests(), 1);
    }

    #[test]
    fn test_bulk_endpoint_is_not_retried() {
        let mock = MockUsbfs::new();
        mock.reject_bulk_on(INPUT);
        let mut handle = mock.handle();

        let result = handle.submit(EndpointInfo::bulk(INPUT, 8), vec![0; 8], 0);

        assert!(matches!(result, Err(Error::Os { .. })));
        assert_eq!(mock.submit_attempts(), vec![(INPUT, URB_TYPE_BULK)]);
        assert_eq!(handle.pending_requests(), 0);
    }

    #[test]
    fn test_blocking_transfer_returns_input() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        mock.push_input(INPUT, &[0x10, 0x20, 0x30]);

        let mut buffer = [0u8; 8];
        let count = handle
            .interrupt_transfer(
                EndpointInfo::interrupt(INPUT, 8, 1),
                &mut buffer,
                Duration::from_millis(200),
            )
            .unwrap();

        assert_eq!(&buffer[..count], &[0x10, 0x20, 0x30]);
        assert_eq!(handle.pending_requests(), 0);
    }

    #[test]
    fn test_blocking_transfer_times_out() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let mut buffer = [0u8; 8];
        let result = handle.interrupt_transfer(
            EndpointInfo::interrupt(INPUT, 8, 1),
            &mut buffer,
            Duration::from_millis(5),
        );

        assert!(matches!(result, Err(Error::TimedOut)));
        assert_eq!(handle.pending_requests(), 0);
        assert_eq!(mock.in_custody(), 0);
        assert_eq!(mock.discards(), 1);
    }

    #[test]
    fn test_blocking_output_transfer() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let mut payload = [0xaa, 0xbb];
        let count = handle
            .interrupt_transfer(
                EndpointInfo::interrupt(OUTPUT, 8, 1),
                &mut payload,
                Duration::from_millis(200),
            )
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(mock.output(), vec![(OUTPUT, vec![0xaa, 0xbb])]);
    }
}

mod polled_input {
    use super::*;

    #[test]
    fn test_await_then_take() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        let endpoint = EndpointInfo::interrupt(INPUT, 8, 1);

        assert!(!handle.await_input(endpoint, Duration::from_millis(3)).unwrap());
        // The request stays in flight and catches the next input.
        assert_eq!(mock.waiting_urbs(INPUT), 1);

        mock.push_input(INPUT, b"abc");
        assert!(handle.await_input(endpoint, Duration::from_millis(50)).unwrap());
        assert_eq!(handle.take_input(EndpointAddress(INPUT)).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(handle.take_input(EndpointAddress(INPUT)).unwrap(), None);
    }

    #[test]
    fn test_filters_run_in_order() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.add_input_filter(|data| {
            data.retain(|byte| *byte != 0);
            Ok(())
        });
        handle.add_input_filter(|data| {
            data.push(0xff);
            Ok(())
        });

        mock.push_input(INPUT, &[1, 0, 2]);
        let mut buffer = [0u8; 8];
        let count = handle
            .read_input(EndpointInfo::bulk(INPUT, 8), &mut buffer, Duration::from_millis(50))
            .unwrap();

        assert_eq!(&buffer[..count], &[1, 2, 0xff]);
    }

    #[test]
    fn test_failing_filter_drops_input() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();
        handle.add_input_filter(|_| Err(Error::Unsupported("corrupt frame")));

        mock.push_input(INPUT, &[1]);
        assert!(handle
            .await_input(EndpointInfo::bulk(INPUT, 8), Duration::from_millis(50))
            .unwrap());
        assert!(matches!(
            handle.take_input(EndpointAddress(INPUT)),
            Err(Error::Unsupported("corrupt frame"))
        ));
        assert_eq!(handle.queued(EndpointAddress(INPUT)), 0);
    }

    #[test]
    fn test_read_without_input_would_block() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle();

        let mut buffer = [0u8; 8];
        let result = handle.read_input(EndpointInfo::bulk(INPUT, 8), &mut buffer, Duration::from_millis(2));
        assert!(matches!(result, Err(Error::WouldBlock)));
    }
}
