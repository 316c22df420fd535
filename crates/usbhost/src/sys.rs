//! usbfs kernel ABI
//!
//! Structures and ioctl numbers from `linux/usbdevice_fs.h`. Layouts are
//! `#[repr(C)]` and must match the kernel exactly.

#![allow(clippy::missing_safety_doc)]

use nix::errno::Errno;
use nix::libc::{self, c_char, c_int, c_uint, c_void};
use std::ptr;

/// Longest driver name returned by USBDEVFS_GETDRIVER
pub const MAX_DRIVER_NAME: usize = 255;

/// Driver name reported for an interface claimed through usbfs
pub const USBFS_DRIVER: &str = "usbfs";

pub const URB_TYPE_ISO: u8 = 0;
pub const URB_TYPE_INTERRUPT: u8 = 1;
pub const URB_TYPE_CONTROL: u8 = 2;
pub const URB_TYPE_BULK: u8 = 3;

#[repr(C)]
#[derive(Debug)]
pub struct CtrlTransfer {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    /// Milliseconds
    pub timeout: u32,
    pub data: *mut c_void,
}

impl CtrlTransfer {
    /// Overlay a wire-format setup packet onto the ioctl argument
    ///
    /// The 16-bit fields keep the little-endian byte layout of the packet
    /// whatever the host order.
    pub fn from_setup(setup: &[u8; 8], timeout: u32, data: *mut c_void) -> Self {
        Self {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_ne_bytes([setup[2], setup[3]]),
            index: u16::from_ne_bytes([setup[4], setup[5]]),
            length: u16::from_ne_bytes([setup[6], setup[7]]),
            timeout,
            data,
        }
    }

    /// The setup packet bytes carried by this argument
    pub fn setup_bytes(&self) -> [u8; 8] {
        let value = self.value.to_ne_bytes();
        let index = self.index.to_ne_bytes();
        let length = self.length.to_ne_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct BulkTransfer {
    pub endpoint: c_uint,
    pub length: c_uint,
    /// Milliseconds
    pub timeout: c_uint,
    pub data: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct SetInterface {
    pub interface: c_uint,
    pub alternate: c_uint,
}

#[repr(C)]
pub struct GetDriver {
    pub interface: c_uint,
    pub driver: [c_char; MAX_DRIVER_NAME + 1],
}

impl GetDriver {
    pub fn new(interface: u8) -> Self {
        Self {
            interface: interface as c_uint,
            driver: [0; MAX_DRIVER_NAME + 1],
        }
    }

    pub fn driver_name(&self) -> String {
        let bytes: Vec<u8> = self
            .driver
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Argument of USBDEVFS_IOCTL: an ioctl forwarded to an interface driver
#[repr(C)]
#[derive(Debug)]
pub struct IoctlRequest {
    pub interface: c_int,
    pub code: c_int,
    pub data: *mut c_void,
}

/// usbdevfs_urb (without the trailing iso packet descriptors)
#[repr(C)]
#[derive(Debug)]
pub struct Urb {
    pub urb_type: u8,
    pub endpoint: u8,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut c_void,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    pub number_of_packets: c_int,
    pub error_count: c_int,
    /// Signal raised on completion, 0 for none
    pub signr: c_uint,
    pub usercontext: *mut c_void,
}

impl Default for Urb {
    fn default() -> Self {
        Self {
            urb_type: 0,
            endpoint: 0,
            status: 0,
            flags: 0,
            buffer: ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: ptr::null_mut(),
        }
    }
}

nix::ioctl_readwrite!(usbdevfs_control, b'U', 0, CtrlTransfer);
nix::ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);
nix::ioctl_read!(usbdevfs_setinterface, b'U', 4, SetInterface);
nix::ioctl_read!(usbdevfs_setconfiguration, b'U', 5, c_uint);
nix::ioctl_write_ptr!(usbdevfs_getdriver, b'U', 8, GetDriver);
nix::ioctl_read!(usbdevfs_submiturb, b'U', 10, Urb);
nix::ioctl_write_ptr!(usbdevfs_reapurb, b'U', 12, *mut c_void);
nix::ioctl_write_ptr!(usbdevfs_reapurbndelay, b'U', 13, *mut c_void);
nix::ioctl_read!(usbdevfs_claiminterface, b'U', 15, c_uint);
nix::ioctl_read!(usbdevfs_releaseinterface, b'U', 16, c_uint);
nix::ioctl_readwrite!(usbdevfs_ioctl, b'U', 18, IoctlRequest);
nix::ioctl_none!(usbdevfs_reset, b'U', 20);
nix::ioctl_read!(usbdevfs_clear_halt, b'U', 21, c_uint);

/// Detach the kernel driver bound to an interface (via USBDEVFS_IOCTL)
pub const USBDEVFS_DISCONNECT: c_int = nix::request_code_none!(b'U', 22) as c_int;

/// Rebind the kernel driver of an interface (via USBDEVFS_IOCTL)
pub const USBDEVFS_CONNECT: c_int = nix::request_code_none!(b'U', 23) as c_int;

/// USBDEVFS_DISCARDURB takes the URB pointer itself as the argument
pub unsafe fn usbdevfs_discardurb(fd: c_int, urb: *mut Urb) -> nix::Result<c_int> {
    unsafe {
        Errno::result(libc::ioctl(
            fd,
            nix::request_code_none!(b'U', 11) as _,
            urb,
        ))
    }
}
