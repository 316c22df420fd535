//! Kernel I/O seam
//!
//! Everything the engine asks of usbfs goes through [`UsbfsIo`]. The real
//! implementation issues ioctls on an open device node; tests substitute an
//! in-memory kernel.

use crate::error::Result;
use crate::registry::HostDevice;
use crate::sys;
use nix::errno::Errno;
use nix::libc::{c_int, c_uint, c_void};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::debug;

/// Operations on an open usbfs device node
///
/// Errors are raw errnos; the engine decides which ones are benign.
pub trait UsbfsIo {
    /// Synchronous control transfer; returns bytes transferred
    fn control(&self, transfer: &mut sys::CtrlTransfer) -> nix::Result<usize>;

    /// Synchronous bulk (or interrupt) transfer; returns bytes transferred
    fn bulk(&self, transfer: &mut sys::BulkTransfer) -> nix::Result<usize>;

    /// Hand an URB to the kernel
    ///
    /// # Safety
    ///
    /// `urb` and the buffer it points at must stay valid and unmoved until
    /// the URB has been returned by [`UsbfsIo::reap_urb`] or the device
    /// node is closed.
    unsafe fn submit_urb(&self, urb: *mut sys::Urb) -> nix::Result<()>;

    /// Ask the kernel to cancel a submitted URB
    ///
    /// # Safety
    ///
    /// `urb` must have been submitted on this device node.
    unsafe fn discard_urb(&self, urb: *mut sys::Urb) -> nix::Result<()>;

    /// Take back one completed URB; EAGAIN when none is ready and `wait`
    /// is false
    fn reap_urb(&self, wait: bool) -> nix::Result<*mut sys::Urb>;

    fn claim_interface(&self, interface: u8) -> nix::Result<()>;

    fn release_interface(&self, interface: u8) -> nix::Result<()>;

    /// Name of the kernel driver bound to an interface
    fn driver_name(&self, interface: u8) -> nix::Result<String>;

    /// Detach the kernel driver bound to an interface
    fn disconnect_driver(&self, interface: u8) -> nix::Result<()>;

    /// Rebind the kernel driver of an interface
    fn connect_driver(&self, interface: u8) -> nix::Result<()>;

    fn set_configuration(&self, configuration: u8) -> nix::Result<()>;

    fn set_interface(&self, interface: u8, alternate: u8) -> nix::Result<()>;

    fn reset(&self) -> nix::Result<()>;

    fn clear_halt(&self, endpoint: u8) -> nix::Result<()>;

    /// Descriptor to poll for completions, if there is a real one
    fn poll_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// Opens device nodes for a [`crate::DeviceHandle`]
pub trait DeviceOpener {
    fn open(&self, device: &HostDevice) -> Result<Box<dyn UsbfsIo>>;
}

/// An open usbfs device node
#[derive(Debug)]
pub struct UsbfsFile {
    fd: OwnedFd,
    path: PathBuf,
}

impl UsbfsFile {
    /// Open a device node read-write (close-on-exec)
    pub fn open(path: &Path) -> Result<Self> {
        let file: File = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("Opened USB device node {}", path.display());
        Ok(Self {
            fd: file.into(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw(&self) -> c_int {
        self.fd.as_raw_fd()
    }

    fn forward_ioctl(&self, interface: u8, code: c_int) -> nix::Result<()> {
        let mut request = sys::IoctlRequest {
            interface: interface as c_int,
            code,
            data: ptr::null_mut(),
        };
        unsafe { sys::usbdevfs_ioctl(self.raw(), &mut request) }.map(drop)
    }
}

impl UsbfsIo for UsbfsFile {
    fn control(&self, transfer: &mut sys::CtrlTransfer) -> nix::Result<usize> {
        unsafe { sys::usbdevfs_control(self.raw(), transfer) }.map(|n| n as usize)
    }

    fn bulk(&self, transfer: &mut sys::BulkTransfer) -> nix::Result<usize> {
        unsafe { sys::usbdevfs_bulk(self.raw(), transfer) }.map(|n| n as usize)
    }

    unsafe fn submit_urb(&self, urb: *mut sys::Urb) -> nix::Result<()> {
        unsafe { sys::usbdevfs_submiturb(self.raw(), urb) }.map(drop)
    }

    unsafe fn discard_urb(&self, urb: *mut sys::Urb) -> nix::Result<()> {
        unsafe { sys::usbdevfs_discardurb(self.raw(), urb) }.map(drop)
    }

    fn reap_urb(&self, wait: bool) -> nix::Result<*mut sys::Urb> {
        let mut urb: *mut c_void = ptr::null_mut();
        let target = &mut urb as *mut *mut c_void as *const *mut c_void;
        unsafe {
            if wait {
                sys::usbdevfs_reapurb(self.raw(), target)?;
            } else {
                sys::usbdevfs_reapurbndelay(self.raw(), target)?;
            }
        }
        Ok(urb as *mut sys::Urb)
    }

    fn claim_interface(&self, interface: u8) -> nix::Result<()> {
        let mut number = interface as c_uint;
        unsafe { sys::usbdevfs_claiminterface(self.raw(), &mut number) }.map(drop)
    }

    fn release_interface(&self, interface: u8) -> nix::Result<()> {
        let mut number = interface as c_uint;
        unsafe { sys::usbdevfs_releaseinterface(self.raw(), &mut number) }.map(drop)
    }

    fn driver_name(&self, interface: u8) -> nix::Result<String> {
        // The kernel fills the name in despite the _IOW encoding.
        let mut get = sys::GetDriver::new(interface);
        let target = ptr::addr_of_mut!(get) as *const sys::GetDriver;
        unsafe { sys::usbdevfs_getdriver(self.raw(), target) }?;
        Ok(get.driver_name())
    }

    fn disconnect_driver(&self, interface: u8) -> nix::Result<()> {
        self.forward_ioctl(interface, sys::USBDEVFS_DISCONNECT)
    }

    fn connect_driver(&self, interface: u8) -> nix::Result<()> {
        self.forward_ioctl(interface, sys::USBDEVFS_CONNECT)
    }

    fn set_configuration(&self, configuration: u8) -> nix::Result<()> {
        let mut value = configuration as c_uint;
        unsafe { sys::usbdevfs_setconfiguration(self.raw(), &mut value) }.map(drop)
    }

    fn set_interface(&self, interface: u8, alternate: u8) -> nix::Result<()> {
        let mut setting = sys::SetInterface {
            interface: interface as c_uint,
            alternate: alternate as c_uint,
        };
        unsafe { sys::usbdevfs_setinterface(self.raw(), &mut setting) }.map(drop)
    }

    fn reset(&self) -> nix::Result<()> {
        unsafe { sys::usbdevfs_reset(self.raw()) }.map(drop)
    }

    fn clear_halt(&self, endpoint: u8) -> nix::Result<()> {
        let mut value = endpoint as c_uint;
        unsafe { sys::usbdevfs_clear_halt(self.raw(), &mut value) }.map(drop)
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.fd.as_fd())
    }
}

/// Opens the usbfs node of a host device
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbfsOpener;

impl DeviceOpener for UsbfsOpener {
    fn open(&self, device: &HostDevice) -> Result<Box<dyn UsbfsIo>> {
        Ok(Box::new(UsbfsFile::open(device.usbfs_path())?))
    }
}

/// Whether an errno means "the URB was not in flight"
pub(crate) fn is_benign_discard(errno: Errno) -> bool {
    matches!(errno, Errno::ENODEV | Errno::EINVAL)
}
