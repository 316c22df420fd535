//! usbfs host transport
//!
//! Talks to USB devices through the Linux usbfs device nodes: locating the
//! device tree, enumerating devices, claiming interfaces, synchronous control
//! and bulk transfers, and asynchronous transfers whose buffers are handed to
//! the kernel and reaped back. Input endpoints can be monitored so that every
//! completion reaches a handler, either through real-time signals or through
//! the device node reporting writable.
//!
//! The transport knows nothing about the peripherals it serves; drivers
//! reach it through [`UsbHost`] and [`DeviceHandle`].
//!
//! # Example
//!
//! ```no_run
//! use common::HostConfig;
//! use protocol::EndpointInfo;
//! use std::time::Duration;
//! use usbhost::UsbHost;
//!
//! # fn main() -> usbhost::Result<()> {
//! let mut host = UsbHost::new(&HostConfig::default())?;
//! if let Some(mut handle) = host.find_matching(|_| true) {
//!     handle.claim_interface(0)?;
//!     let mut buffer = [0u8; 64];
//!     let count = handle.read_input(
//!         EndpointInfo::interrupt(0x81, 64, 10),
//!         &mut buffer,
//!         Duration::from_millis(500),
//!     )?;
//!     println!("{} bytes", count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod device;
mod endpoint;
pub mod error;
pub mod host;
pub mod interface;
pub mod io;
pub mod monitor;
pub mod probe;
pub mod registry;
pub mod request;
pub mod signal;
pub mod sys;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;

pub use device::{DeviceHandle, InputFilter, TransferOptions};
pub use error::{Error, Result};
pub use host::UsbHost;
pub use io::{DeviceOpener, UsbfsFile, UsbfsIo, UsbfsOpener};
pub use monitor::{InputEvent, InputHandler, MonitorEvent};
pub use probe::{FileSystemKind, USBFS, find_mount_point, locate_device_root, require_device_root};
pub use registry::{HostDevice, HostRegistry, read_host_descriptor, sysfs_path_for};
pub use request::{RequestId, TransferRequest};
pub use signal::SignalRegistration;
