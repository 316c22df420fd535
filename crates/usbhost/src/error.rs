//! Transport error types

use crate::request::RequestId;
use nix::errno::Errno;
use protocol::{EndpointAddress, ProtocolError};
use thiserror::Error;

/// Errors surfaced by the transfer engine and interface manager
#[derive(Debug, Error)]
pub enum Error {
    /// An ioctl or system call failed
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// The device was removed from the bus
    #[error("Device is no longer present")]
    NoDevice,

    /// No input is available yet
    #[error("No data available")]
    WouldBlock,

    #[error("Operation timed out")]
    TimedOut,

    /// Interface claimed by another driver that could not be displaced
    #[error("Interface {interface} is busy (held by {driver})")]
    InterfaceBusy { interface: u8, driver: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// Neither a usbfs root nor a way to mount one was found
    #[error("No usbfs device root found")]
    NoDeviceRoot,

    #[error("Endpoint {0} is not in use")]
    UnknownEndpoint(EndpointAddress),

    #[error("Request {0:?} is not known")]
    UnknownRequest(RequestId),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Map an errno from operation `op`
    ///
    /// ENODEV always becomes [`Error::NoDevice`] and ETIMEDOUT
    /// [`Error::TimedOut`]; everything else keeps the errno.
    pub fn os(op: &'static str, errno: Errno) -> Self {
        match errno {
            Errno::ENODEV => Error::NoDevice,
            Errno::ETIMEDOUT => Error::TimedOut,
            _ => Error::Os { op, source: errno },
        }
    }

    /// Underlying errno, where there is one
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os { source, .. } => Some(*source),
            Error::NoDevice => Some(Errno::ENODEV),
            Error::WouldBlock => Some(Errno::EAGAIN),
            Error::TimedOut => Some(Errno::ETIMEDOUT),
            Error::InterfaceBusy { .. } => Some(Errno::EBUSY),
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    pub fn is_no_device(&self) -> bool {
        matches!(self, Error::NoDevice)
    }
}

/// Type alias for transport results
pub type Result<T> = std::result::Result<T, Error>;
