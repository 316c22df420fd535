//! USB protocol definitions for usbfs-host
//!
//! This crate defines the USB 2.0 chapter-9 structures that the
//! host transport needs to speak to a device: endpoint addressing, transfer
//! kinds, the 8-byte control setup packet and the fixed-size device
//! descriptor. Nothing here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{Direction, Recipient, RequestType, SetupPacket, requests};
//!
//! let setup = SetupPacket::new(
//!     Direction::In,
//!     RequestType::Standard,
//!     Recipient::Device,
//!     requests::GET_DESCRIPTOR,
//!     0x0100,
//!     0,
//!     18,
//! );
//!
//! assert_eq!(setup.request_type, 0x80);
//! assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
//! ```

pub mod descriptor;
pub mod error;
pub mod setup;
pub mod types;

pub use descriptor::{
    DEVICE_DESCRIPTOR_SIZE, DescriptorOrder, DeviceDescriptor, decode_language_ids,
    decode_string_descriptor,
};
pub use error::{ProtocolError, Result};
pub use setup::{SETUP_PACKET_SIZE, SetupPacket, requests};
pub use types::{
    Direction, EndpointAddress, EndpointInfo, Recipient, RequestType, TransferKind, hex_dump,
};
