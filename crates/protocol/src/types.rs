//! USB type definitions
//!
//! This module defines the addressing and classification types shared by the
//! host transport: endpoint addresses with their direction bit, transfer
//! kinds as encoded in bmAttributes, and the request type/recipient fields of
//! bmRequestType.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer direction, as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction bit as it appears in endpoint addresses and bmRequestType
    pub const MASK: u8 = 0x80;

    /// Bit pattern for this direction
    pub fn bits(self) -> u8 {
        match self {
            Direction::Out => 0x00,
            Direction::In => Self::MASK,
        }
    }
}

/// Endpoint address (bEndpointAddress)
///
/// Bit 7 is the direction, bits 0-3 the endpoint number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// The default control endpoint
    pub const CONTROL: EndpointAddress = EndpointAddress(0);

    /// Build an address from an endpoint number and direction
    pub fn new(number: u8, direction: Direction) -> Self {
        Self((number & 0x0f) | direction.bits())
    }

    /// Endpoint number without the direction bit
    pub fn number(self) -> u8 {
        self.0 & 0x0f
    }

    /// Direction encoded in bit 7
    pub fn direction(self) -> Direction {
        if self.0 & Direction::MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_input(self) -> bool {
        self.direction() == Direction::In
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl From<u8> for EndpointAddress {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Endpoint transfer type (bmAttributes bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode from an endpoint descriptor's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

/// Request type (bmRequestType bits 5-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

impl RequestType {
    pub fn bits(self) -> u8 {
        match self {
            RequestType::Standard => 0x00,
            RequestType::Class => 0x20,
            RequestType::Vendor => 0x40,
        }
    }
}

/// Request recipient (bmRequestType bits 0-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl Recipient {
    pub fn bits(self) -> u8 {
        match self {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
            Recipient::Other => 0x03,
        }
    }
}

/// What the transport needs to know about an endpoint
///
/// Endpoint descriptors are not parsed by the transport; callers describe the
/// endpoints they use (usually straight from their own descriptor knowledge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit
    pub address: EndpointAddress,
    /// Transfer type of the endpoint
    pub kind: TransferKind,
    /// wMaxPacketSize, used to size input requests
    pub max_packet_size: u16,
    /// bInterval, in milliseconds for full/low speed interrupt endpoints
    pub interval: u8,
}

impl EndpointInfo {
    pub fn bulk(address: u8, max_packet_size: u16) -> Self {
        Self {
            address: EndpointAddress(address),
            kind: TransferKind::Bulk,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn interrupt(address: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: EndpointAddress(address),
            kind: TransferKind::Interrupt,
            max_packet_size,
            interval,
        }
    }
}

/// Format bytes as space separated hex for payload logging
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        // Bit 7 = 1 means IN endpoint
        let endpoint_in = EndpointAddress(0x81);
        assert_eq!(endpoint_in.direction(), Direction::In);
        assert_eq!(endpoint_in.number(), 1);

        // Bit 7 = 0 means OUT endpoint
        let endpoint_out = EndpointAddress(0x02);
        assert_eq!(endpoint_out.direction(), Direction::Out);
        assert!(!endpoint_out.is_input());
    }

    #[test]
    fn test_endpoint_new() {
        assert_eq!(EndpointAddress::new(3, Direction::In), EndpointAddress(0x83));
        assert_eq!(EndpointAddress::new(0x13, Direction::Out), EndpointAddress(0x03));
        assert_eq!(EndpointAddress(0x81).to_string(), "0x81");
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(TransferKind::from_attributes(0x0d), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[]), "");
        assert_eq!(hex_dump(&[0x1b, 0x00, 0xff]), "1B 00 FF");
    }
}
