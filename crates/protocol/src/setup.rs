//! Control transfer setup packet

use crate::types::{Direction, Recipient, RequestType};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of a setup packet on the wire
pub const SETUP_PACKET_SIZE: usize = 8;

/// Standard request codes (bRequest) and descriptor types
pub mod requests {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0a;
    pub const SET_INTERFACE: u8 = 0x0b;

    pub const DESCRIPTOR_DEVICE: u8 = 0x01;
    pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
    pub const DESCRIPTOR_STRING: u8 = 0x03;
}

/// Standard 8-byte setup packet
///
/// Multi-byte fields are held in host order and always serialized
/// little-endian, whatever the host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    pub fn new(
        direction: Direction,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: direction.bits() | request_type.bits() | recipient.bits(),
            request,
            value,
            index,
            length,
        }
    }

    /// Direction encoded in bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & Direction::MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Wire representation
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        LittleEndian::write_u16(&mut bytes[2..4], self.value);
        LittleEndian::write_u16(&mut bytes[4..6], self.index);
        LittleEndian::write_u16(&mut bytes[6..8], self.length);
        bytes
    }

    /// Parse the wire representation
    pub fn from_bytes(bytes: &[u8; SETUP_PACKET_SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_bits() {
        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Vendor,
            Recipient::Interface,
            0x01,
            0,
            0,
            0,
        );
        assert_eq!(setup.request_type, 0x41);
        assert_eq!(setup.direction(), Direction::Out);

        let setup = SetupPacket::new(
            Direction::In,
            RequestType::Class,
            Recipient::Endpoint,
            0x01,
            0,
            0,
            0,
        );
        assert_eq!(setup.request_type, 0xa2);
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn test_fields_are_little_endian() {
        let setup = SetupPacket {
            request_type: 0xc0,
            request: 0x33,
            value: 0x1234,
            index: 0xabcd,
            length: 0x0102,
        };
        assert_eq!(
            setup.to_bytes(),
            [0xc0, 0x33, 0x34, 0x12, 0xcd, 0xab, 0x02, 0x01]
        );
        assert_eq!(SetupPacket::from_bytes(&setup.to_bytes()), setup);
    }
}
