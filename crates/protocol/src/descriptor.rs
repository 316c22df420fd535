//! Device and string descriptors
//!
//! Only the fixed-size device descriptor is decoded; configuration, interface
//! and endpoint descriptors belong to the drivers that need them.

use crate::error::{ProtocolError, Result};
use crate::setup::requests::{DESCRIPTOR_DEVICE, DESCRIPTOR_STRING};
use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use serde::{Deserialize, Serialize};

/// Size of a device descriptor in bytes
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// Byte order of the multi-byte fields in a raw descriptor source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorOrder {
    /// Straight off the wire (usbfs device node)
    Little,
    /// Already converted to host order (descriptor cache)
    Native,
}

/// Standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Decode a raw device descriptor
    ///
    /// `order` states how the bcdUSB, idVendor, idProduct and bcdDevice
    /// fields are laid out in `bytes`.
    pub fn parse(bytes: &[u8], order: DescriptorOrder) -> Result<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: DEVICE_DESCRIPTOR_SIZE,
                available: bytes.len(),
            });
        }

        if bytes[1] != DESCRIPTOR_DEVICE {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: DESCRIPTOR_DEVICE,
                actual: bytes[1],
            });
        }

        if (bytes[0] as usize) < DEVICE_DESCRIPTOR_SIZE {
            return Err(ProtocolError::InvalidDescriptorLength {
                length: bytes[0],
                available: bytes.len(),
            });
        }

        let word = |offset: usize| match order {
            DescriptorOrder::Little => LittleEndian::read_u16(&bytes[offset..offset + 2]),
            DescriptorOrder::Native => NativeEndian::read_u16(&bytes[offset..offset + 2]),
        };

        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            usb_version: word(2),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: word(8),
            product_id: word(10),
            device_version: word(12),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Wire (little-endian) representation
    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_SIZE] {
        let mut bytes = [0u8; DEVICE_DESCRIPTOR_SIZE];
        bytes[0] = self.length;
        bytes[1] = self.descriptor_type;
        LittleEndian::write_u16(&mut bytes[2..4], self.usb_version);
        bytes[4] = self.class;
        bytes[5] = self.subclass;
        bytes[6] = self.protocol;
        bytes[7] = self.max_packet_size0;
        LittleEndian::write_u16(&mut bytes[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut bytes[10..12], self.product_id);
        LittleEndian::write_u16(&mut bytes[12..14], self.device_version);
        bytes[14] = self.manufacturer_index;
        bytes[15] = self.product_index;
        bytes[16] = self.serial_number_index;
        bytes[17] = self.num_configurations;
        bytes
    }
}

/// Decode a string descriptor (UTF-16LE after the 2-byte header)
///
/// String index 0 carries language IDs rather than text; use
/// [`decode_language_ids`] for it.
pub fn decode_string_descriptor(bytes: &[u8]) -> Result<String> {
    let units = string_units(bytes)?;
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidString)
}

/// Decode the language ID table carried by string descriptor 0
pub fn decode_language_ids(bytes: &[u8]) -> Result<Vec<u16>> {
    string_units(bytes)
}

fn string_units(bytes: &[u8]) -> Result<Vec<u16>> {
    if bytes.len() < 2 {
        return Err(ProtocolError::BufferTooSmall {
            needed: 2,
            available: bytes.len(),
        });
    }

    if bytes[1] != DESCRIPTOR_STRING {
        return Err(ProtocolError::UnexpectedDescriptorType {
            expected: DESCRIPTOR_STRING,
            actual: bytes[1],
        });
    }

    let length = bytes[0] as usize;
    if length < 2 || length > bytes.len() || length % 2 != 0 {
        return Err(ProtocolError::InvalidDescriptorLength {
            length: bytes[0],
            available: bytes.len(),
        });
    }

    Ok(bytes[2..length]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> [u8; DEVICE_DESCRIPTOR_SIZE] {
        [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x03, 0x04, 0x01, 0x60, 0x00, 0x06,
            0x01, 0x02, 0x03, 0x01,
        ]
    }

    #[test]
    fn test_parse_little_endian() {
        let desc = DeviceDescriptor::parse(&sample(), DescriptorOrder::Little).unwrap();
        assert_eq!(desc.vendor_id, 0x0403);
        assert_eq!(desc.product_id, 0x6001);
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.device_version, 0x0600);
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.serial_number_index, 3);
        assert_eq!(desc.to_bytes(), sample());
    }

    #[test]
    fn test_parse_native_order() {
        let mut bytes = sample();
        bytes[8..10].copy_from_slice(&0x0403u16.to_ne_bytes());
        bytes[10..12].copy_from_slice(&0x6001u16.to_ne_bytes());
        let desc = DeviceDescriptor::parse(&bytes, DescriptorOrder::Native).unwrap();
        assert_eq!(desc.vendor_id, 0x0403);
        assert_eq!(desc.product_id, 0x6001);
    }

    #[test]
    fn test_parse_rejects_short_and_wrong_type() {
        assert_eq!(
            DeviceDescriptor::parse(&sample()[..8], DescriptorOrder::Little),
            Err(ProtocolError::BufferTooSmall {
                needed: 18,
                available: 8
            })
        );

        let mut bytes = sample();
        bytes[1] = 0x02;
        assert!(matches!(
            DeviceDescriptor::parse(&bytes, DescriptorOrder::Little),
            Err(ProtocolError::UnexpectedDescriptorType { actual: 0x02, .. })
        ));
    }

    #[test]
    fn test_decode_string_descriptor() {
        let bytes = [0x0a, 0x03, b'B', 0, b'r', 0, b'l', 0, b'1', 0, 0xff];
        assert_eq!(decode_string_descriptor(&bytes).unwrap(), "Brl1");

        let odd = [0x05, 0x03, b'B', 0, b'r'];
        assert!(decode_string_descriptor(&odd).is_err());
    }

    #[test]
    fn test_decode_language_ids() {
        let bytes = [0x04, 0x03, 0x09, 0x04];
        assert_eq!(decode_language_ids(&bytes).unwrap(), vec![0x0409]);
    }
}
