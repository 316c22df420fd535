//! Protocol Integration Tests
//!
//! Exercises the public wire structures the way the host transport uses them:
//! - Setup packets for standard, class and vendor requests
//! - Device descriptors from both descriptor sources
//! - String and language descriptors
//!
//! Run with: `cargo test -p protocol`

use protocol::{
    DEVICE_DESCRIPTOR_SIZE, DescriptorOrder, DeviceDescriptor, Direction, EndpointAddress,
    EndpointInfo, ProtocolError, Recipient, RequestType, SETUP_PACKET_SIZE, SetupPacket,
    TransferKind, decode_language_ids, decode_string_descriptor, requests,
};

/// Raw descriptor of a full-speed device, as read from a device node
const RAW_DESCRIPTOR: [u8; DEVICE_DESCRIPTOR_SIZE] = [
    0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x71, 0x1c, 0x05, 0xc0, 0x00, 0x01, 0x01,
    0x02, 0x03, 0x01,
];

fn native(descriptor: &[u8; DEVICE_DESCRIPTOR_SIZE]) -> [u8; DEVICE_DESCRIPTOR_SIZE] {
    let mut bytes = *descriptor;
    for offset in [2, 8, 10, 12] {
        let word = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        bytes[offset..offset + 2].copy_from_slice(&word.to_ne_bytes());
    }
    bytes
}

// ============================================================================
// Setup packets
// ============================================================================

mod setup_packets {
    use super::*;

    #[test]
    fn test_get_device_descriptor() {
        let setup = SetupPacket::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            requests::GET_DESCRIPTOR,
            u16::from(requests::DESCRIPTOR_DEVICE) << 8,
            0,
            DEVICE_DESCRIPTOR_SIZE as u16,
        );
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn test_vendor_interface_read() {
        let setup = SetupPacket::new(
            Direction::In,
            RequestType::Vendor,
            Recipient::Interface,
            0x01,
            0,
            0,
            8,
        );
        assert_eq!(setup.request_type, 0xc1);
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn test_class_endpoint_write() {
        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Class,
            Recipient::Endpoint,
            0x09,
            0x1234,
            0x0081,
            0,
        );
        let bytes = setup.to_bytes();
        assert_eq!(bytes.len(), SETUP_PACKET_SIZE);
        assert_eq!(bytes[0], 0x22);
        assert_eq!(&bytes[2..6], &[0x34, 0x12, 0x81, 0x00]);
        assert_eq!(SetupPacket::from_bytes(&bytes), setup);
    }
}

// ============================================================================
// Device descriptors
// ============================================================================

mod device_descriptors {
    use super::*;

    #[test]
    fn test_both_sources_agree() {
        let from_node = DeviceDescriptor::parse(&RAW_DESCRIPTOR, DescriptorOrder::Little).unwrap();
        let from_cache =
            DeviceDescriptor::parse(&native(&RAW_DESCRIPTOR), DescriptorOrder::Native).unwrap();

        assert_eq!(from_node, from_cache);
        assert_eq!(from_node.vendor_id, 0x1c71);
        assert_eq!(from_node.product_id, 0xc005);
        assert_eq!(from_node.usb_version, 0x0110);
        assert_eq!(from_node.serial_number_index, 3);
    }

    #[test]
    fn test_wire_bytes_reproduced() {
        let descriptor = DeviceDescriptor::parse(&RAW_DESCRIPTOR, DescriptorOrder::Little).unwrap();
        assert_eq!(descriptor.to_bytes(), RAW_DESCRIPTOR);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = RAW_DESCRIPTOR.to_vec();
        bytes.extend_from_slice(&[0x09, 0x02, 0x20, 0x00]);
        let descriptor = DeviceDescriptor::parse(&bytes, DescriptorOrder::Little).unwrap();
        assert_eq!(descriptor.num_configurations, 1);
    }

    #[test]
    fn test_truncated_descriptor() {
        let result = DeviceDescriptor::parse(&RAW_DESCRIPTOR[..8], DescriptorOrder::Little);
        assert_eq!(
            result,
            Err(ProtocolError::BufferTooSmall {
                needed: DEVICE_DESCRIPTOR_SIZE,
                available: 8
            })
        );
    }

    #[test]
    fn test_configuration_descriptor_rejected() {
        let mut bytes = RAW_DESCRIPTOR;
        bytes[1] = 0x02;
        assert!(matches!(
            DeviceDescriptor::parse(&bytes, DescriptorOrder::Little),
            Err(ProtocolError::UnexpectedDescriptorType {
                expected: 0x01,
                actual: 0x02
            })
        ));
    }
}

// ============================================================================
// String descriptors
// ============================================================================

mod string_descriptors {
    use super::*;

    #[test]
    fn test_product_string() {
        let mut bytes = vec![0, 0x03];
        for unit in "Braille Display".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes[0] = bytes.len() as u8;

        assert_eq!(decode_string_descriptor(&bytes).unwrap(), "Braille Display");
    }

    #[test]
    fn test_language_table() {
        let bytes = [0x06, 0x03, 0x09, 0x04, 0x07, 0x04];
        assert_eq!(decode_language_ids(&bytes).unwrap(), vec![0x0409, 0x0407]);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(decode_string_descriptor(&[0x02, 0x03]).unwrap(), "");
    }

    #[test]
    fn test_wrong_type() {
        assert!(decode_string_descriptor(&[0x04, 0x01, 0x41, 0x00]).is_err());
    }
}

// ============================================================================
// Endpoints
// ============================================================================

mod endpoints {
    use super::*;

    #[test]
    fn test_endpoint_info_constructors() {
        let input = EndpointInfo::interrupt(0x81, 8, 10);
        assert!(input.address.is_input());
        assert_eq!(input.address.number(), 1);
        assert_eq!(input.kind, TransferKind::Interrupt);

        let output = EndpointInfo::bulk(0x02, 64);
        assert!(!output.address.is_input());
        assert_eq!(output.address, EndpointAddress::new(2, Direction::Out));
        assert_eq!(output.kind, TransferKind::Bulk);
    }
}
