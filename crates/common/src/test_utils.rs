//! Test utilities for usbfs-host
//!
//! Provides fixture builders shared by the tests of every crate: raw device
//! descriptors and fake usbfs / sysfs trees laid out under a scratch
//! directory.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_device_descriptor;
//!
//! let bytes = create_device_descriptor(0x0403, 0x6001);
//! assert_eq!(bytes[8..10], [0x03, 0x04]);
//! ```

use protocol::{DEVICE_DESCRIPTOR_SIZE, DeviceDescriptor};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceDescriptor for testing
pub fn create_mock_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        length: DEVICE_DESCRIPTOR_SIZE as u8,
        descriptor_type: 0x01,
        usb_version: 0x0200,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        device_version: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 3,
        num_configurations: 1,
    }
}

/// Raw little-endian device descriptor bytes, as read from a usbfs node
pub fn create_device_descriptor(vendor_id: u16, product_id: u16) -> [u8; DEVICE_DESCRIPTOR_SIZE] {
    create_mock_descriptor(vendor_id, product_id).to_bytes()
}

/// Same descriptor with the multi-byte fields in host order
pub fn create_native_descriptor(vendor_id: u16, product_id: u16) -> [u8; DEVICE_DESCRIPTOR_SIZE] {
    let desc = create_mock_descriptor(vendor_id, product_id);
    let mut bytes = desc.to_bytes();
    bytes[2..4].copy_from_slice(&desc.usb_version.to_ne_bytes());
    bytes[8..10].copy_from_slice(&vendor_id.to_ne_bytes());
    bytes[10..12].copy_from_slice(&product_id.to_ne_bytes());
    bytes[12..14].copy_from_slice(&desc.device_version.to_ne_bytes());
    bytes
}

/// String descriptor bytes for `text` (UTF-16LE with header)
pub fn create_string_descriptor(text: &str) -> Vec<u8> {
    let mut bytes = vec![0u8, 0x03];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes[0] = bytes.len() as u8;
    bytes
}

/// A fake usbfs tree: `<root>/<bus:03>/<device:03>` files holding descriptors
pub struct UsbfsTree {
    root: PathBuf,
}

impl UsbfsTree {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add a device node holding `descriptor`
    pub fn add_device(&self, bus: u8, device: u8, descriptor: &[u8]) -> io::Result<PathBuf> {
        let bus_dir = self.root.join(format!("{:03}", bus));
        fs::create_dir_all(&bus_dir)?;
        let path = bus_dir.join(format!("{:03}", device));
        fs::write(&path, descriptor)?;
        Ok(path)
    }

    /// Add a non-numeric entry that enumeration must ignore
    pub fn add_noise(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.root.join(name);
        fs::write(&path, b"noise")?;
        Ok(path)
    }
}

/// A fake sysfs device directory holding `descriptors` and `power/`
pub fn create_sysfs_device(dir: &Path, descriptor: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir.join("power"))?;
    fs::write(dir.join("descriptors"), descriptor)?;
    fs::write(dir.join("power").join("control"), b"auto\n")?;
    Ok(dir.to_path_buf())
}

/// A fake mount table in /proc/mounts format
pub fn create_mounts_file(path: &Path, entries: &[(&str, &Path, &str)]) -> io::Result<()> {
    let mut content = String::new();
    for (device, mount_point, fs_type) in entries {
        content.push_str(&format!(
            "{} {} {} rw,relatime 0 0\n",
            device,
            mount_point.display().to_string().replace(' ', "\\040"),
            fs_type
        ));
    }
    fs::write(path, content)
}
