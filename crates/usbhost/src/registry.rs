//! Device enumeration
//!
//! The registry walks the usbfs tree once, on first use, and remembers what
//! it found until told to forget. Nodes that cannot be read are skipped.

use crate::error::Result;
use crate::probe::{USBFS, locate_device_root};
use common::config::UsbfsSettings;
use protocol::{DEVICE_DESCRIPTOR_SIZE, DescriptorOrder, DeviceDescriptor};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// A USB device exposed by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    usbfs_path: PathBuf,
    sysfs_path: Option<PathBuf>,
    bus: Option<u16>,
    device: Option<u16>,
    descriptor: DeviceDescriptor,
}

impl HostDevice {
    pub fn new(usbfs_path: PathBuf, sysfs_path: Option<PathBuf>, descriptor: DeviceDescriptor) -> Self {
        let (bus, device) = match bus_device_numbers(&usbfs_path) {
            Some((bus, device)) => (Some(bus), Some(device)),
            None => (None, None),
        };
        Self {
            usbfs_path,
            sysfs_path,
            bus,
            device,
            descriptor,
        }
    }

    /// The device node
    pub fn usbfs_path(&self) -> &Path {
        &self.usbfs_path
    }

    /// The sysfs directory of the device, if one was found
    pub fn sysfs_path(&self) -> Option<&Path> {
        self.sysfs_path.as_deref()
    }

    pub fn bus(&self) -> Option<u16> {
        self.bus
    }

    pub fn device(&self) -> Option<u16> {
        self.device
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    /// Keep the device from being autosuspended
    ///
    /// Writes `on` to `power/control`, or failing that `-1` to
    /// `power/autosuspend`. Returns whether either write took.
    pub fn disable_autosuspend(&self) -> bool {
        let Some(sysfs) = &self.sysfs_path else {
            debug!("No sysfs path for {}, autosuspend left alone", self.usbfs_path.display());
            return false;
        };

        for (attribute, value) in [("power/control", "on"), ("power/autosuspend", "-1")] {
            let path = sysfs.join(attribute);
            let written = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&path)
                .and_then(|mut file| file.write_all(value.as_bytes()));
            match written {
                Ok(()) => {
                    debug!("Autosuspend disabled via {}", path.display());
                    return true;
                }
                Err(e) => debug!("Cannot write {}: {}", path.display(), e),
            }
        }
        false
    }
}

/// Bus and device numbers from the last two components of a node path
pub fn bus_device_numbers(path: &Path) -> Option<(u16, u16)> {
    let mut components = path.iter().rev();
    let device = components.next()?.to_str()?.parse().ok()?;
    let bus = components.next()?.to_str()?.parse().ok()?;
    Some((bus, device))
}

/// Resolve the sysfs directory of a device from path templates
///
/// `{bus}` and `{device}` are replaced by the numbers, `{minor}` by the
/// usb_device character minor. The first template naming an existing path
/// wins.
pub fn sysfs_path_for(bus: u16, device: u16, templates: &[String]) -> Option<PathBuf> {
    if bus == 0 || device == 0 {
        return None;
    }
    let minor = ((u32::from(bus) - 1) << 7) | (u32::from(device) - 1);

    templates.iter().find_map(|template| {
        let path = PathBuf::from(
            template
                .replace("{bus}", &bus.to_string())
                .replace("{device}", &device.to_string())
                .replace("{minor}", &minor.to_string()),
        );
        if !path.exists() {
            return None;
        }
        trace!("sysfs path for {}/{}: {}", bus, device, path.display());
        Some(fs::canonicalize(&path).unwrap_or(path))
    })
}

/// Build the [`HostDevice`] for one device node
///
/// The descriptor comes from the sysfs `descriptors` cache when there is one
/// (fields in host order), else from the node itself (little-endian).
pub fn read_host_descriptor(usbfs_path: &Path, sysfs_templates: &[String]) -> Result<HostDevice> {
    let mut node = File::open(usbfs_path)?;

    let sysfs_path = bus_device_numbers(usbfs_path)
        .and_then(|(bus, device)| sysfs_path_for(bus, device, sysfs_templates));

    let mut bytes = [0u8; DEVICE_DESCRIPTOR_SIZE];
    let cached = sysfs_path.as_ref().and_then(|sysfs| {
        let mut file = File::open(sysfs.join("descriptors")).ok()?;
        file.read_exact(&mut bytes).ok()
    });

    let descriptor = match cached {
        Some(()) => DeviceDescriptor::parse(&bytes, DescriptorOrder::Native)?,
        None => {
            node.read_exact(&mut bytes)?;
            DeviceDescriptor::parse(&bytes, DescriptorOrder::Little)?
        }
    };

    Ok(HostDevice::new(usbfs_path.to_path_buf(), sysfs_path, descriptor))
}

/// Lazily built list of host devices
#[derive(Debug)]
pub struct HostRegistry {
    settings: UsbfsSettings,
    root: Option<PathBuf>,
    devices: Option<Vec<Arc<HostDevice>>>,
}

impl HostRegistry {
    /// Registry that locates its root on first use
    pub fn new(settings: UsbfsSettings) -> Self {
        Self {
            settings,
            root: None,
            devices: None,
        }
    }

    /// Registry over a known root
    pub fn with_root(root: PathBuf, settings: UsbfsSettings) -> Self {
        Self {
            settings,
            root: Some(root),
            devices: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.devices.is_some()
    }

    /// The device root, located if not known yet
    pub fn root(&mut self) -> Option<&Path> {
        if self.root.is_none() {
            self.root = locate_device_root(&USBFS, &self.settings);
        }
        self.root.as_deref()
    }

    /// Devices in discovery order, enumerating on first use
    pub fn devices(&mut self) -> &[Arc<HostDevice>] {
        if self.devices.is_none() {
            self.refresh();
        }
        self.devices.as_deref().unwrap_or_default()
    }

    /// Enumerate again, replacing what was known
    pub fn refresh(&mut self) -> &[Arc<HostDevice>] {
        let mut found = Vec::new();
        match self.root().map(Path::to_path_buf) {
            Some(root) => {
                walk(&root, &self.settings.sysfs_templates, &mut found);
                info!("Found {} USB devices under {}", found.len(), root.display());
            }
            None => debug!("No USB device root, no devices"),
        }
        self.devices.insert(found)
    }

    /// Drop the device list; the next use enumerates again
    pub fn forget(&mut self) {
        if self.devices.take().is_some() {
            debug!("Forgot USB devices");
        }
    }
}

fn is_numeric(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn walk(dir: &Path, templates: &[String], found: &mut Vec<Arc<HostDevice>>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read {}: {}", dir.display(), e);
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_numeric))
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            walk(&path, templates, found);
            continue;
        }
        match read_host_descriptor(&path, templates) {
            Ok(device) => {
                debug!(
                    "USB device {}: {:04x}:{:04x}",
                    path.display(),
                    device.vendor_id(),
                    device.product_id()
                );
                found.push(Arc::new(device));
            }
            Err(e) => debug!("Skipping USB device {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_device_descriptor, create_native_descriptor, create_sysfs_device};

    #[test]
    fn test_bus_device_numbers() {
        assert_eq!(bus_device_numbers(Path::new("/dev/bus/usb/003/012")), Some((3, 12)));
        assert_eq!(bus_device_numbers(Path::new("/dev/bus/usb/devices")), None);
    }

    #[test]
    fn test_sysfs_template_substitution() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("char").join("189:130")).unwrap();
        let templates = vec![
            format!("{}/missing/{{bus}}-{{device}}", dir.path().display()),
            format!("{}/char/189:{{minor}}", dir.path().display()),
        ];

        // bus 2, device 3: ((2-1) << 7) | (3-1) = 130
        let path = sysfs_path_for(2, 3, &templates).unwrap();
        assert!(path.ends_with("189:130"));
        assert_eq!(sysfs_path_for(0, 3, &templates), None);
    }

    #[test]
    fn test_descriptor_source_and_byte_order() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("usb").join("001");
        fs::create_dir_all(&node_dir).unwrap();
        let node = node_dir.join("005");
        fs::write(&node, create_device_descriptor(0x1111, 0x2222)).unwrap();

        let plain = read_host_descriptor(&node, &[]).unwrap();
        assert_eq!(plain.vendor_id(), 0x1111);
        assert!(plain.sysfs_path().is_none());

        let sysfs = dir.path().join("sys").join("usbdev1.5");
        create_sysfs_device(&sysfs, &create_native_descriptor(0x3333, 0x4444)).unwrap();
        let templates = vec![format!("{}/sys/usbdev{{bus}}.{{device}}", dir.path().display())];

        let cached = read_host_descriptor(&node, &templates).unwrap();
        assert_eq!(cached.vendor_id(), 0x3333);
        assert_eq!(cached.product_id(), 0x4444);
        assert_eq!(cached.bus(), Some(1));
        assert_eq!(cached.device(), Some(5));
    }

    #[test]
    fn test_is_numeric() {
        assert!(is_numeric("001"));
        assert!(!is_numeric("devices"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("1a"));
    }
}
