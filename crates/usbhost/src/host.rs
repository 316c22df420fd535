//! Host front door: configuration, registry and device selection

use crate::device::{DeviceHandle, TransferOptions};
use crate::error::Result;
use crate::io::{DeviceOpener, UsbfsOpener};
use crate::registry::{HostDevice, HostRegistry};
use common::{DeviceFilter, HostConfig};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for finding and opening USB devices
pub struct UsbHost {
    registry: HostRegistry,
    opener: Rc<dyn DeviceOpener>,
    options: TransferOptions,
    filters: Vec<DeviceFilter>,
}

impl UsbHost {
    /// Host using the real usbfs device nodes
    pub fn new(config: &HostConfig) -> Result<Self> {
        Self::with_opener(config, Rc::new(UsbfsOpener))
    }

    /// Host opening devices through `opener`
    pub fn with_opener(config: &HostConfig, opener: Rc<dyn DeviceOpener>) -> Result<Self> {
        let filters = config.device_filters()?;
        let options = TransferOptions::from_settings(&config.transfer);
        info!(
            "USB host: monitor={:?}, input_requests={}, {} filters",
            options.monitor,
            options.input_requests,
            filters.len()
        );

        Ok(Self {
            registry: HostRegistry::new(config.usbfs.clone()),
            opener,
            options,
            filters,
        })
    }

    /// Replace the registry (e.g. one over a known root)
    pub fn with_registry(mut self, registry: HostRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// The usbfs device root, if there is one
    pub fn device_root(&mut self) -> Option<PathBuf> {
        self.registry.root().map(PathBuf::from)
    }

    /// All known devices, enumerating on first use
    pub fn devices(&mut self) -> Vec<Arc<HostDevice>> {
        self.registry.devices().to_vec()
    }

    /// Enumerate again on next use
    pub fn forget_devices(&mut self) {
        self.registry.forget();
    }

    /// Offer each device, in discovery order, to `chooser`
    ///
    /// The chooser gets a fresh handle it may use to inspect the device;
    /// the first handle it accepts is returned and the others are closed.
    pub fn find_device<F>(&mut self, mut chooser: F) -> Option<DeviceHandle>
    where
        F: FnMut(&mut DeviceHandle) -> bool,
    {
        for host in self.devices() {
            let mut handle = DeviceHandle::new(host, Rc::clone(&self.opener), self.options);
            if chooser(&mut handle) {
                debug!("Chose USB device {}", handle.host().usbfs_path().display());
                return Some(handle);
            }
            handle.close();
        }
        debug!("No USB device chosen");
        None
    }

    /// Like [`Self::find_device`], offering only devices that pass the
    /// configured filters
    pub fn find_matching<F>(&mut self, mut chooser: F) -> Option<DeviceHandle>
    where
        F: FnMut(&mut DeviceHandle) -> bool,
    {
        let filters = self.filters.clone();
        self.find_device(|handle| {
            let descriptor = handle.descriptor();
            if !DeviceFilter::any_matches(&filters, descriptor.vendor_id, descriptor.product_id) {
                return false;
            }
            chooser(handle)
        })
    }
}
