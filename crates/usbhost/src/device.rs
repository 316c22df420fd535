//! Device handle lifecycle
//!
//! A [`DeviceHandle`] is one session with one [`HostDevice`]. The device node
//! is opened lazily on the first operation that needs it and closed by
//! [`DeviceHandle::close`] (or on drop), which also tears down endpoint
//! state, gives back claimed interfaces and reattaches kernel drivers this
//! session displaced.

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::io::{DeviceOpener, UsbfsIo};
use crate::monitor::OutputMonitor;
use crate::registry::HostDevice;
use crate::request::{RequestId, TransferRequest};
use common::MonitorStrategy;
use common::config::TransferSettings;
use nix::errno::Errno;
use protocol::{
    DeviceDescriptor, EndpointAddress, EndpointInfo, Recipient, RequestType, decode_language_ids,
    decode_string_descriptor, requests,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for descriptor requests issued by the handle itself
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(1000);

/// Largest descriptor a device may return (bLength is one byte)
const MAX_DESCRIPTOR_SIZE: usize = 255;

/// Transforms every input buffer before delivery
pub type InputFilter = Box<dyn FnMut(&mut Vec<u8>) -> Result<()>>;

/// Engine tuning resolved from [`TransferSettings`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub monitor: MonitorStrategy,
    /// Input requests kept in flight per monitored endpoint
    pub input_requests: usize,
    /// Delay between non-blocking reaps while cancelling
    pub cancel_poll: Duration,
}

impl TransferOptions {
    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self {
            monitor: settings.monitor.unwrap_or_else(Self::default_strategy),
            input_requests: settings.input_requests.max(1),
            cancel_poll: Duration::from_millis(settings.cancel_poll_ms),
        }
    }

    /// Strategy used when the configuration does not name one
    pub fn default_strategy() -> MonitorStrategy {
        if cfg!(feature = "signal-monitor") {
            MonitorStrategy::Signal
        } else {
            MonitorStrategy::OutputReady
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_settings(&TransferSettings::default())
    }
}

/// An open session with one USB device
pub struct DeviceHandle {
    pub(crate) host: Arc<HostDevice>,
    opener: Rc<dyn DeviceOpener>,
    pub(crate) options: TransferOptions,
    pub(crate) io: Option<Rc<dyn UsbfsIo>>,
    pub(crate) endpoints: BTreeMap<EndpointAddress, EndpointHandle>,
    /// Records currently in kernel custody
    pub(crate) in_flight: HashMap<RequestId, *mut TransferRequest>,
    next_request: u64,
    pub(crate) output_monitor: Option<OutputMonitor>,
    pub(crate) filters: Vec<InputFilter>,
    pub(crate) claimed: BTreeSet<u8>,
    pub(crate) detached: BTreeSet<u8>,
    language: Option<u16>,
}

impl DeviceHandle {
    pub fn new(host: Arc<HostDevice>, opener: Rc<dyn DeviceOpener>, options: TransferOptions) -> Self {
        Self {
            host,
            opener,
            options,
            io: None,
            endpoints: BTreeMap::new(),
            in_flight: HashMap::new(),
            next_request: 1,
            output_monitor: None,
            filters: Vec::new(),
            claimed: BTreeSet::new(),
            detached: BTreeSet::new(),
            language: None,
        }
    }

    pub fn host(&self) -> &Arc<HostDevice> {
        &self.host
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.host.descriptor()
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Open the device node if it is not open yet
    pub fn ensure_open(&mut self) -> Result<()> {
        if self.io.is_none() {
            let io = self.opener.open(&self.host).map_err(|e| {
                debug!(
                    "Cannot open USB device {}: {}",
                    self.host.usbfs_path().display(),
                    e
                );
                match e.errno() {
                    // The node went away with the device.
                    Some(Errno::ENOENT | Errno::ENODEV) => Error::NoDevice,
                    _ => e,
                }
            })?;
            self.io = Some(Rc::from(io));
            debug!("Opened USB device {}", self.host.usbfs_path().display());
        }
        Ok(())
    }

    pub(crate) fn open_io(&mut self) -> Result<Rc<dyn UsbfsIo>> {
        self.ensure_open()?;
        self.io.clone().ok_or(Error::NoDevice)
    }

    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    /// Number of requests held by the kernel
    pub fn pending_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of completed records waiting on an endpoint
    pub fn queued(&self, address: EndpointAddress) -> usize {
        self.endpoints
            .get(&address)
            .map(EndpointHandle::completed_len)
            .unwrap_or(0)
    }

    /// Close the session
    ///
    /// Monitors are stopped, outstanding requests cancelled, claimed
    /// interfaces released and displaced kernel drivers reattached. Closing
    /// a closed handle does nothing.
    pub fn close(&mut self) {
        let Some(io) = self.io.clone() else {
            return;
        };

        let monitored: Vec<EndpointAddress> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.is_monitored())
            .map(|(address, _)| *address)
            .collect();
        for address in monitored {
            if let Err(e) = self.stop_monitor(address) {
                debug!("Stopping monitor on endpoint {} failed: {}", address, e);
            }
        }

        let outstanding: Vec<RequestId> = self.in_flight.keys().copied().collect();
        for id in outstanding {
            if let Err(e) = self.cancel(id) {
                debug!("Cancelling request {:?} failed: {}", id, e);
            }
        }

        for endpoint in self.endpoints.values() {
            endpoint.drain();
        }
        self.endpoints.clear();
        self.output_monitor = None;

        self.release_interfaces(io.as_ref());
        drop(io);
        self.io = None;

        // `io` was the last reference to the node, so closing it made the
        // kernel drop whatever requests failed to cancel.
        for (_, request) in self.in_flight.drain() {
            drop(unsafe { Box::from_raw(request) });
        }

        debug!("Closed USB device {}", self.host.usbfs_path().display());
    }

    fn release_interfaces(&mut self, io: &dyn UsbfsIo) {
        for interface in std::mem::take(&mut self.claimed) {
            match io.release_interface(interface) {
                Ok(()) | Err(Errno::ENODEV) => debug!("Released USB interface {}", interface),
                Err(e) => warn!("Failed to release USB interface {}: {}", interface, e),
            }
        }

        for interface in std::mem::take(&mut self.detached) {
            match io.connect_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to USB interface {}", interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to USB interface {}: {}",
                    interface, e
                ),
            }
        }
    }

    /// Register a filter run on every input buffer, after those already
    /// registered
    pub fn add_input_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&mut Vec<u8>) -> Result<()> + 'static,
    {
        self.filters.push(Box::new(filter));
    }

    pub(crate) fn apply_filters(&mut self, data: &mut Vec<u8>) -> Result<()> {
        for filter in &mut self.filters {
            filter(data)?;
        }
        Ok(())
    }

    pub(crate) fn endpoint_entry(&mut self, info: EndpointInfo) -> Result<&mut EndpointHandle> {
        if !self.endpoints.contains_key(&info.address) {
            let endpoint = EndpointHandle::new(info)?;
            self.endpoints.insert(info.address, endpoint);
        }
        self.endpoints
            .get_mut(&info.address)
            .ok_or(Error::UnknownEndpoint(info.address))
    }

    /// Best-effort: keep the device from being autosuspended
    pub fn disable_autosuspend(&self) -> bool {
        self.host.disable_autosuspend()
    }

    /// GET_DESCRIPTOR into `buffer`; returns the number of bytes read
    pub fn get_descriptor(
        &mut self,
        descriptor_type: u8,
        index: u8,
        language: u16,
        buffer: &mut [u8],
    ) -> Result<usize> {
        self.control_read(
            Recipient::Device,
            RequestType::Standard,
            requests::GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            language,
            buffer,
            DESCRIPTOR_TIMEOUT,
        )
    }

    /// Read string descriptor `index` in the device's first language
    pub fn read_string(&mut self, index: u8) -> Result<String> {
        let mut buffer = [0u8; MAX_DESCRIPTOR_SIZE];

        let language = match self.language {
            Some(language) => language,
            None => {
                let count = self.get_descriptor(requests::DESCRIPTOR_STRING, 0, 0, &mut buffer)?;
                let language = decode_language_ids(&buffer[..count])?
                    .first()
                    .copied()
                    .ok_or(Error::Unsupported("device has no string languages"))?;
                self.language = Some(language);
                language
            }
        };

        let count = self.get_descriptor(requests::DESCRIPTOR_STRING, index, language, &mut buffer)?;
        Ok(decode_string_descriptor(&buffer[..count])?)
    }

    /// The serial number string, if the device declares one
    pub fn serial_number(&mut self) -> Result<Option<String>> {
        match self.descriptor().serial_number_index {
            0 => Ok(None),
            index => self.read_string(index).map(Some),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.host.usbfs_path())
            .field("open", &self.is_open())
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
