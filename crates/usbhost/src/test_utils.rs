//! Test utilities for the transport
//!
//! [`MockUsbfs`] is an in-memory stand-in for one usbfs device node. It
//! keeps submitted URBs by raw pointer the way the kernel does, completes
//! input URBs from queued data, completes output URBs at once, and can be
//! scripted to report busy interfaces, refuse bulk-typed URBs on interrupt
//! endpoints, or vanish from the bus.
//!
//! # Example
//!
//! ```
//! use protocol::EndpointInfo;
//! use usbhost::test_utils::MockUsbfs;
//!
//! let mock = MockUsbfs::new();
//! let mut handle = mock.handle();
//! handle.submit(EndpointInfo::bulk(0x81, 8), vec![0; 8], 0).unwrap();
//! mock.push_input(0x81, b"hi");
//! assert_eq!(handle.reap(false).unwrap().map(|ep| ep.0), Some(0x81));
//! ```

use crate::device::{DeviceHandle, TransferOptions};
use crate::error::{Error, Result};
use crate::io::{DeviceOpener, UsbfsIo};
use crate::registry::HostDevice;
use crate::sys;
use common::test_utils::create_mock_descriptor;
use nix::errno::Errno;
use nix::libc::{self, c_int};
use protocol::{Direction, SetupPacket};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::slice;
use std::sync::Arc;

/// Vendor and product of the device returned by [`MockUsbfs::host_device`]
pub const MOCK_VENDOR_ID: u16 = 0x1c71;
pub const MOCK_PRODUCT_ID: u16 = 0xc005;

#[derive(Default)]
struct MockState {
    submitted: VecDeque<*mut sys::Urb>,
    completed: VecDeque<*mut sys::Urb>,
    input: HashMap<u8, VecDeque<Vec<u8>>>,
    output: Vec<(u8, Vec<u8>)>,
    control_responses: VecDeque<Vec<u8>>,
    control_log: Vec<(SetupPacket, Vec<u8>)>,
    interrupt_only: BTreeSet<u8>,
    submit_attempts: Vec<(u8, u8)>,
    holders: HashMap<u8, String>,
    sticky_holders: BTreeSet<u8>,
    claimed: BTreeSet<u8>,
    claim_attempts: usize,
    disconnects: Vec<u8>,
    connects: Vec<u8>,
    configuration: Option<u8>,
    alternates: Vec<(u8, u8)>,
    resets: usize,
    cleared_halts: Vec<u8>,
    discards: usize,
    unplugged: bool,
    fail_open: bool,
    opens: usize,
    open_nodes: usize,
}

impl MockState {
    /// Fill waiting input URBs from queued data; returns signals to raise
    fn complete_input(&mut self) -> Vec<c_int> {
        let mut signals = Vec::new();
        let mut waiting = VecDeque::new();

        while let Some(urb) = self.submitted.pop_front() {
            let endpoint = unsafe { (*urb).endpoint };
            match self.input.get_mut(&endpoint).and_then(VecDeque::pop_front) {
                Some(data) => {
                    unsafe { fill(urb, &data, 0) };
                    signals.extend(signal_of(urb));
                    self.completed.push_back(urb);
                }
                None => waiting.push_back(urb),
            }
        }

        self.submitted = waiting;
        signals
    }
}

unsafe fn fill(urb: *mut sys::Urb, data: &[u8], status: c_int) {
    unsafe {
        let length = data.len().min((*urb).buffer_length.max(0) as usize);
        std::ptr::copy_nonoverlapping(data.as_ptr(), (*urb).buffer as *mut u8, length);
        (*urb).actual_length = length as c_int;
        (*urb).status = status;
    }
}

fn signal_of(urb: *mut sys::Urb) -> Option<c_int> {
    match unsafe { (*urb).signr } {
        0 => None,
        signal => Some(signal as c_int),
    }
}

fn raise_all(signals: Vec<c_int>) {
    for signal in signals {
        // Real-time signals have no nix::sys::signal::Signal variant.
        unsafe { libc::raise(signal) };
    }
}

/// A scriptable fake usbfs device
#[derive(Clone, Default)]
pub struct MockUsbfs {
    state: Rc<RefCell<MockState>>,
}

impl MockUsbfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host device every mock handle refers to
    pub fn host_device() -> Arc<HostDevice> {
        Arc::new(HostDevice::new(
            PathBuf::from("/dev/bus/usb/001/002"),
            None,
            create_mock_descriptor(MOCK_VENDOR_ID, MOCK_PRODUCT_ID),
        ))
    }

    /// Opener producing nodes backed by this mock
    pub fn opener(&self) -> Rc<dyn DeviceOpener> {
        Rc::new(MockOpener { mock: self.clone() })
    }

    /// A handle on this mock with default options
    pub fn handle(&self) -> DeviceHandle {
        self.handle_with(TransferOptions {
            cancel_poll: std::time::Duration::ZERO,
            ..TransferOptions::default()
        })
    }

    pub fn handle_with(&self, options: TransferOptions) -> DeviceHandle {
        DeviceHandle::new(Self::host_device(), self.opener(), options)
    }

    /// Queue input on an endpoint, completing a waiting URB if there is one
    pub fn push_input(&self, endpoint: u8, data: &[u8]) {
        let signals = {
            let mut state = self.state.borrow_mut();
            state
                .input
                .entry(endpoint)
                .or_default()
                .push_back(data.to_vec());
            state.complete_input()
        };
        raise_all(signals);
    }

    /// Queue the response to the next input control transfer
    pub fn queue_control_response(&self, data: &[u8]) {
        self.state
            .borrow_mut()
            .control_responses
            .push_back(data.to_vec());
    }

    /// Refuse bulk-typed URBs on `endpoint` with EINVAL
    pub fn reject_bulk_on(&self, endpoint: u8) {
        self.state.borrow_mut().interrupt_only.insert(endpoint);
    }

    /// Have a kernel driver hold `interface`
    pub fn hold_interface(&self, interface: u8, driver: &str) {
        self.state
            .borrow_mut()
            .holders
            .insert(interface, driver.to_string());
    }

    /// Like [`Self::hold_interface`], but the driver rebinds after being
    /// disconnected
    pub fn hold_interface_sticky(&self, interface: u8, driver: &str) {
        self.hold_interface(interface, driver);
        self.state.borrow_mut().sticky_holders.insert(interface);
    }

    /// Make the next opens fail with EACCES
    pub fn fail_open(&self) {
        self.state.borrow_mut().fail_open = true;
    }

    /// Remove the device from the bus
    ///
    /// Waiting URBs complete with ENODEV; everything after fails with
    /// ENODEV.
    pub fn unplug(&self) {
        let signals = {
            let mut state = self.state.borrow_mut();
            state.unplugged = true;
            let mut signals = Vec::new();
            while let Some(urb) = state.submitted.pop_front() {
                unsafe { fill(urb, &[], -(Errno::ENODEV as c_int)) };
                signals.extend(signal_of(urb));
                state.completed.push_back(urb);
            }
            signals
        };
        raise_all(signals);
    }

    /// Kill the URBs waiting on `endpoint`, as the kernel does when an
    /// interface is reset or switches alternate setting
    pub fn kill_waiting(&self, endpoint: u8) {
        let signals = {
            let mut state = self.state.borrow_mut();
            let mut signals = Vec::new();
            let mut waiting = VecDeque::new();
            while let Some(urb) = state.submitted.pop_front() {
                if unsafe { (*urb).endpoint } == endpoint {
                    unsafe { fill(urb, &[], -(Errno::ENOENT as c_int)) };
                    signals.extend(signal_of(urb));
                    state.completed.push_back(urb);
                } else {
                    waiting.push_back(urb);
                }
            }
            state.submitted = waiting;
            signals
        };
        raise_all(signals);
    }

    /// URBs the fake kernel holds (waiting or completed but not reaped)
    pub fn in_custody(&self) -> usize {
        let state = self.state.borrow();
        state.submitted.len() + state.completed.len()
    }

    /// Input URBs waiting for data on `endpoint`
    pub fn waiting_urbs(&self, endpoint: u8) -> usize {
        self.state
            .borrow()
            .submitted
            .iter()
            .filter(|urb| unsafe { (***urb).endpoint } == endpoint)
            .count()
    }

    /// (endpoint, URB type) of every submit attempt, accepted or not
    pub fn submit_attempts(&self) -> Vec<(u8, u8)> {
        self.state.borrow().submit_attempts.clone()
    }

    /// Data written to output endpoints, in order
    pub fn output(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.borrow().output.clone()
    }

    /// Setup packet and payload of every control transfer
    pub fn control_log(&self) -> Vec<(SetupPacket, Vec<u8>)> {
        self.state.borrow().control_log.clone()
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.state.borrow().claimed.iter().copied().collect()
    }

    pub fn claim_attempts(&self) -> usize {
        self.state.borrow().claim_attempts
    }

    pub fn disconnects(&self) -> Vec<u8> {
        self.state.borrow().disconnects.clone()
    }

    pub fn connects(&self) -> Vec<u8> {
        self.state.borrow().connects.clone()
    }

    pub fn configuration(&self) -> Option<u8> {
        self.state.borrow().configuration
    }

    pub fn alternates(&self) -> Vec<(u8, u8)> {
        self.state.borrow().alternates.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        self.state.borrow().cleared_halts.clone()
    }

    pub fn discards(&self) -> usize {
        self.state.borrow().discards
    }

    /// Number of opens so far
    pub fn opens(&self) -> usize {
        self.state.borrow().opens
    }

    /// Whether any node on this mock is open
    pub fn is_open(&self) -> bool {
        self.state.borrow().open_nodes > 0
    }
}

/// Opens [`MockDevice`] nodes on a [`MockUsbfs`]
pub struct MockOpener {
    mock: MockUsbfs,
}

impl DeviceOpener for MockOpener {
    fn open(&self, _device: &HostDevice) -> Result<Box<dyn UsbfsIo>> {
        let mut state = self.mock.state.borrow_mut();
        if state.fail_open {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EACCES)));
        }
        if state.unplugged {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::ENOENT)));
        }
        state.opens += 1;
        state.open_nodes += 1;
        Ok(Box::new(MockDevice {
            state: Rc::clone(&self.mock.state),
        }))
    }
}

/// One open node on a [`MockUsbfs`]
pub struct MockDevice {
    state: Rc<RefCell<MockState>>,
}

impl MockDevice {
    fn live(&self) -> nix::Result<std::cell::RefMut<'_, MockState>> {
        let state = self.state.borrow_mut();
        if state.unplugged {
            return Err(Errno::ENODEV);
        }
        Ok(state)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.open_nodes = state.open_nodes.saturating_sub(1);
        // Closing the node releases every URB.
        state.submitted.clear();
        state.completed.clear();
    }
}

impl UsbfsIo for MockDevice {
    fn control(&self, transfer: &mut sys::CtrlTransfer) -> nix::Result<usize> {
        let mut state = self.live()?;
        let setup = SetupPacket::from_bytes(&transfer.setup_bytes());
        let length = usize::from(setup.length);
        let data = transfer.data as *mut u8;

        if setup.direction() == Direction::In {
            let response = state.control_responses.pop_front().ok_or(Errno::EPIPE)?;
            let count = length.min(response.len());
            unsafe { std::ptr::copy_nonoverlapping(response.as_ptr(), data, count) };
            state.control_log.push((setup, response[..count].to_vec()));
            Ok(count)
        } else {
            let payload = unsafe { slice::from_raw_parts(data, length) }.to_vec();
            state.control_log.push((setup, payload));
            Ok(length)
        }
    }

    fn bulk(&self, transfer: &mut sys::BulkTransfer) -> nix::Result<usize> {
        let mut state = self.live()?;
        let endpoint = transfer.endpoint as u8;
        let length = transfer.length as usize;
        let data = transfer.data as *mut u8;

        if endpoint & 0x80 != 0 {
            let input = state
                .input
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
                .ok_or(Errno::ETIMEDOUT)?;
            let count = length.min(input.len());
            unsafe { std::ptr::copy_nonoverlapping(input.as_ptr(), data, count) };
            Ok(count)
        } else {
            let payload = unsafe { slice::from_raw_parts(data, length) }.to_vec();
            state.output.push((endpoint, payload));
            Ok(length)
        }
    }

    unsafe fn submit_urb(&self, urb: *mut sys::Urb) -> nix::Result<()> {
        let signals = {
            let mut state = self.live()?;
            let (endpoint, urb_type) = unsafe { ((*urb).endpoint, (*urb).urb_type) };
            state.submit_attempts.push((endpoint, urb_type));

            if urb_type == sys::URB_TYPE_BULK && state.interrupt_only.contains(&endpoint) {
                return Err(Errno::EINVAL);
            }

            if endpoint & 0x80 == 0 {
                let length = unsafe { (*urb).buffer_length.max(0) as usize };
                let payload = unsafe { slice::from_raw_parts((*urb).buffer as *const u8, length) }.to_vec();
                unsafe {
                    (*urb).actual_length = length as c_int;
                    (*urb).status = 0;
                }
                state.output.push((endpoint, payload));
                state.completed.push_back(urb);
                signal_of(urb).into_iter().collect()
            } else {
                state.submitted.push_back(urb);
                state.complete_input()
            }
        };
        raise_all(signals);
        Ok(())
    }

    unsafe fn discard_urb(&self, urb: *mut sys::Urb) -> nix::Result<()> {
        let signals = {
            let mut state = self.live()?;
            state.discards += 1;
            let position = state
                .submitted
                .iter()
                .position(|&waiting| waiting == urb)
                .ok_or(Errno::EINVAL)?;
            state.submitted.remove(position);
            unsafe { fill(urb, &[], -(Errno::ENOENT as c_int)) };
            state.completed.push_back(urb);
            signal_of(urb).into_iter().collect()
        };
        raise_all(signals);
        Ok(())
    }

    fn reap_urb(&self, _wait: bool) -> nix::Result<*mut sys::Urb> {
        let mut state = self.state.borrow_mut();
        if let Some(urb) = state.completed.pop_front() {
            return Ok(urb);
        }
        if state.unplugged {
            Err(Errno::ENODEV)
        } else {
            Err(Errno::EAGAIN)
        }
    }

    fn claim_interface(&self, interface: u8) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state.claim_attempts += 1;
        if state.unplugged {
            return Err(Errno::ENODEV);
        }
        if state.holders.contains_key(&interface) {
            return Err(Errno::EBUSY);
        }
        state.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> nix::Result<()> {
        let mut state = self.live()?;
        if state.claimed.remove(&interface) {
            Ok(())
        } else {
            Err(Errno::EINVAL)
        }
    }

    fn driver_name(&self, interface: u8) -> nix::Result<String> {
        let state = self.live()?;
        state.holders.get(&interface).cloned().ok_or(Errno::ENODATA)
    }

    fn disconnect_driver(&self, interface: u8) -> nix::Result<()> {
        let mut state = self.live()?;
        if !state.holders.contains_key(&interface) {
            return Err(Errno::ENODATA);
        }
        if !state.sticky_holders.contains(&interface) {
            state.holders.remove(&interface);
        }
        state.disconnects.push(interface);
        Ok(())
    }

    fn connect_driver(&self, interface: u8) -> nix::Result<()> {
        self.live()?.connects.push(interface);
        Ok(())
    }

    fn set_configuration(&self, configuration: u8) -> nix::Result<()> {
        self.live()?.configuration = Some(configuration);
        Ok(())
    }

    fn set_interface(&self, interface: u8, alternate: u8) -> nix::Result<()> {
        self.live()?.alternates.push((interface, alternate));
        Ok(())
    }

    fn reset(&self) -> nix::Result<()> {
        self.live()?.resets += 1;
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> nix::Result<()> {
        self.live()?.cleared_halts.push(endpoint);
        Ok(())
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}
