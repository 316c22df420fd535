//! Event-driven input
//!
//! A monitored input endpoint keeps several input requests in flight and
//! hands every completion to its handler, resubmitting the record each time.
//! Completions are noticed in one of two ways, picked once per handle from
//! [`TransferOptions::monitor`](crate::TransferOptions):
//!
//! - `Signal`: each endpoint gets its own real-time signal, raised by the
//!   kernel on completion.
//! - `OutputReady`: one watch per device on the device node becoming
//!   writable, which usbfs reports while completed URBs are waiting.
//!
//! Neither path runs transfer code asynchronously. [`DeviceHandle::wait_events`]
//! turns readiness into [`MonitorEvent`] messages and
//! [`DeviceHandle::handle_event`] does the reaping and dispatch on the
//! caller's thread.

use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::request::urb_type_for;
use crate::signal::{self, SignalRegistration};
use common::MonitorStrategy;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use protocol::{EndpointAddress, EndpointInfo};
use std::collections::BTreeSet;
use std::os::fd::BorrowedFd;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Something a monitor noticed, to be handled on the main flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A real-time signal was delivered
    Signal(i32),
    /// The device node reported pending completions
    OutputReady,
}

/// What an input handler is told
#[derive(Debug)]
pub enum InputEvent<'a> {
    /// One filtered input buffer
    Data(&'a [u8]),
    /// The monitor failed and has been stopped
    Failed(&'a Error),
}

/// Consumer of monitored input; returning `false` stops the monitor
pub type InputHandler = Box<dyn FnMut(EndpointAddress, InputEvent<'_>) -> bool>;

/// How a monitored endpoint learns about completions
#[derive(Debug)]
pub(crate) enum InputMonitor {
    Signal(SignalRegistration),
    /// Member of the device's output-ready monitor
    Shared,
}

/// The per-device output-ready watch, shared by its monitored endpoints
#[derive(Debug, Default)]
pub(crate) struct OutputMonitor {
    members: BTreeSet<EndpointAddress>,
}

fn poll_timeout(timeout: Duration) -> u16 {
    u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX)
}

impl DeviceHandle {
    /// Start delivering input from an endpoint to `handler`
    pub fn monitor_input<F>(&mut self, endpoint: EndpointInfo, handler: F) -> Result<()>
    where
        F: FnMut(EndpointAddress, InputEvent<'_>) -> bool + 'static,
    {
        let address = endpoint.address;
        if !address.is_input() {
            return Err(Error::Unsupported("monitoring an output endpoint"));
        }
        urb_type_for(endpoint.kind)?;
        if self.is_monitoring(address) {
            return Err(Error::Unsupported("endpoint is already monitored"));
        }
        self.ensure_open()?;

        let monitor = match self.options.monitor {
            MonitorStrategy::Signal => InputMonitor::Signal(SignalRegistration::allocate()?),
            MonitorStrategy::OutputReady => InputMonitor::Shared,
        };
        let shared = matches!(monitor, InputMonitor::Shared);

        let entry = self.endpoint_entry(endpoint)?;
        entry.monitor = Some(monitor);
        entry.handler = Some(Box::new(handler));

        if shared {
            let output = self.output_monitor.get_or_insert_with(|| {
                debug!("Installed output-ready monitor");
                OutputMonitor::default()
            });
            output.members.insert(address);
        }

        let size = usize::from(endpoint.max_packet_size.max(1));
        for _ in 0..self.options.input_requests {
            if let Err(e) = self.submit(endpoint, vec![0; size], 0) {
                if let Err(stop_error) = self.stop_monitor(address) {
                    debug!("Stopping half-started monitor failed: {}", stop_error);
                }
                return Err(e);
            }
        }

        debug!("Monitoring input endpoint {}", address);
        Ok(())
    }

    pub fn is_monitoring(&self, address: EndpointAddress) -> bool {
        self.endpoints
            .get(&address)
            .is_some_and(|ep| ep.is_monitored())
    }

    /// Stop monitoring an endpoint and cancel its outstanding requests
    pub fn stop_monitor(&mut self, address: EndpointAddress) -> Result<()> {
        let endpoint = self
            .endpoints
            .get_mut(&address)
            .ok_or(Error::UnknownEndpoint(address))?;
        endpoint.handler = None;
        let Some(monitor) = endpoint.monitor.take() else {
            return Ok(());
        };

        let result = self.cancel_endpoint(address);

        if let InputMonitor::Shared = monitor {
            if let Some(output) = self.output_monitor.as_mut() {
                output.members.remove(&address);
                if output.members.is_empty() {
                    self.output_monitor = None;
                    debug!("Removed output-ready monitor");
                }
            }
        }
        drop(monitor);

        debug!("Stopped monitoring endpoint {}", address);
        result
    }

    fn signal_mask(&self) -> u64 {
        self.endpoints
            .values()
            .filter_map(|ep| match &ep.monitor {
                Some(InputMonitor::Signal(registration)) => Some(registration.bit()),
                _ => None,
            })
            .fold(0, |mask, bit| mask | bit)
    }

    /// Descriptors an external event loop should watch, with their events
    ///
    /// When one is ready call [`Self::wait_events`] with a zero timeout, or
    /// [`Self::handle_event`] directly.
    pub fn monitor_fds(&self) -> Result<Vec<(BorrowedFd<'_>, PollFlags)>> {
        let mut fds = Vec::new();
        if self.output_monitor.is_some() {
            if let Some(fd) = self.io.as_ref().and_then(|io| io.poll_fd()) {
                fds.push((fd, PollFlags::POLLOUT));
            }
        }
        if self.signal_mask() != 0 {
            fds.push((signal::wake_fd()?, PollFlags::POLLIN));
        }
        Ok(fds)
    }

    /// Wait up to `timeout` for monitor events
    pub fn wait_events(&mut self, timeout: Duration) -> Result<Vec<MonitorEvent>> {
        let mask = self.signal_mask();
        let mut events: Vec<MonitorEvent> = signal::take_pending(mask)
            .into_iter()
            .map(MonitorEvent::Signal)
            .collect();
        if !events.is_empty() {
            return Ok(events);
        }

        let Some(io) = self.io.clone() else {
            return Ok(events);
        };
        let watch_output = self.output_monitor.is_some();
        let device_fd = io.poll_fd();
        if watch_output && device_fd.is_none() {
            // Nothing to poll on; let the caller reap.
            return Ok(vec![MonitorEvent::OutputReady]);
        }

        let mut fds = Vec::new();
        if let (true, Some(fd)) = (watch_output, device_fd) {
            fds.push(PollFd::new(fd, PollFlags::POLLOUT));
        }
        let wake_index = if mask != 0 {
            fds.push(PollFd::new(signal::wake_fd()?, PollFlags::POLLIN));
            Some(fds.len() - 1)
        } else {
            None
        };
        if fds.is_empty() {
            return Ok(events);
        }

        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(Error::os("poll", e)),
        }

        let ready = |fd: &PollFd<'_>, flag: PollFlags| fd.revents().is_some_and(|r| r.contains(flag));
        if watch_output && ready(&fds[0], PollFlags::POLLOUT) {
            events.push(MonitorEvent::OutputReady);
        }
        if let Some(index) = wake_index {
            if ready(&fds[index], PollFlags::POLLIN) {
                signal::drain_wake();
            }
        }

        events.extend(signal::take_pending(mask).into_iter().map(MonitorEvent::Signal));
        Ok(events)
    }

    /// Reap everything that completed and dispatch it to the monitored
    /// endpoints' handlers; returns the number of buffers delivered
    ///
    /// The first failure is passed to the affected handler, its monitor is
    /// stopped, and the error returned.
    pub fn handle_event(&mut self, event: MonitorEvent) -> Result<usize> {
        let relevant = match event {
            MonitorEvent::Signal(number) => self.endpoints.values().any(|ep| {
                matches!(&ep.monitor, Some(InputMonitor::Signal(r)) if r.signal() == number)
            }),
            MonitorEvent::OutputReady => self.output_monitor.is_some(),
        };
        if !relevant {
            trace!("Ignoring monitor event {:?}", event);
            return Ok(0);
        }

        if let Err(e) = self.reap_all() {
            error!("Reaping monitored input failed: {}", e);
            self.fail_monitors(&e);
            return Err(e);
        }

        let monitored: Vec<EndpointAddress> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.is_monitored())
            .map(|(address, _)| *address)
            .collect();

        let mut delivered = 0;
        for address in monitored {
            delivered += self.dispatch(address)?;
        }
        Ok(delivered)
    }

    /// Wait for and handle monitor events
    pub fn process_events(&mut self, timeout: Duration) -> Result<usize> {
        let mut delivered = 0;
        for event in self.wait_events(timeout)? {
            delivered += self.handle_event(event)?;
        }
        Ok(delivered)
    }

    fn dispatch(&mut self, address: EndpointAddress) -> Result<usize> {
        let mut delivered = 0;

        loop {
            let Some(endpoint) = self.endpoints.get(&address) else {
                break;
            };
            if !endpoint.is_monitored() {
                break;
            }
            let Some(mut request) = endpoint.pop_completed() else {
                break;
            };

            // Records cancelled here never reach the queue, so a killed
            // record means the kernel dropped it on its own.
            if let Err(e) = request.status() {
                if request.is_cancelled() {
                    error!("Input request on endpoint {} was killed: {}", address, e);
                } else {
                    error!("Input on endpoint {} failed: {}", address, e);
                }
                drop(request);
                self.fail_monitor(address, &e);
                return Err(e);
            }

            let mut data = request.data().to_vec();
            if let Err(e) = self.apply_filters(&mut data) {
                error!("Input filter rejected data from endpoint {}: {}", address, e);
                drop(request);
                self.fail_monitor(address, &e);
                return Err(e);
            }

            let keep = self.deliver(address, InputEvent::Data(&data));
            delivered += 1;
            if !keep {
                drop(request);
                self.stop_monitor(address)?;
                break;
            }

            request.recycle();
            if let Err(e) = self.submit_request(request) {
                self.fail_monitor(address, &e);
                return Err(e);
            }
        }

        Ok(delivered)
    }

    fn deliver(&mut self, address: EndpointAddress, event: InputEvent<'_>) -> bool {
        let Some(mut handler) = self
            .endpoints
            .get_mut(&address)
            .and_then(|ep| ep.handler.take())
        else {
            return false;
        };

        let keep = handler(address, event);

        if let Some(endpoint) = self.endpoints.get_mut(&address) {
            if endpoint.is_monitored() && endpoint.handler.is_none() {
                endpoint.handler = Some(handler);
            }
        }
        keep
    }

    fn fail_monitor(&mut self, address: EndpointAddress, error: &Error) {
        self.deliver(address, InputEvent::Failed(error));
        if let Err(e) = self.stop_monitor(address) {
            debug!("Stopping failed monitor on {} failed: {}", address, e);
        }
    }

    fn fail_monitors(&mut self, error: &Error) {
        let monitored: Vec<EndpointAddress> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.is_monitored())
            .map(|(address, _)| *address)
            .collect();
        for address in monitored {
            self.fail_monitor(address, error);
        }
    }

    /// Sleep until the device reports a completion or `timeout` passes
    pub(crate) fn wait_for_completion(&mut self, timeout: Duration) -> Result<()> {
        let io = self.open_io()?;
        let Some(fd) = io.poll_fd() else {
            thread::sleep(timeout);
            return Ok(());
        };

        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(Error::os("poll", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransferOptions;
    use crate::request::live;
    use crate::test_utils::MockUsbfs;
    use std::cell::Cell;
    use std::rc::Rc;

    fn shared_options() -> TransferOptions {
        TransferOptions {
            monitor: MonitorStrategy::OutputReady,
            input_requests: 1,
            cancel_poll: Duration::ZERO,
        }
    }

    #[test]
    fn test_output_monitor_follows_members() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle_with(shared_options());
        let first = EndpointInfo::interrupt(0x81, 8, 10);
        let second = EndpointInfo::bulk(0x83, 64);

        handle.monitor_input(first, |_, _| true).unwrap();
        handle.monitor_input(second, |_, _| true).unwrap();
        assert_eq!(handle.output_monitor.as_ref().map(|m| m.members.len()), Some(2));

        handle.stop_monitor(first.address).unwrap();
        assert!(handle.output_monitor.is_some());

        handle.stop_monitor(second.address).unwrap();
        assert!(handle.output_monitor.is_none());
        assert_eq!(handle.pending_requests(), 0);
    }

    #[test]
    fn test_failed_start_leaves_nothing_behind() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle_with(shared_options());
        handle.ensure_open().unwrap();
        mock.unplug();

        let result = handle.monitor_input(EndpointInfo::bulk(0x81, 8), |_, _| true);
        assert!(matches!(result, Err(Error::NoDevice)));
        assert!(!handle.is_monitoring(EndpointAddress(0x81)));
        assert!(handle.output_monitor.is_none());
    }

    #[test]
    fn test_cancel_after_signalled_completion_frees_once() {
        let before = live::count();
        let mock = MockUsbfs::new();
        let mut handle = mock.handle_with(TransferOptions {
            monitor: MonitorStrategy::Signal,
            ..shared_options()
        });
        let delivered = Rc::new(Cell::new(0));
        let seen = Rc::clone(&delivered);
        handle
            .monitor_input(EndpointInfo::interrupt(0x81, 8, 10), move |_, _| {
                seen.set(seen.get() + 1);
                true
            })
            .unwrap();
        let id = *handle.in_flight.keys().next().unwrap();

        // Completed and signalled, but not yet reaped.
        mock.push_input(0x81, b"late");
        handle.cancel(id).unwrap();
        assert_eq!(live::count(), before);
        assert_eq!(handle.queued(EndpointAddress(0x81)), 0);

        let events = handle.wait_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MonitorEvent::Signal(_)));
        assert_eq!(handle.handle_event(events[0]).unwrap(), 0);
        assert_eq!(delivered.get(), 0);
        assert!(handle.is_monitoring(EndpointAddress(0x81)));

        handle.stop_monitor(EndpointAddress(0x81)).unwrap();
        assert_eq!(live::count(), before);
        assert_eq!(mock.in_custody(), 0);
    }

    #[test]
    fn test_signal_mask_covers_signal_monitors() {
        let mock = MockUsbfs::new();
        let mut handle = mock.handle_with(TransferOptions {
            monitor: MonitorStrategy::Signal,
            ..shared_options()
        });
        assert_eq!(handle.signal_mask(), 0);

        handle
            .monitor_input(EndpointInfo::interrupt(0x81, 8, 10), |_, _| true)
            .unwrap();
        assert_ne!(handle.signal_mask(), 0);
        assert!(handle.output_monitor.is_none());

        handle.stop_monitor(EndpointAddress(0x81)).unwrap();
        assert_eq!(handle.signal_mask(), 0);
    }
}
