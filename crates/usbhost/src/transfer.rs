//! Transfer engine
//!
//! Synchronous control and bulk transfers are single ioctls. Asynchronous
//! transfers move a boxed [`TransferRequest`] between exactly two places:
//! kernel custody (`in_flight`) and the completed queue of its endpoint.
//! Records leave kernel custody only through a reap, or when the device is
//! gone and the kernel no longer holds anything.

use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::io::is_benign_discard;
use crate::monitor::InputMonitor;
use crate::request::{RequestId, TransferRequest, urb_type_for};
use crate::sys;
use nix::errno::Errno;
use nix::libc::{c_uint, c_void};
use protocol::{
    Direction, EndpointAddress, EndpointInfo, Recipient, RequestType, SetupPacket, TransferKind,
    hex_dump,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

impl DeviceHandle {
    /// Issue a control transfer on the default endpoint
    ///
    /// `buffer` holds the payload for output requests and receives it for
    /// input requests; its length is wLength. Returns the byte count.
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &mut self,
        direction: Direction,
        recipient: Recipient,
        request_type: RequestType,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let length =
            u16::try_from(buffer.len()).map_err(|_| Error::Unsupported("control payload over 64KiB"))?;
        let setup = SetupPacket::new(direction, request_type, recipient, request, value, index, length);
        let io = self.open_io()?;

        if direction == Direction::Out {
            trace!(
                "Control output: type={:#04x} req={:#04x} val={:#06x} idx={:#06x} [{}]",
                setup.request_type,
                request,
                value,
                index,
                hex_dump(buffer)
            );
        }

        let mut transfer = sys::CtrlTransfer::from_setup(
            &setup.to_bytes(),
            timeout_ms(timeout),
            buffer.as_mut_ptr() as *mut c_void,
        );
        let count = io.control(&mut transfer).map_err(|e| {
            error!("USB control transfer failed: {}", e);
            Error::os("control transfer", e)
        })?;

        if direction == Direction::In {
            trace!(
                "Control input: type={:#04x} req={:#04x} val={:#06x} idx={:#06x} [{}]",
                setup.request_type,
                request,
                value,
                index,
                hex_dump(&buffer[..count.min(buffer.len())])
            );
        }

        Ok(count)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn control_read(
        &mut self,
        recipient: Recipient,
        request_type: RequestType,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.control_transfer(
            Direction::In,
            recipient,
            request_type,
            request,
            value,
            index,
            buffer,
            timeout,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn control_write(
        &mut self,
        recipient: Recipient,
        request_type: RequestType,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let mut payload = data.to_vec();
        self.control_transfer(
            Direction::Out,
            recipient,
            request_type,
            request,
            value,
            index,
            &mut payload,
            timeout,
        )
    }

    /// Synchronous bulk (or interrupt) transfer
    ///
    /// A timeout on an input endpoint means no data was available and is
    /// reported as [`Error::WouldBlock`].
    pub fn bulk_transfer(
        &mut self,
        endpoint: EndpointAddress,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let io = self.open_io()?;

        if !endpoint.is_input() {
            trace!("Bulk output on {}: [{}]", endpoint, hex_dump(buffer));
        }

        let mut transfer = sys::BulkTransfer {
            endpoint: c_uint::from(endpoint.0),
            length: buffer.len() as c_uint,
            timeout: timeout_ms(timeout),
            data: buffer.as_mut_ptr() as *mut c_void,
        };

        match io.bulk(&mut transfer) {
            Ok(count) => {
                if endpoint.is_input() {
                    trace!(
                        "Bulk input on {}: [{}]",
                        endpoint,
                        hex_dump(&buffer[..count.min(buffer.len())])
                    );
                }
                Ok(count)
            }
            Err(Errno::ETIMEDOUT) if endpoint.is_input() => Err(Error::WouldBlock),
            Err(e) => {
                error!("USB bulk transfer on {} failed: {}", endpoint, e);
                Err(Error::os("bulk transfer", e))
            }
        }
    }

    pub fn bulk_read(
        &mut self,
        endpoint: EndpointAddress,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if !endpoint.is_input() {
            return Err(Error::Unsupported("reading from an output endpoint"));
        }
        self.bulk_transfer(endpoint, buffer, timeout)
    }

    pub fn bulk_write(&mut self, endpoint: EndpointAddress, data: &[u8], timeout: Duration) -> Result<usize> {
        if endpoint.is_input() {
            return Err(Error::Unsupported("writing to an input endpoint"));
        }
        let mut payload = data.to_vec();
        self.bulk_transfer(endpoint, &mut payload, timeout)
    }

    /// Submit an asynchronous transfer
    ///
    /// For input endpoints `buffer` only sets the requested length. The
    /// completed record is queued on the endpoint; see [`Self::reap`].
    pub fn submit(&mut self, endpoint: EndpointInfo, buffer: Vec<u8>, context: u64) -> Result<RequestId> {
        urb_type_for(endpoint.kind)?;
        let id = self.next_request_id();
        self.submit_request(TransferRequest::new(id, endpoint, buffer, context))
    }

    /// Hand a record to the kernel
    ///
    /// Interrupt endpoints are tried bulk-typed first and, if the kernel
    /// refuses that with EINVAL, once more interrupt-typed. The record is
    /// freed if the submission fails.
    pub(crate) fn submit_request(&mut self, request: Box<TransferRequest>) -> Result<RequestId> {
        let info = request.endpoint_info();
        let urb_type = urb_type_for(info.kind)?;
        let io = self.open_io()?;
        let signal = self.endpoint_signal(info.address);
        self.endpoint_entry(info)?;

        if !info.address.is_input() {
            trace!("Submitting output on {}: [{}]", info.address, hex_dump(request.data_requested()));
        }

        let id = request.id();
        let raw = Box::into_raw(request);
        let mut attempt = urb_type;
        let outcome = loop {
            unsafe { (*raw).prepare(attempt, signal) };
            match unsafe { io.submit_urb(TransferRequest::urb_ptr(raw)) } {
                Err(Errno::EINVAL)
                    if info.kind == TransferKind::Interrupt && attempt == sys::URB_TYPE_BULK =>
                {
                    debug!(
                        "Bulk-typed submit rejected on interrupt endpoint {}, retrying as interrupt",
                        info.address
                    );
                    attempt = sys::URB_TYPE_INTERRUPT;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(()) => {
                self.in_flight.insert(id, raw);
                if let Some(endpoint) = self.endpoints.get_mut(&info.address) {
                    endpoint.in_flight += 1;
                }
                trace!("Submitted request {:?} on endpoint {}", id, info.address);
                Ok(id)
            }
            Err(e) => {
                // Never accepted, so still ours.
                drop(unsafe { Box::from_raw(raw) });
                error!("USB submit on endpoint {} failed: {}", info.address, e);
                Err(Error::os("submit request", e))
            }
        }
    }

    fn endpoint_signal(&self, address: EndpointAddress) -> Option<i32> {
        match self.endpoints.get(&address)?.monitor.as_ref()? {
            InputMonitor::Signal(registration) => Some(registration.signal()),
            InputMonitor::Shared => None,
        }
    }

    /// Take one completed request back from the kernel
    ///
    /// The record is queued on its endpoint, whose address is returned.
    /// `Ok(None)` means nothing has completed yet (non-blocking mode).
    pub fn reap(&mut self, wait: bool) -> Result<Option<EndpointAddress>> {
        let io = self.open_io()?;
        let urb = match io.reap_urb(wait) {
            Ok(urb) => urb,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(Error::os("reap request", e)),
        };

        let raw = unsafe { TransferRequest::from_urb(urb) };
        let id = unsafe { (*raw).id() };
        if self.in_flight.get(&id).copied() != Some(raw) {
            error!("Reaped request {:?} that was not submitted here", id);
            return Err(Error::UnknownRequest(id));
        }
        self.in_flight.remove(&id);

        let request = unsafe { Box::from_raw(raw) };
        let address = request.endpoint();
        trace!(
            "Reaped request {:?} on endpoint {}: status={} length={}",
            id,
            address,
            request.status_code(),
            request.actual_length()
        );

        match self.endpoints.get_mut(&address) {
            Some(endpoint) => {
                endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
                endpoint.push_completed(request);
                Ok(Some(address))
            }
            None => Err(Error::UnknownEndpoint(address)),
        }
    }

    /// Reap everything that has completed without waiting
    pub fn reap_all(&mut self) -> Result<usize> {
        let mut count = 0;
        while self.reap(false)?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Remove the oldest completed record of an endpoint
    pub fn take_completed(&mut self, address: EndpointAddress) -> Option<TransferRequest> {
        self.endpoints
            .get(&address)?
            .pop_completed()
            .map(|request| *request)
    }

    /// Remove a specific completed record
    pub fn take_request(&mut self, address: EndpointAddress, id: RequestId) -> Option<TransferRequest> {
        self.endpoints
            .get(&address)?
            .remove_completed(id)
            .map(|request| *request)
    }

    /// Cancel a request and free it
    ///
    /// Returns once the kernel no longer holds the request. A request that
    /// already completed is simply removed from its queue.
    pub fn cancel(&mut self, id: RequestId) -> Result<()> {
        if self.endpoints.values().any(|ep| ep.remove_completed(id).is_some()) {
            trace!("Cancelled completed request {:?}", id);
            return Ok(());
        }

        let raw = *self.in_flight.get(&id).ok_or(Error::UnknownRequest(id))?;
        let address = unsafe { (*raw).endpoint() };
        let io = self.open_io()?;

        match unsafe { io.discard_urb(TransferRequest::urb_ptr(raw)) } {
            Ok(()) => {}
            Err(e) if is_benign_discard(e) => trace!("Discard of request {:?}: {}", id, e),
            Err(e) => {
                error!("USB discard of request {:?} failed: {}", id, e);
                return Err(Error::os("discard request", e));
            }
        }
        drop(io);

        loop {
            if let Some(endpoint) = self.endpoints.get(&address) {
                if endpoint.remove_completed(id).is_some() {
                    trace!("Cancelled request {:?}", id);
                    return Ok(());
                }
            }

            match self.reap(false) {
                Ok(Some(_)) => {}
                Ok(None) => thread::sleep(self.options.cancel_poll),
                Err(Error::NoDevice) => {
                    // The kernel has let go of everything.
                    if let Some(raw) = self.in_flight.remove(&id) {
                        drop(unsafe { Box::from_raw(raw) });
                        if let Some(endpoint) = self.endpoints.get_mut(&address) {
                            endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
                        }
                    }
                    debug!("Device gone while cancelling request {:?}", id);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel every outstanding and queued request of an endpoint
    pub fn cancel_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let ids: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|(_, raw)| unsafe { (***raw).endpoint() } == address)
            .map(|(id, _)| *id)
            .collect();

        let mut result = Ok(());
        for id in ids {
            if let Err(e) = self.cancel(id) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if let Some(endpoint) = self.endpoints.get(&address) {
            endpoint.drain();
        }
        result
    }

    /// Interrupt transfer as a blocking call
    ///
    /// Submits once and polls at the endpoint interval until the request
    /// completes. On timeout the request is cancelled and
    /// [`Error::TimedOut`] returned.
    pub fn interrupt_transfer(
        &mut self,
        endpoint: EndpointInfo,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let payload = if endpoint.address.is_input() {
            vec![0; buffer.len()]
        } else {
            buffer.to_vec()
        };
        let id = self.submit(endpoint, payload, 0)?;
        let interval = Duration::from_millis(u64::from(endpoint.interval.max(1)));
        let started = Instant::now();

        loop {
            if let Some(request) = self.take_request(endpoint.address, id) {
                request.status()?;
                let count = request.actual_length();
                if endpoint.address.is_input() {
                    buffer[..count].copy_from_slice(request.data());
                    trace!("Interrupt input on {}: [{}]", endpoint.address, hex_dump(&buffer[..count]));
                }
                return Ok(count);
            }

            match self.reap(false) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    if let Err(cancel_error) = self.cancel(id) {
                        debug!("Cancel after failed reap: {}", cancel_error);
                    }
                    return Err(e);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                self.cancel(id)?;
                return Err(Error::TimedOut);
            }
            thread::sleep(interval.min(timeout - elapsed));
        }
    }

    /// Wait until input is queued on an endpoint
    ///
    /// Keeps one input request in flight. Returns `false` if nothing arrived
    /// within `timeout`.
    pub fn await_input(&mut self, endpoint: EndpointInfo, timeout: Duration) -> Result<bool> {
        if !endpoint.address.is_input() {
            return Err(Error::Unsupported("awaiting input on an output endpoint"));
        }
        if self.queued(endpoint.address) > 0 {
            return Ok(true);
        }

        let idle = self
            .endpoints
            .get(&endpoint.address)
            .is_none_or(|ep| ep.in_flight == 0);
        if idle {
            self.submit(endpoint, vec![0; usize::from(endpoint.max_packet_size.max(1))], 0)?;
        }

        let interval = Duration::from_millis(u64::from(endpoint.interval.max(1)));
        let started = Instant::now();
        loop {
            while let Some(address) = self.reap(false)? {
                if address == endpoint.address {
                    return Ok(true);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            self.wait_for_completion(interval.min(timeout - elapsed))?;
        }
    }

    /// Consume the oldest input queued on an endpoint, filtered
    pub fn take_input(&mut self, address: EndpointAddress) -> Result<Option<Vec<u8>>> {
        let Some(request) = self.take_completed(address) else {
            return Ok(None);
        };
        request.status()?;

        let mut data = request.into_data();
        self.apply_filters(&mut data)?;
        trace!("Input on {}: [{}]", address, hex_dump(&data));
        Ok(Some(data))
    }

    /// Polling read: await input then copy it out
    ///
    /// Returns [`Error::WouldBlock`] if nothing arrives within `timeout`.
    pub fn read_input(&mut self, endpoint: EndpointInfo, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.await_input(endpoint, timeout)? {
            return Err(Error::WouldBlock);
        }
        let data = self.take_input(endpoint.address)?.ok_or(Error::WouldBlock)?;
        let count = data.len().min(buffer.len());
        buffer[..count].copy_from_slice(&data[..count]);
        Ok(count)
    }
}
