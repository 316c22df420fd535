//! Asynchronous transfer records
//!
//! A [`TransferRequest`] is boxed for its whole life so the URB inside it and
//! the buffer it points at never move while the kernel holds them. The URB is
//! the first field, which lets the pointer handed back by a reap be turned
//! back into the record through `usercontext`.

use crate::error::{Error, Result};
use crate::sys;
use nix::errno::Errno;
use nix::libc::{c_int, c_uint, c_void};
use protocol::{EndpointAddress, EndpointInfo, TransferKind};

/// Identifies a submitted request for [`crate::DeviceHandle::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// One asynchronous transfer
///
/// While submitted, the record belongs to the kernel; once reaped it sits in
/// its endpoint's completed queue until consumed or cancelled.
#[repr(C)]
#[derive(Debug)]
pub struct TransferRequest {
    urb: sys::Urb,
    id: RequestId,
    endpoint: EndpointInfo,
    buffer: Vec<u8>,
    context: u64,
}

impl TransferRequest {
    pub(crate) fn new(id: RequestId, endpoint: EndpointInfo, buffer: Vec<u8>, context: u64) -> Box<Self> {
        #[cfg(test)]
        live::created();

        Box::new(Self {
            urb: sys::Urb::default(),
            id,
            endpoint,
            buffer,
            context,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint.address
    }

    pub fn endpoint_info(&self) -> EndpointInfo {
        self.endpoint
    }

    pub fn kind(&self) -> TransferKind {
        self.endpoint.kind
    }

    /// Caller supplied tag
    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn requested_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn actual_length(&self) -> usize {
        (self.urb.actual_length.max(0) as usize).min(self.buffer.len())
    }

    /// Raw completion status (0 or a negative errno)
    pub fn status_code(&self) -> i32 {
        self.urb.status
    }

    /// Completion status as a result
    pub fn status(&self) -> Result<()> {
        match self.urb.status {
            0 => Ok(()),
            status => Err(Error::os("transfer", Errno::from_raw(-status))),
        }
    }

    /// Whether the request completed because it was discarded
    pub fn is_cancelled(&self) -> bool {
        let status = -self.urb.status;
        status == Errno::ENOENT as i32 || status == Errno::ECONNRESET as i32
    }

    /// Bytes transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length()]
    }

    /// The whole buffer, as submitted
    pub(crate) fn data_requested(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the transferred bytes
    pub fn into_data(mut self) -> Vec<u8> {
        let length = self.actual_length();
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.truncate(length);
        buffer
    }

    /// Fill in the URB for submission with the given usbfs type
    ///
    /// Must be called on the boxed record right before it is handed to the
    /// kernel: the URB records its own address in `usercontext`.
    pub(crate) fn prepare(&mut self, urb_type: u8, signal: Option<c_int>) {
        let this = self as *mut TransferRequest as *mut c_void;
        let urb = &mut self.urb;
        urb.urb_type = urb_type;
        urb.endpoint = self.endpoint.address.0;
        urb.status = 0;
        urb.flags = 0;
        urb.buffer = self.buffer.as_mut_ptr() as *mut c_void;
        urb.buffer_length = self.buffer.len() as c_int;
        urb.actual_length = 0;
        urb.start_frame = 0;
        urb.number_of_packets = 0;
        urb.error_count = 0;
        urb.signr = signal.unwrap_or(0) as c_uint;
        urb.usercontext = this;
    }

    /// Reset for another round on the same endpoint
    pub(crate) fn recycle(&mut self) {
        let size = self.buffer.len();
        self.buffer.clear();
        self.buffer.resize(size, 0);
    }

    /// Recover the record from an URB returned by the kernel
    ///
    /// # Safety
    ///
    /// `urb` must be the URB of a live record submitted by this crate.
    pub(crate) unsafe fn from_urb(urb: *mut sys::Urb) -> *mut TransferRequest {
        unsafe { (*urb).usercontext as *mut TransferRequest }
    }

    pub(crate) fn urb_ptr(this: *mut TransferRequest) -> *mut sys::Urb {
        // The URB is the first field of a repr(C) struct.
        this as *mut sys::Urb
    }
}

/// usbfs URB type for a transfer kind
pub(crate) fn urb_type_for(kind: TransferKind) -> Result<u8> {
    match kind {
        TransferKind::Control => Ok(sys::URB_TYPE_CONTROL),
        // Interrupt endpoints go out bulk-typed first; see DeviceHandle::submit.
        TransferKind::Bulk | TransferKind::Interrupt => Ok(sys::URB_TYPE_BULK),
        TransferKind::Isochronous => Err(Error::Unsupported("isochronous transfers")),
    }
}

#[cfg(test)]
impl Drop for TransferRequest {
    fn drop(&mut self) {
        live::dropped();
    }
}
