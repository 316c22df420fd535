//! Per-endpoint state
//!
//! Completed records wait in a FIFO until the caller (or the monitor
//! dispatch) consumes them. The FIFO is the one structure reachable from both
//! the main flow and monitor dispatch, so it sits behind a mutex.

use crate::error::{Error, Result};
use crate::monitor::{InputHandler, InputMonitor};
use crate::request::{RequestId, TransferRequest};
use protocol::EndpointInfo;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Initial capacity of a completed-record queue
const QUEUE_CAPACITY: usize = 8;

pub(crate) struct EndpointHandle {
    pub(crate) info: EndpointInfo,
    completed: Mutex<VecDeque<Box<TransferRequest>>>,
    /// Records of this endpoint currently held by the kernel
    pub(crate) in_flight: usize,
    pub(crate) monitor: Option<InputMonitor>,
    pub(crate) handler: Option<InputHandler>,
}

impl EndpointHandle {
    /// Fails without side effects if the queue cannot be allocated
    pub(crate) fn new(info: EndpointInfo) -> Result<Self> {
        let mut queue = VecDeque::new();
        queue
            .try_reserve(QUEUE_CAPACITY)
            .map_err(|_| Error::OutOfMemory("endpoint completion queue"))?;

        Ok(Self {
            info,
            completed: Mutex::new(queue),
            in_flight: 0,
            monitor: None,
            handler: None,
        })
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Box<TransferRequest>>> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push_completed(&self, request: Box<TransferRequest>) {
        self.queue().push_back(request);
    }

    pub(crate) fn pop_completed(&self) -> Option<Box<TransferRequest>> {
        self.queue().pop_front()
    }

    /// Remove a specific record, wherever it sits in the queue
    pub(crate) fn remove_completed(&self, id: RequestId) -> Option<Box<TransferRequest>> {
        let mut queue = self.queue();
        let position = queue.iter().position(|r| r.id() == id)?;
        queue.remove(position)
    }

    pub(crate) fn completed_len(&self) -> usize {
        self.queue().len()
    }

    /// Free every queued record; returns how many there were
    pub(crate) fn drain(&self) -> usize {
        let mut queue = self.queue();
        let count = queue.len();
        queue.clear();
        count
    }

    pub(crate) fn is_monitored(&self) -> bool {
        self.monitor.is_some()
    }
}
