//! Common utilities for usbfs-host
//!
//! This crate provides the ambient pieces shared by the transport library and
//! its tools: error handling, logging setup, host configuration, and fixture
//! helpers for tests that fake a usbfs device tree.

pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use config::{DeviceFilter, HostConfig, MonitorStrategy, RootCandidate, RootCheck};
pub use error::{Error, Result};
pub use logging::setup_logging;
