//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding USB wire structures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// bDescriptorType did not match the structure being decoded
    #[error("Unexpected descriptor type {actual:#04x} (expected {expected:#04x})")]
    UnexpectedDescriptorType { expected: u8, actual: u8 },

    /// bLength is inconsistent with the data that was read
    #[error("Invalid descriptor length {length} for {available} bytes")]
    InvalidDescriptorLength { length: u8, available: usize },

    /// String descriptor payload is not valid UTF-16
    #[error("Invalid string descriptor")]
    InvalidString,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
