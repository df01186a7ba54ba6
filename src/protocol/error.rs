//! Protocol error types

use std::fmt;

/// Errors arising from malformed protocol input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid message type code
    InvalidTypeCode(u8),
    /// Invalid QoS value (3 is reserved)
    InvalidQoS(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Remaining length exceeds maximum
    RemainingLengthTooLarge,
    /// Malformed topic filter (wildcard placement)
    InvalidFilter(&'static str),
    /// Topic name contains wildcards or is empty
    InvalidTopic(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidTypeCode(t) => write!(f, "invalid message type code: {}", t),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::RemainingLengthTooLarge => write!(f, "remaining length exceeds maximum"),
            Self::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            Self::InvalidTopic(msg) => write!(f, "invalid topic name: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
