//! Broker core error types

use std::fmt;

use crate::delivery::DeliveryError;
use crate::protocol::ProtocolError;

/// Errors surfaced to the transport; the connection they arose on should be
/// closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Message received before a successful CONNECT handshake
    NotConnected,
    /// QoS 1/2 message without a message identifier
    MissingMessageId,
    /// Malformed protocol input
    Protocol(ProtocolError),
    /// In-flight payload could not be held for the publisher
    Delivery(DeliveryError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "session has not completed CONNECT"),
            Self::MissingMessageId => write!(f, "QoS 1/2 message requires a message identifier"),
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::Delivery(e) => write!(f, "delivery failure: {}", e),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Delivery(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for CoreError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<DeliveryError> for CoreError {
    fn from(e: DeliveryError) -> Self {
        Self::Delivery(e)
    }
}
