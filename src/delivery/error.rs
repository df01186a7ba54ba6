//! Delivery tracking error types

use std::fmt;

use crate::routing::SessionIndex;

/// Errors from the delivery tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session's pending map is full; the in-flight payload cannot be
    /// held and the failure must reach the publisher
    InflightLimit { session: SessionIndex, limit: usize },
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InflightLimit { session, limit } => write!(
                f,
                "session {} exceeded in-flight limit of {}",
                session, limit
            ),
        }
    }
}

impl std::error::Error for DeliveryError {}
