//! Protocol definitions and types
//!
//! Defines the decoded message kinds the broker core consumes and produces,
//! plus the fixed-header bit layout shared with the transport's frame codec.

mod error;
mod header;
mod message;

pub use error::ProtocolError;
pub use header::{
    read_remaining_length, remaining_length_len, write_remaining_length, FixedHeader,
    MAX_REMAINING_LENGTH,
};
pub use message::*;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Effective delivery level for a subscriber: the publish QoS capped
    /// by the subscription's granted QoS.
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }

    /// Granted-level upgrade: re-subscribing never downgrades a session.
    pub fn max(self, other: Self) -> Self {
        if (self as u8) > (other as u8) {
            self
        } else {
            other
        }
    }
}
