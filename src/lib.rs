//! FleetMQ Core - subscription/delivery engine for an MQTT-style
//! device-fleet broker
//!
//! The crate holds the broker's concurrent heart: wildcard topic matching
//! with retained messages, the per-message QoS delivery state machine and
//! the session-index routing table with multi-bind and prefix fan-in. The
//! frame codec, socket transport, credential storage and cluster consensus
//! are external collaborators reached through the interfaces defined here.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod identity;
pub mod protocol;
pub mod routing;
pub mod topic;

pub use broker::{Action, BrokerCore, CoreError};
pub use config::{ConfigError, CoreConfig};
pub use delivery::{DeliveryError, DeliveryTracker};
pub use identity::{DeviceIdentity, StaticIdentity};
pub use protocol::{Message, ProtocolError, QoS};
pub use routing::{ConnId, Session, SessionIndex, SessionKind, SessionRegistry, INVALID_INDEX};
pub use topic::{FilterPattern, RetainedMessage, TopicMatcher};
