//! Decoded protocol messages
//!
//! A closed tagged union over the wire message kinds the core consumes and
//! produces. The transport's codec decodes frames into these and encodes
//! them back out; the core never sees raw bytes apart from payloads.

use bytes::Bytes;

use super::QoS;

/// Decoded protocol message - unified representation for all wire kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Message {
    /// Wire type code (fixed-header bits 7-4)
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Connect(_) => 1,
            Message::ConnAck(_) => 2,
            Message::Publish(_) => 3,
            Message::PubAck(_) => 4,
            Message::PubRec(_) => 5,
            Message::PubRel(_) => 6,
            Message::PubComp(_) => 7,
            Message::Subscribe(_) => 8,
            Message::SubAck(_) => 9,
            Message::Unsubscribe(_) => 10,
            Message::UnsubAck(_) => 11,
            Message::PingReq => 12,
            Message::PingResp => 13,
            Message::Disconnect => 14,
        }
    }
}

/// CONNECT (client -> broker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Device token presented for identity lookup
    pub token: String,
    /// Clean session flag - drop any tracked delivery state on connect
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
}

/// CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectCode {
    Accepted = 0,
    IdentifierRejected = 2,
    NotAuthorized = 5,
}

/// CONNACK (broker -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub code: ConnectCode,
}

impl ConnAck {
    pub fn new(code: ConnectCode) -> Self {
        Self { code }
    }
}

/// PUBLISH (either direction)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1/2 only
    pub message_id: Option<u16>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: Bytes, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain: false,
            dup: false,
            message_id: None,
        }
    }
}

/// PUBACK - QoS 1 acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub message_id: u16,
}

impl PubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// PUBREC - QoS 2 receive acknowledgment (first phase)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub message_id: u16,
}

impl PubRec {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// PUBREL - QoS 2 release (second phase)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub message_id: u16,
}

impl PubRel {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// PUBCOMP - QoS 2 completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub message_id: u16,
}

impl PubComp {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// SUBSCRIBE (client -> broker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub request_id: u16,
    /// Topic filters with requested QoS
    pub filters: Vec<(String, QoS)>,
}

/// Per-filter SUBACK result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturn {
    Granted(QoS),
    /// Malformed filter - wire value 0x80
    Failure,
}

/// SUBACK (broker -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub request_id: u16,
    pub granted: Vec<SubscribeReturn>,
}

/// UNSUBSCRIBE (client -> broker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub request_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK (broker -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub request_id: u16,
}
