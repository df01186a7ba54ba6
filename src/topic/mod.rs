//! Topic matching and subscription state
//!
//! One [`FilterEntry`] exists per distinct canonical filter string. Each
//! entry carries the compiled matcher, the per-session granted QoS map and
//! an optional retained message. A single structural lock guards the table;
//! entries are small and replaced wholesale, so readers never observe a
//! half-updated filter.

mod filter;

pub use filter::{normalize, validate_topic, FilterPattern};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use crate::protocol::{ProtocolError, QoS};
use crate::routing::SessionIndex;

/// Last-known-good payload for a topic, delivered to new subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Per-filter subscription state
#[derive(Debug)]
struct FilterEntry {
    pattern: FilterPattern,
    per_session: AHashMap<SessionIndex, QoS>,
    retained: Option<RetainedMessage>,
}

impl FilterEntry {
    fn new(pattern: FilterPattern) -> Self {
        Self {
            pattern,
            per_session: AHashMap::new(),
            retained: None,
        }
    }

    /// Entries with no subscribers and no retained slot are pruned eagerly
    fn is_empty(&self) -> bool {
        self.per_session.is_empty() && self.retained.is_none()
    }
}

/// Thread-safe subscription table keyed by canonical filter
pub struct TopicMatcher {
    filters: RwLock<AHashMap<Box<str>, FilterEntry>>,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(AHashMap::new()),
        }
    }

    /// Add or upgrade a session's subscription to a filter
    ///
    /// Returns the granted QoS: the maximum of any existing grant and the
    /// requested level, so re-subscribing never downgrades a session.
    pub fn subscribe(
        &self,
        filter: &str,
        session: SessionIndex,
        requested: QoS,
    ) -> Result<QoS, ProtocolError> {
        let pattern = FilterPattern::parse(filter)?;
        let mut filters = self.filters.write();
        let entry = filters
            .entry(pattern.canonical().into())
            .or_insert_with(|| FilterEntry::new(pattern));

        let granted = entry
            .per_session
            .entry(session)
            .and_modify(|existing| *existing = (*existing).max(requested))
            .or_insert(requested);
        debug!(filter = %entry.pattern, session, granted = *granted as u8, "subscribed");
        Ok(*granted)
    }

    /// Remove a session's subscription for the matching filter(s)
    ///
    /// The unsubscribe topic is evaluated against every stored filter's
    /// matcher rather than compared for raw string equality, so a wildcard
    /// unsubscribe topic resolves to the same canonical filter used at
    /// subscribe time. Returns true if any entry was removed.
    pub fn unsubscribe(&self, filter: &str, session: SessionIndex) -> Result<bool, ProtocolError> {
        let pattern = FilterPattern::parse(filter)?;
        let mut filters = self.filters.write();
        let mut removed = false;

        for entry in filters.values_mut() {
            let hit = entry.pattern == pattern || entry.pattern.matches(pattern.canonical());
            if hit && entry.per_session.remove(&session).is_some() {
                removed = true;
                debug!(filter = %entry.pattern, session, "unsubscribed");
            }
        }
        filters.retain(|_, entry| !entry.is_empty());
        Ok(removed)
    }

    /// Collect every interested session for a published topic
    ///
    /// When a session matches under multiple filters the highest granted
    /// QoS wins.
    pub fn route(&self, topic: &str) -> SmallVec<[(SessionIndex, QoS); 16]> {
        let filters = self.filters.read();
        let mut best: AHashMap<SessionIndex, QoS> = AHashMap::new();

        for entry in filters.values() {
            if !entry.pattern.matches(topic) {
                continue;
            }
            for (&session, &granted) in &entry.per_session {
                best.entry(session)
                    .and_modify(|q| *q = (*q).max(granted))
                    .or_insert(granted);
            }
        }

        best.into_iter().collect()
    }

    /// Store, replace or clear the retained message for a topic
    ///
    /// An empty payload clears the retained slot of every filter matching
    /// the topic; otherwise the message is stored on the entry keyed by the
    /// topic's own canonical filter.
    pub fn retain(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), ProtocolError> {
        validate_topic(topic)?;
        let mut filters = self.filters.write();

        if payload.is_empty() {
            for entry in filters.values_mut() {
                if entry.pattern.matches(topic) && entry.retained.is_some() {
                    entry.retained = None;
                    debug!(filter = %entry.pattern, "retained message cleared");
                }
            }
            filters.retain(|_, entry| !entry.is_empty());
            return Ok(());
        }

        let pattern = FilterPattern::parse(topic)?;
        let entry = filters
            .entry(pattern.canonical().into())
            .or_insert_with(|| FilterEntry::new(pattern));
        entry.retained = Some(RetainedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        debug!(topic, "retained message stored");
        Ok(())
    }

    /// Retained messages whose topics match a newly subscribed filter
    pub fn matching_retained(&self, filter: &str) -> Result<Vec<RetainedMessage>, ProtocolError> {
        let pattern = FilterPattern::parse(filter)?;
        let filters = self.filters.read();
        Ok(filters
            .values()
            .filter_map(|entry| entry.retained.as_ref())
            .filter(|retained| pattern.matches(&retained.topic))
            .cloned()
            .collect())
    }

    /// Drop a session from every filter's per-session map
    pub fn clean_session(&self, session: SessionIndex) {
        let mut filters = self.filters.write();
        for entry in filters.values_mut() {
            entry.per_session.remove(&session);
        }
        filters.retain(|_, entry| !entry.is_empty());
    }

    /// Number of live filter entries
    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new()
    }
}
