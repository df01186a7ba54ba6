//! Delivery state tracking for QoS 1/2 exchanges
//!
//! Each destination session owns a pending map of in-flight message ids.
//! Entries are created when the broker sends a message requiring an
//! acknowledgment (QoS1 PUBLISH, its own PUBREL) or receives a QoS2 PUBLISH
//! awaiting release, and destroyed on the matching ack or on session
//! cleanup. A message id may be reused only after its entry is destroyed.
//!
//! Sessions whose pending map drains are queued with a timestamp; each ack
//! purges queue entries older than the read timeout, so memory for
//! connect-ack-and-go-quiet sessions is bounded without a timer thread.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::protocol::Message;
use crate::routing::SessionIndex;

mod error;

pub use error::DeliveryError;

/// An in-flight message awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message: Message,
    pub created_at: Instant,
}

/// Per-session tracking state
#[derive(Debug)]
struct Tracking {
    pending: AHashMap<u16, PendingDelivery>,
    /// Next candidate message id; ids are scoped per destination session
    next_id: u16,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            pending: AHashMap::new(),
            next_id: 1,
        }
    }
}

/// Tracks in-flight QoS 1/2 message state per destination session
pub struct DeliveryTracker {
    sessions: DashMap<SessionIndex, Tracking>,
    /// Sessions whose pending map drained, with the drain timestamp
    idle: SegQueue<(SessionIndex, Instant)>,
    read_timeout: Duration,
    max_inflight: usize,
}

impl DeliveryTracker {
    pub fn new(read_timeout: Duration, max_inflight: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle: SegQueue::new(),
            read_timeout,
            // Ids are 16-bit with zero reserved; the bound must leave at
            // least one id free so allocation always terminates
            max_inflight: max_inflight.min(u16::MAX as usize - 1),
        }
    }

    /// Allocate the next message id for a destination session
    ///
    /// Monotonic with wraparound at the 16-bit boundary, skipping zero and
    /// any id that is currently pending for the session.
    pub fn next_message_id(&self, session: SessionIndex) -> u16 {
        let mut tracking = self.sessions.entry(session).or_default();
        loop {
            let id = tracking.next_id;
            tracking.next_id = tracking.next_id.wrapping_add(1);
            if tracking.next_id == 0 {
                tracking.next_id = 1;
            }
            if id != 0 && !tracking.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert a pending-delivery entry for `(session, message_id)`
    ///
    /// Re-registering an existing id overwrites the stored message; the
    /// transport uses that for DUP-flagged retransmission, so it is not an
    /// error. Inserting a new id beyond the per-session bound fails.
    pub fn register(
        &self,
        session: SessionIndex,
        message_id: u16,
        message: Message,
    ) -> Result<(), DeliveryError> {
        let mut tracking = self.sessions.entry(session).or_default();
        if !tracking.pending.contains_key(&message_id) && tracking.pending.len() >= self.max_inflight
        {
            return Err(DeliveryError::InflightLimit {
                session,
                limit: self.max_inflight,
            });
        }
        tracking.pending.insert(
            message_id,
            PendingDelivery {
                message,
                created_at: Instant::now(),
            },
        );
        debug!(session, message_id, "delivery registered");
        Ok(())
    }

    /// Remove the entry for `(session, message_id)`
    ///
    /// Returns true only if an entry existed, distinguishing a legitimate
    /// ack from a spurious or duplicate one.
    pub fn ack(&self, session: SessionIndex, message_id: u16) -> bool {
        self.remove_entry(session, message_id).is_some()
    }

    /// Remove the entry and hand back its stored message
    ///
    /// Used on PUBREL to forward the persisted QoS2 payload exactly once: a
    /// second release of the same id returns None.
    pub fn release(&self, session: SessionIndex, message_id: u16) -> Option<Message> {
        self.remove_entry(session, message_id)
            .map(|pending| pending.message)
    }

    fn remove_entry(&self, session: SessionIndex, message_id: u16) -> Option<PendingDelivery> {
        let removed = match self.sessions.get_mut(&session) {
            Some(mut tracking) => {
                let removed = tracking.pending.remove(&message_id);
                if removed.is_some() && tracking.pending.is_empty() {
                    self.idle.push((session, Instant::now()));
                }
                removed
            }
            None => None,
        };
        if removed.is_none() {
            warn!(session, message_id, "spurious acknowledgment ignored");
        }
        self.sweep_idle();
        removed
    }

    /// Purge idle-queue entries older than the read timeout
    ///
    /// Runs on the ack path. Entries are queued in arrival order, so the
    /// scan stops at the first fresh one. A queued session is only removed
    /// if its pending map is still empty.
    fn sweep_idle(&self) {
        while let Some((session, queued_at)) = self.idle.pop() {
            if queued_at.elapsed() < self.read_timeout {
                self.idle.push((session, queued_at));
                break;
            }
            let removed = self
                .sessions
                .remove_if(&session, |_, tracking| tracking.pending.is_empty());
            if removed.is_some() {
                debug!(session, "idle tracking state evicted");
            }
        }
    }

    /// Unconditionally drop all tracking state for a session
    ///
    /// Called on disconnect and on a clean-session connect.
    pub fn clean(&self, session: SessionIndex) {
        if self.sessions.remove(&session).is_some() {
            debug!(session, "tracking state cleaned");
        }
    }

    /// Number of pending entries for a session
    pub fn pending_count(&self, session: SessionIndex) -> usize {
        self.sessions
            .get(&session)
            .map(|t| t.pending.len())
            .unwrap_or(0)
    }

    /// Number of sessions with tracking state
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Publish, QoS};
    use bytes::Bytes;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(Duration::from_secs(60), 1024)
    }

    fn publish(id: u16) -> Message {
        let mut p = Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce);
        p.message_id = Some(id);
        Message::Publish(p)
    }

    #[test]
    fn test_ack_true_exactly_once() {
        let tracker = tracker();
        tracker.register(1, 7, publish(7)).unwrap();
        assert!(tracker.ack(1, 7));
        assert!(!tracker.ack(1, 7));
    }

    #[test]
    fn test_spurious_ack_is_ignored() {
        let tracker = tracker();
        assert!(!tracker.ack(1, 7));
        tracker.register(1, 7, publish(7)).unwrap();
        assert!(!tracker.ack(1, 8));
        assert!(!tracker.ack(2, 7));
        assert_eq!(tracker.pending_count(1), 1);
    }

    #[test]
    fn test_reregister_overwrites_for_retry() {
        let tracker = tracker();
        tracker.register(1, 7, publish(7)).unwrap();
        // DUP retransmission re-registers under the same id
        tracker.register(1, 7, publish(7)).unwrap();
        assert_eq!(tracker.pending_count(1), 1);
        assert!(tracker.ack(1, 7));
    }

    #[test]
    fn test_release_hands_back_message_once() {
        let tracker = tracker();
        tracker.register(1, 7, publish(7)).unwrap();
        assert_eq!(tracker.release(1, 7), Some(publish(7)));
        assert_eq!(tracker.release(1, 7), None);
    }

    #[test]
    fn test_message_id_skips_pending() {
        let tracker = tracker();
        let first = tracker.next_message_id(1);
        assert_eq!(first, 1);
        tracker.register(1, 2, publish(2)).unwrap();
        // id 2 is pending, allocator must skip it
        assert_eq!(tracker.next_message_id(1), 3);
    }

    #[test]
    fn test_message_id_wraps_past_zero() {
        let tracker = tracker();
        {
            let mut tracking = tracker.sessions.entry(1).or_default();
            tracking.next_id = 65535;
        }
        assert_eq!(tracker.next_message_id(1), 65535);
        assert_eq!(tracker.next_message_id(1), 1);
    }

    #[test]
    fn test_ids_scoped_per_session() {
        let tracker = tracker();
        tracker.register(1, 1, publish(1)).unwrap();
        // Session 2 may reuse id 1 freely
        assert_eq!(tracker.next_message_id(2), 1);
    }

    #[test]
    fn test_inflight_limit() {
        let tracker = DeliveryTracker::new(Duration::from_secs(60), 2);
        tracker.register(1, 1, publish(1)).unwrap();
        tracker.register(1, 2, publish(2)).unwrap();
        assert!(matches!(
            tracker.register(1, 3, publish(3)),
            Err(DeliveryError::InflightLimit { session: 1, limit: 2 })
        ));
        // Overwriting an existing id is not bounded
        tracker.register(1, 2, publish(2)).unwrap();
    }

    #[test]
    fn test_allocator_terminates_at_full_capacity() {
        // An unbounded request clamps below the id space, so one id always
        // stays free and allocation cannot spin forever
        let tracker = DeliveryTracker::new(Duration::from_secs(60), usize::MAX);
        for id in 1..u16::MAX {
            tracker.register(1, id, publish(id)).unwrap();
        }
        assert!(matches!(
            tracker.register(1, u16::MAX, publish(u16::MAX)),
            Err(DeliveryError::InflightLimit { .. })
        ));
        assert_eq!(tracker.next_message_id(1), u16::MAX);
    }

    #[test]
    fn test_clean_drops_everything() {
        let tracker = tracker();
        tracker.register(1, 1, publish(1)).unwrap();
        tracker.register(1, 2, publish(2)).unwrap();
        tracker.clean(1);
        assert_eq!(tracker.pending_count(1), 0);
        assert!(!tracker.ack(1, 1));
    }

    #[test]
    fn test_idle_eviction_piggybacks_on_ack() {
        let tracker = DeliveryTracker::new(Duration::from_millis(0), 1024);
        tracker.register(1, 1, publish(1)).unwrap();
        assert!(tracker.ack(1, 1));
        // Zero timeout: the drained session is purged by the next ack path
        tracker.register(2, 1, publish(1)).unwrap();
        assert!(tracker.ack(2, 1));
        assert_eq!(tracker.tracked_sessions(), 0);
    }

    #[test]
    fn test_idle_eviction_spares_busy_sessions() {
        let tracker = DeliveryTracker::new(Duration::from_millis(0), 1024);
        tracker.register(1, 1, publish(1)).unwrap();
        assert!(tracker.ack(1, 1));
        // Session went busy again before the sweep saw its idle entry
        tracker.register(1, 2, publish(2)).unwrap();
        tracker.register(2, 1, publish(1)).unwrap();
        assert!(tracker.ack(2, 1));
        assert_eq!(tracker.pending_count(1), 1);
    }
}
