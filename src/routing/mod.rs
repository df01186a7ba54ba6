//! Session index routing
//!
//! Maps opaque 64-bit session indices to live transport sessions. A session
//! is created on transport connect with `INVALID_INDEX` and becomes
//! addressable once the broker assigns its real index after the CONNECT
//! handshake. Multi-bind sessions answer to several indices at once
//! (cluster fan-in); prefix entries support least-loaded selection among
//! sessions sharing a routing key.
//!
//! Sessions are referenced by the tables, never owned: every lookup clones
//! an `Arc` handle and tolerates the session vanishing concurrently.

mod session;

pub use session::{Session, SessionKind};

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

/// Opaque 64-bit session identity assigned at CONNECT time
pub type SessionIndex = u64;

/// Transport connection identity, assigned before authentication
pub type ConnId = u64;

/// Sentinel for sessions that have not completed the CONNECT handshake
pub const INVALID_INDEX: SessionIndex = 0;

/// Load-balancing state for one routing prefix
#[derive(Debug, Default)]
struct PrefixEntry {
    /// Per-session selection counters
    loads: AHashMap<SessionIndex, u32>,
}

/// The session-index routing table
pub struct SessionRegistry {
    /// Primary index table: index -> live session
    by_index: DashMap<SessionIndex, Arc<Session>>,
    /// Indices owned by remote peers, resolved through a prefix
    routes: DashMap<SessionIndex, u64>,
    /// Prefix table for fair selection
    prefixes: DashMap<u64, PrefixEntry>,
    /// Live connections grouped by session kind
    slots: DashMap<SessionKind, DashSet<ConnId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            by_index: DashMap::new(),
            routes: DashMap::new(),
            prefixes: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Track a freshly accepted, not yet addressable connection
    pub fn register_session(&self, session: &Arc<Session>) {
        self.slots
            .entry(session.kind())
            .or_default()
            .insert(session.conn_id());
    }

    /// Assign `new_index` to the session; the first assignment becomes its
    /// primary index
    ///
    /// Single-login semantics: a session that held a different index and
    /// does not support multi-bind has its old mapping retired first. If a
    /// different session occupied `new_index` and still claims it as its
    /// own, that session is returned so the caller can close it; a
    /// displaced multi-bind session merely loses the one binding.
    ///
    /// Any supplied prefixes are bound for load-balanced lookup.
    pub fn map_session(
        &self,
        new_index: SessionIndex,
        session: &Arc<Session>,
        prefixes: &[u64],
    ) -> Option<Arc<Session>> {
        if new_index == INVALID_INDEX {
            return None;
        }

        let old_index = session.index();
        if session.supports_multi_bind() {
            // The first binding becomes the primary index; later binds are
            // secondary and must not disturb it
            if old_index == INVALID_INDEX {
                session.set_index(new_index);
            }
            session.bind_index(new_index);
        } else {
            if old_index != INVALID_INDEX && old_index != new_index {
                // Re-login under a new index retires the old mapping
                self.clean_index(old_index);
            }
            session.set_index(new_index);
        }
        let displaced = self.by_index.insert(new_index, session.clone());

        for &prefix in prefixes {
            self.bind_prefix(prefix, new_index);
            session.bind_prefix(prefix);
        }
        info!(index = new_index, conn = session.conn_id(), "session mapped");

        match displaced {
            Some(prev) if !Arc::ptr_eq(&prev, session) => {
                if prev.index() == new_index {
                    // Old connection still claims the index: re-login
                    // elsewhere, the caller must close it
                    return Some(prev);
                }
                if prev.supports_multi_bind() {
                    prev.unbind_index(new_index);
                }
                None
            }
            _ => None,
        }
    }

    /// Record that `index` is owned by a remote peer reachable via `prefix`
    pub fn map_route(&self, index: SessionIndex, prefix: u64) {
        self.routes.insert(index, prefix);
        debug!(index, prefix, "route mapped");
    }

    /// Direct index lookup
    pub fn find_by_index(&self, index: SessionIndex) -> Option<Arc<Session>> {
        self.by_index.get(&index).map(|entry| entry.clone())
    }

    /// Resolve an index that is itself a route to a remote peer
    ///
    /// The route yields a prefix; fair selection picks among the sessions
    /// bound to it.
    pub fn find_over_index(&self, index: SessionIndex) -> Option<Arc<Session>> {
        let prefix = *self.routes.get(&index)?;
        self.fair_load_by_prefix(prefix)
    }

    /// Least-loaded selection among the sessions bound to a prefix
    ///
    /// Increments the chosen session's counter; when a counter would
    /// overflow, all counters for the prefix reset, preserving round-robin
    /// fairness without a scheduler.
    pub fn fair_load_by_prefix(&self, prefix: u64) -> Option<Arc<Session>> {
        let chosen = {
            let mut entry = self.prefixes.get_mut(&prefix)?;
            let (&index, _) = entry.loads.iter().min_by_key(|&(_, &count)| count)?;
            if entry.loads[&index] == u32::MAX {
                for count in entry.loads.values_mut() {
                    *count = 0;
                }
            }
            *entry.loads.get_mut(&index)? += 1;
            index
        };
        self.find_by_index(chosen)
    }

    /// Remove an index mapping
    ///
    /// A locally owned index also unbinds every prefix its session held; a
    /// remote route loses only the route entry.
    pub fn clean_index(&self, index: SessionIndex) {
        if index == INVALID_INDEX {
            return;
        }
        if let Some((_, session)) = self.by_index.remove(&index) {
            for prefix in session.drain_prefixes() {
                self.unbind_prefix(prefix, index);
            }
            debug!(index, "index cleaned");
        } else if self.routes.remove(&index).is_some() {
            debug!(index, "route cleaned");
        }
    }

    /// Remove a session from every table it appears in
    ///
    /// Secondary bindings of multi-bind sessions are assumed already
    /// reconciled by the caller, so only non-multi-bind sessions have their
    /// bound indices cleaned individually.
    pub fn remove_session(&self, session: &Arc<Session>) {
        if let Some(slot) = self.slots.get(&session.kind()) {
            slot.remove(&session.conn_id());
        }
        self.release_index(session.index(), session);
        if !session.supports_multi_bind() {
            for index in session.drain_indices() {
                self.release_index(index, session);
            }
        }
    }

    /// Remove `index` only while it still maps to this session
    ///
    /// A displaced loser must never retire the winner's mapping, but its
    /// own prefix counters come out of the table either way.
    fn release_index(&self, index: SessionIndex, session: &Arc<Session>) {
        if index == INVALID_INDEX {
            return;
        }
        let removed = self
            .by_index
            .remove_if(&index, |_, mapped| Arc::ptr_eq(mapped, session));
        for prefix in session.drain_prefixes() {
            self.unbind_prefix(prefix, index);
        }
        if removed.is_some() {
            debug!(index, conn = session.conn_id(), "session unmapped");
        }
    }

    fn bind_prefix(&self, prefix: u64, index: SessionIndex) {
        let mut entry = self.prefixes.entry(prefix).or_default();
        // Start at the current floor so a newcomer is not flooded
        let floor = entry.loads.values().copied().min().unwrap_or(0);
        entry.loads.entry(index).or_insert(floor);
    }

    fn unbind_prefix(&self, prefix: u64, index: SessionIndex) {
        if let Some(mut entry) = self.prefixes.get_mut(&prefix) {
            entry.loads.remove(&index);
        }
        self.prefixes
            .remove_if(&prefix, |_, entry| entry.loads.is_empty());
    }

    /// Number of addressable sessions
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Live connection count for a session kind
    pub fn kind_count(&self, kind: SessionKind) -> usize {
        self.slots.get(&kind).map(|slot| slot.len()).unwrap_or(0)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(conn: ConnId) -> Arc<Session> {
        Arc::new(Session::new(conn, SessionKind::Device, false))
    }

    fn peer(conn: ConnId) -> Arc<Session> {
        Arc::new(Session::new(conn, SessionKind::Peer, true))
    }

    #[test]
    fn test_map_and_find() {
        let registry = SessionRegistry::new();
        let session = device(1);
        assert!(registry.map_session(42, &session, &[]).is_none());
        assert_eq!(session.index(), 42);
        assert!(Arc::ptr_eq(&registry.find_by_index(42).unwrap(), &session));
        assert!(registry.find_by_index(43).is_none());
    }

    #[test]
    fn test_remap_displaces_previous_session() {
        let registry = SessionRegistry::new();
        let a = device(1);
        let b = device(2);
        registry.map_session(42, &a, &[]);

        // Re-login elsewhere: a still claims 42, so it is reported back
        let displaced = registry.map_session(42, &b, &[]).unwrap();
        assert!(Arc::ptr_eq(&displaced, &a));
        assert!(Arc::ptr_eq(&registry.find_by_index(42).unwrap(), &b));
    }

    #[test]
    fn test_displaced_loser_cannot_retire_winner() {
        let registry = SessionRegistry::new();
        let a = device(1);
        let b = device(2);
        registry.map_session(42, &a, &[]);
        registry.map_session(42, &b, &[]).unwrap();

        // Closing the loser leaves the winner's mapping intact
        registry.remove_session(&a);
        assert!(Arc::ptr_eq(&registry.find_by_index(42).unwrap(), &b));
    }

    #[test]
    fn test_displaced_loser_still_unbinds_prefixes() {
        let registry = SessionRegistry::new();
        let a = peer(1);
        registry.map_session(42, &a, &[7]);
        let b = device(2);
        registry.map_session(42, &b, &[]).unwrap();

        // Closing the loser drops its prefix counters even though the
        // winner owns the index mapping now
        registry.remove_session(&a);
        assert!(registry.fair_load_by_prefix(7).is_none());
        assert!(Arc::ptr_eq(&registry.find_by_index(42).unwrap(), &b));
    }

    #[test]
    fn test_relogin_retires_old_index() {
        let registry = SessionRegistry::new();
        let session = device(1);
        registry.map_session(42, &session, &[]);
        registry.map_session(43, &session, &[]);
        assert!(registry.find_by_index(42).is_none());
        assert!(Arc::ptr_eq(&registry.find_by_index(43).unwrap(), &session));
    }

    #[test]
    fn test_multi_bind_keeps_other_indices() {
        let registry = SessionRegistry::new();
        let gateway = peer(1);
        registry.map_session(100, &gateway, &[]);
        registry.map_session(101, &gateway, &[]);

        // Both indices answer to the one physical connection, and the
        // first binding stays the primary index
        assert!(Arc::ptr_eq(&registry.find_by_index(100).unwrap(), &gateway));
        assert!(Arc::ptr_eq(&registry.find_by_index(101).unwrap(), &gateway));
        assert_eq!(gateway.index(), 100);
    }

    #[test]
    fn test_displacing_multi_bind_removes_single_binding() {
        let registry = SessionRegistry::new();
        let gateway = peer(1);
        registry.map_session(100, &gateway, &[]);
        registry.map_session(101, &gateway, &[]);

        let newcomer = device(2);
        // 101 is not the gateway's primary index, so no closure is signaled
        assert!(registry.map_session(101, &newcomer, &[]).is_none());
        assert!(!gateway.bound_to(101));
        assert_eq!(gateway.index(), 100);
        assert!(Arc::ptr_eq(&registry.find_by_index(100).unwrap(), &gateway));
    }

    #[test]
    fn test_fair_load_distributes_evenly() {
        let registry = SessionRegistry::new();
        for conn in 1..=3u64 {
            let session = peer(conn);
            registry.map_session(conn + 100, &session, &[7]);
        }

        let mut counts: AHashMap<ConnId, usize> = AHashMap::new();
        for _ in 0..9 {
            let chosen = registry.fair_load_by_prefix(7).unwrap();
            *counts.entry(chosen.conn_id()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 3), "{:?}", counts);
    }

    #[test]
    fn test_fair_load_unknown_prefix() {
        let registry = SessionRegistry::new();
        assert!(registry.fair_load_by_prefix(9).is_none());
    }

    #[test]
    fn test_find_over_index_resolves_route() {
        let registry = SessionRegistry::new();
        let gateway = peer(1);
        registry.map_session(100, &gateway, &[7]);
        registry.map_route(555, 7);

        let resolved = registry.find_over_index(555).unwrap();
        assert!(Arc::ptr_eq(&resolved, &gateway));
        assert!(registry.find_over_index(556).is_none());
    }

    #[test]
    fn test_clean_index_local_unbinds_prefixes() {
        let registry = SessionRegistry::new();
        let gateway = peer(1);
        registry.map_session(100, &gateway, &[7]);

        registry.clean_index(100);
        assert!(registry.find_by_index(100).is_none());
        assert!(registry.fair_load_by_prefix(7).is_none());
    }

    #[test]
    fn test_clean_index_route_only_removes_route() {
        let registry = SessionRegistry::new();
        let gateway = peer(1);
        registry.map_session(100, &gateway, &[7]);
        registry.map_route(555, 7);

        registry.clean_index(555);
        assert!(registry.find_over_index(555).is_none());
        // The prefix binding survives; only the route entry is gone
        assert!(registry.fair_load_by_prefix(7).is_some());
    }

    #[test]
    fn test_remove_session_clears_slots_and_prefixes() {
        let registry = SessionRegistry::new();
        let session = device(1);
        registry.register_session(&session);
        registry.map_session(42, &session, &[7]);
        assert_eq!(registry.kind_count(SessionKind::Device), 1);

        registry.remove_session(&session);
        assert_eq!(registry.kind_count(SessionKind::Device), 0);
        assert!(registry.find_by_index(42).is_none());
        assert!(registry.fair_load_by_prefix(7).is_none());
        assert!(registry.is_empty());
    }
}
