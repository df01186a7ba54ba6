//! The live transport session handle
//!
//! A `Session` is the core's view of one physical connection. The transport
//! owns the socket; the routing tables reference the handle through `Arc`
//! and address it by index. Identity is the connection id, never the index,
//! because indices move between connections on re-login.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashSet;
use parking_lot::RwLock;

use super::{ConnId, SessionIndex, INVALID_INDEX};

/// What kind of endpoint a connection represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// A fleet device speaking the wire protocol directly
    Device,
    /// A cluster peer fanning in traffic for many remote indices
    Peer,
}

/// One live transport connection
pub struct Session {
    conn_id: ConnId,
    kind: SessionKind,
    /// Whether this connection may answer to several indices at once
    multi_bind: bool,
    /// Primary index; INVALID_INDEX until CONNECT completes
    index: AtomicU64,
    /// Clean-session flag from the CONNECT handshake
    clean_session: AtomicBool,
    /// Secondary indices bound to this connection
    bound_indices: RwLock<AHashSet<SessionIndex>>,
    /// Routing prefixes bound to this connection
    bound_prefixes: RwLock<AHashSet<u64>>,
}

impl Session {
    pub fn new(conn_id: ConnId, kind: SessionKind, multi_bind: bool) -> Self {
        Self {
            conn_id,
            kind,
            multi_bind,
            index: AtomicU64::new(INVALID_INDEX),
            clean_session: AtomicBool::new(true),
            bound_indices: RwLock::new(AHashSet::new()),
            bound_prefixes: RwLock::new(AHashSet::new()),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn supports_multi_bind(&self) -> bool {
        self.multi_bind
    }

    pub fn index(&self) -> SessionIndex {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: SessionIndex) {
        self.index.store(index, Ordering::Release);
    }

    /// Whether CONNECT has completed and the session is addressable
    pub fn is_connected(&self) -> bool {
        self.index() != INVALID_INDEX
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session.load(Ordering::Acquire)
    }

    pub fn set_clean_session(&self, clean: bool) {
        self.clean_session.store(clean, Ordering::Release);
    }

    pub fn bind_index(&self, index: SessionIndex) {
        self.bound_indices.write().insert(index);
    }

    pub fn unbind_index(&self, index: SessionIndex) {
        self.bound_indices.write().remove(&index);
    }

    pub fn bound_to(&self, index: SessionIndex) -> bool {
        self.bound_indices.read().contains(&index)
    }

    /// Take all bound indices, leaving the set empty
    pub fn drain_indices(&self) -> Vec<SessionIndex> {
        self.bound_indices.write().drain().collect()
    }

    pub fn bind_prefix(&self, prefix: u64) {
        self.bound_prefixes.write().insert(prefix);
    }

    /// Take all bound prefixes, leaving the set empty
    pub fn drain_prefixes(&self) -> Vec<u64> {
        self.bound_prefixes.write().drain().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conn_id", &self.conn_id)
            .field("kind", &self.kind)
            .field("index", &self.index())
            .field("multi_bind", &self.multi_bind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_unaddressable() {
        let session = Session::new(1, SessionKind::Device, false);
        assert!(!session.is_connected());
        assert_eq!(session.index(), INVALID_INDEX);
    }

    #[test]
    fn test_bindings_drain_once() {
        let session = Session::new(1, SessionKind::Peer, true);
        session.bind_index(100);
        session.bind_index(101);
        session.bind_prefix(7);

        assert!(session.bound_to(100));
        let mut indices = session.drain_indices();
        indices.sort_unstable();
        assert_eq!(indices, vec![100, 101]);
        assert!(session.drain_indices().is_empty());
        assert_eq!(session.drain_prefixes(), vec![7]);
    }
}
