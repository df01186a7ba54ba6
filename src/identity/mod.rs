//! Device identity lookup
//!
//! Consulted once per connection at CONNECT time. Credential storage and
//! rotation live outside the core; the broker only needs a token to resolve
//! to a device's session index, or to nothing.

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::routing::SessionIndex;

/// Resolves presented device tokens to session indices
pub trait DeviceIdentity: Send + Sync {
    /// Returns the device's index, or None when the token is unknown or
    /// the device is not authorized to connect
    fn find_by_token(&self, token: &str) -> Option<SessionIndex>;
}

/// In-memory token table, used in tests and single-node deployments
#[derive(Default)]
pub struct StaticIdentity {
    devices: RwLock<AHashMap<String, SessionIndex>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, token: impl Into<String>, index: SessionIndex) {
        self.devices.write().insert(token.into(), index);
    }

    pub fn remove_device(&self, token: &str) {
        self.devices.write().remove(token);
    }
}

impl DeviceIdentity for StaticIdentity {
    fn find_by_token(&self, token: &str) -> Option<SessionIndex> {
        self.devices.read().get(token).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity_lookup() {
        let identity = StaticIdentity::new();
        identity.add_device("truck-7", 42);

        assert_eq!(identity.find_by_token("truck-7"), Some(42));
        assert_eq!(identity.find_by_token("unknown"), None);

        identity.remove_device("truck-7");
        assert_eq!(identity.find_by_token("truck-7"), None);
    }
}
