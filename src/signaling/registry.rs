//! Peer registry
//!
//! Maps uuid to `Peer`. The coordinator is remembered by uuid only, so
//! ownership always stays with the map.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::peer::Peer;

pub struct PeerRegistry {
    local: Arc<Peer>,
    peers: DashMap<String, Arc<Peer>>,
    coordinator: RwLock<Option<String>>,
}

impl PeerRegistry {
    pub fn new(local: Arc<Peer>) -> Self {
        let peers = DashMap::new();
        peers.insert(local.uuid(), local.clone());
        Self {
            local,
            peers,
            coordinator: RwLock::new(None),
        }
    }

    pub fn local(&self) -> &Arc<Peer> {
        &self.local
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<Peer>> {
        self.peers.get(uuid).map(|entry| entry.value().clone())
    }

    /// Existing peer for `uuid`, or the one `create` builds, inserted atomically
    pub fn get_or_insert_with(&self, uuid: &str, create: impl FnOnce() -> Arc<Peer>) -> Arc<Peer> {
        self.peers
            .entry(uuid.to_string())
            .or_insert_with(create)
            .value()
            .clone()
    }

    /// Insert under the peer's uuid, returning whatever it displaced
    pub fn insert(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers.insert(peer.uuid(), peer)
    }

    /// Remove `peer` if its entry is still this instance
    ///
    /// Clears the coordinator reference when it pointed at the peer.
    pub fn unregister(&self, peer: &Arc<Peer>) -> bool {
        let uuid = peer.uuid();
        let removed = self
            .peers
            .remove_if(&uuid, |_, current| Arc::ptr_eq(current, peer))
            .is_some();
        if removed {
            let mut coordinator = self.coordinator.write();
            if coordinator.as_deref() == Some(uuid.as_str()) {
                tracing::info!("Coordinator {} left", peer.identity());
                *coordinator = None;
            }
        }
        removed
    }

    /// Move `peer` from `old` to `new`, updating its identity
    ///
    /// Returns whatever was registered under `new` before.
    pub fn rekey(&self, old: &str, new: &str, peer: &Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers
            .remove_if(old, |_, current| Arc::ptr_eq(current, peer));
        peer.set_uuid(new);
        let displaced = self.peers.insert(new.to_string(), peer.clone());

        let mut coordinator = self.coordinator.write();
        if coordinator.as_deref() == Some(old) {
            *coordinator = Some(new.to_string());
        }
        displaced.filter(|previous| !Arc::ptr_eq(previous, peer))
    }

    pub fn set_coordinator(&self, uuid: Option<String>) {
        *self.coordinator.write() = uuid;
    }

    /// Take the coordinator slot for `uuid` unless someone holds it
    ///
    /// On conflict the current holder is returned.
    pub fn claim_coordinator(&self, uuid: &str) -> std::result::Result<(), String> {
        let mut coordinator = self.coordinator.write();
        match coordinator.as_deref() {
            Some(current) => Err(current.to_string()),
            None => {
                *coordinator = Some(uuid.to_string());
                Ok(())
            }
        }
    }

    pub fn coordinator(&self) -> Option<String> {
        self.coordinator.read().clone()
    }

    pub fn coordinator_peer(&self) -> Option<Arc<Peer>> {
        let uuid = self.coordinator()?;
        self.get(&uuid)
    }

    /// Every registered peer except the local one
    pub fn remotes(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| !Arc::ptr_eq(entry.value(), &self.local))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.peers.contains_key(uuid)
    }

    /// Number of peers including the local one
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Peer::new(PeerIdentity::local("here")))
    }

    #[test]
    fn test_starts_with_local_peer() {
        let registry = registry();
        assert_eq!(registry.len(), 1);
        assert!(registry.remotes().is_empty());
        assert!(registry.get(&registry.local().uuid()).is_some());
    }

    #[test]
    fn test_get_or_insert_returns_same_instance() {
        let registry = registry();
        let first = registry.get_or_insert_with("p1", || Peer::new(PeerIdentity::remote("p1", "a")));
        let second = registry.get_or_insert_with("p1", || Peer::new(PeerIdentity::remote("p1", "b")));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.identity().name, "a");
    }

    #[test]
    fn test_unregister_only_same_instance() {
        let registry = registry();
        let stale = Peer::new(PeerIdentity::remote("p1", "old"));
        registry.insert(stale.clone());
        let fresh = Peer::new(PeerIdentity::remote("p1", "new"));
        registry.insert(fresh.clone());

        assert!(!registry.unregister(&stale));
        assert!(registry.contains("p1"));
        assert!(registry.unregister(&fresh));
        assert!(!registry.contains("p1"));
    }

    #[test]
    fn test_first_coordinator_claim_wins() {
        let registry = registry();
        assert!(registry.claim_coordinator("c1").is_ok());
        assert_eq!(registry.claim_coordinator("c2"), Err("c1".to_string()));
        assert_eq!(registry.coordinator().as_deref(), Some("c1"));
    }

    #[test]
    fn test_rekey_moves_coordinator() {
        let registry = registry();
        let peer = Peer::new(PeerIdentity::remote("placeholder", "coord"));
        registry.insert(peer.clone());
        registry.set_coordinator(Some("placeholder".into()));

        assert!(registry.rekey("placeholder", "c-uuid", &peer).is_none());
        assert!(!registry.contains("placeholder"));
        assert_eq!(peer.uuid(), "c-uuid");
        assert_eq!(registry.coordinator().as_deref(), Some("c-uuid"));
        assert!(Arc::ptr_eq(&registry.coordinator_peer().unwrap(), &peer));

        assert!(registry.unregister(&peer));
        assert!(registry.coordinator().is_none());
    }
}
