//! Proxy classification and selection
//!
//! Every newly connected peer is probed with the bare `"c"` token. Peers
//! answering `"p"` are registered as proxies, in the order they answered.
//! Selection rotates through that list. A peer that disconnects while its
//! probe is in flight is never registered.

use libp2p::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::network::{ControlRequest, PeerTransport, TransportError, PROXY_ACK_TOKEN};

/// A peer classified as a proxy
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub registered_at: Instant,
}

/// Outcome of probing a newly connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// Already registered under the same id; the new registration is rejected
    Duplicate,
    /// Answered something other than the proxy acknowledgement
    NotProxy,
    /// The probe could not be delivered
    Failed(TransportError),
    /// The connection closed before the probe was answered
    Disconnected,
}

/// A probe that has been started but not yet answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingProbe {
    pub peer_id: PeerId,
    id: u64,
}

#[derive(Default)]
struct Registry {
    proxies: Vec<PeerRecord>,
    cursor: usize,
    /// Peers with a probe in flight, keyed to the probe that is current
    probing: HashMap<PeerId, u64>,
    next_probe: u64,
}

/// Tracks which connected peers are proxies
pub struct PeerRoleManager<T: PeerTransport> {
    transport: Arc<T>,
    registry: RwLock<Registry>,
}

impl<T: PeerTransport> PeerRoleManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Probe a newly connected peer and register it if it is a proxy
    pub async fn on_peer_connected(&self, peer_id: PeerId) -> Registration {
        let pending = self.begin_probe(peer_id);
        self.probe(pending).await
    }

    /// Mark a probe of `peer_id` as in flight.
    ///
    /// A close event seen after this call cancels the registration, even if
    /// the probe itself has not been sent yet.
    pub fn begin_probe(&self, peer_id: PeerId) -> PendingProbe {
        let mut registry = self.registry.write();
        registry.next_probe += 1;
        let id = registry.next_probe;
        registry.probing.insert(peer_id, id);
        PendingProbe { peer_id, id }
    }

    /// Send a started probe and register the peer on the proxy acknowledgement
    pub async fn probe(&self, pending: PendingProbe) -> Registration {
        let peer_id = pending.peer_id;
        let response = self
            .transport
            .send(&peer_id, ControlRequest::Probe.encode())
            .await;

        let mut registry = self.registry.write();
        if registry.probing.get(&peer_id) != Some(&pending.id) {
            debug!("{} disconnected before answering the probe", peer_id);
            return Registration::Disconnected;
        }
        registry.probing.remove(&peer_id);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("Probe to {} failed: {}", peer_id, e);
                return Registration::Failed(e);
            }
        };

        if response != PROXY_ACK_TOKEN {
            debug!("{} is not a proxy", peer_id);
            return Registration::NotProxy;
        }

        if registry.proxies.iter().any(|r| r.peer_id == peer_id) {
            warn!("Proxy {} already registered, rejecting duplicate", peer_id);
            return Registration::Duplicate;
        }
        registry.proxies.push(PeerRecord {
            peer_id,
            registered_at: Instant::now(),
        });
        info!("Registered proxy {} ({} known)", peer_id, registry.proxies.len());
        Registration::Registered
    }

    /// Forget a disconnected peer. Returns false if it was not a proxy.
    pub fn on_peer_closed(&self, peer_id: &PeerId) -> bool {
        let mut registry = self.registry.write();
        registry.probing.remove(peer_id);
        let Some(index) = registry.proxies.iter().position(|r| r.peer_id == *peer_id) else {
            return false;
        };
        registry.proxies.remove(index);
        // Keep pointing at the same next peer
        if index < registry.cursor {
            registry.cursor -= 1;
        }
        info!("Proxy {} disconnected ({} left)", peer_id, registry.proxies.len());
        true
    }

    /// Next proxy in rotation, or `None` when no proxy is known
    pub fn next_proxy(&self) -> Option<PeerId> {
        let mut registry = self.registry.write();
        if registry.proxies.is_empty() {
            return None;
        }
        if registry.cursor >= registry.proxies.len() {
            registry.cursor = 0;
        }
        let peer_id = registry.proxies[registry.cursor].peer_id;
        registry.cursor += 1;
        Some(peer_id)
    }

    /// Snapshot of known proxies in registration order
    pub fn proxies(&self) -> Vec<PeerId> {
        self.registry.read().proxies.iter().map(|r| r.peer_id).collect()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.registry.read().proxies.iter().any(|r| r.peer_id == *peer_id)
    }

    pub fn len(&self) -> usize {
        self.registry.read().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().proxies.is_empty()
    }
}
