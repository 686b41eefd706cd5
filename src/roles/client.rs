//! Client role: classify connecting peers

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::network::{encode_error, PeerTransport, TransportEvent};
use crate::peers::{PeerRoleManager, Registration};

pub struct ClientService<T: PeerTransport> {
    peers: Arc<PeerRoleManager<T>>,
}

impl<T: PeerTransport> ClientService<T> {
    pub fn new(peers: Arc<PeerRoleManager<T>>) -> Self {
        Self { peers }
    }

    /// Track proxies until the event stream ends
    pub async fn run(self, mut events: mpsc::Receiver<TransportEvent>) {
        info!("Client role running");

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::PeerConnected { peer_id } => {
                    // Registered before spawning so a following close cancels it
                    let pending = self.peers.begin_probe(peer_id);
                    let peers = Arc::clone(&self.peers);
                    tokio::spawn(async move {
                        if let Registration::Failed(e) = peers.probe(pending).await {
                            debug!("{} left unclassified: {}", peer_id, e);
                        }
                    });
                }
                TransportEvent::PeerClosed { peer_id } => {
                    self.peers.on_peer_closed(&peer_id);
                }
                TransportEvent::ControlRequest(request) => {
                    debug!("Declining control request from {}", request.peer_id);
                    request.respond(encode_error("not a proxy"));
                }
                TransportEvent::BundleServed {
                    peer_id,
                    content_id,
                } => debug!("Shared {} with {}", content_id, peer_id),
            }
        }

        info!("Client role stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InboundRequest;
    use crate::testing::{test_peer, Reply, ScriptedTransport};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_tracks_connecting_proxies() {
        let transport = ScriptedTransport::new()
            .acknowledge_probe(test_peer(1))
            .with_reply(test_peer(2), Reply::Answer("x".into()));
        let peers = Arc::new(PeerRoleManager::new(Arc::new(transport)));
        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(ClientService::new(peers.clone()).run(events_rx));

        for n in [1, 2] {
            events_tx
                .send(TransportEvent::PeerConnected { peer_id: test_peer(n) })
                .await
                .unwrap();
        }
        for _ in 0..50 {
            if peers.contains(&test_peer(1)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(peers.proxies(), vec![test_peer(1)]);

        events_tx
            .send(TransportEvent::PeerClosed { peer_id: test_peer(1) })
            .await
            .unwrap();
        drop(events_tx);
        task.await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_peer_closed_during_probe_stays_unregistered() {
        let transport = ScriptedTransport::new()
            .acknowledge_probe_after(test_peer(1), Duration::from_millis(30));
        let peers = Arc::new(PeerRoleManager::new(Arc::new(transport)));
        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(ClientService::new(peers.clone()).run(events_rx));

        events_tx
            .send(TransportEvent::PeerConnected { peer_id: test_peer(1) })
            .await
            .unwrap();
        events_tx
            .send(TransportEvent::PeerClosed { peer_id: test_peer(1) })
            .await
            .unwrap();
        drop(events_tx);
        task.await.unwrap();

        // Give the late acknowledgement time to arrive
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_declines_control_requests() {
        let peers = Arc::new(PeerRoleManager::new(Arc::new(ScriptedTransport::new())));
        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(ClientService::new(peers).run(events_rx));

        let (responder, answer) = oneshot::channel();
        events_tx
            .send(TransportEvent::ControlRequest(InboundRequest::new(
                test_peer(3),
                "c".into(),
                responder,
            )))
            .await
            .unwrap();

        assert_ne!(answer.await.unwrap(), "p");
        drop(events_tx);
        task.await.unwrap();
    }
}
