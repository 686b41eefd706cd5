//! Proxy role: answer probes and build bundles on request

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::content::{ContentKey, ContentLifecycleManager, ContentStore};
use crate::network::{
    encode_error, ContentResponse, ControlRequest, NodeHandle, TransportEvent, PROXY_ACK_TOKEN,
};
use crate::origin::OriginFetcher;

pub struct ProxyService<S: ContentStore, O: OriginFetcher> {
    lifecycle: Arc<ContentLifecycleManager<S, O>>,
    node: Option<NodeHandle>,
}

impl<S: ContentStore, O: OriginFetcher> ProxyService<S, O> {
    pub fn new(lifecycle: Arc<ContentLifecycleManager<S, O>>) -> Self {
        Self {
            lifecycle,
            node: None,
        }
    }

    /// Announce sealed bundles through `node`
    pub fn with_node(mut self, node: NodeHandle) -> Self {
        self.node = Some(node);
        self
    }

    pub fn lifecycle(&self) -> &Arc<ContentLifecycleManager<S, O>> {
        &self.lifecycle
    }

    /// Answer one control payload
    pub async fn handle_payload(&self, payload: &str) -> String {
        match ControlRequest::decode(payload) {
            Ok(ControlRequest::Probe) => PROXY_ACK_TOKEN.to_string(),
            Ok(ControlRequest::Feed { lang }) => self.resolve(ContentKey::feed(&lang)).await,
            Ok(ControlRequest::Article { article_name }) => {
                self.resolve(ContentKey::article(&article_name)).await
            }
            Err(e) => {
                debug!("Unsupported control payload: {}", e);
                encode_error("unsupported request")
            }
        }
    }

    async fn resolve(&self, key: ContentKey) -> String {
        if key.name().is_empty() {
            return encode_error("empty name");
        }
        match self.lifecycle.request(key.clone()).await {
            Ok(handle) => {
                if let Some(node) = &self.node {
                    node.announce(handle.content_id());
                }
                ContentResponse::new(handle.content_id(), handle.name()).encode()
            }
            Err(e) => {
                warn!("Could not serve {}: {}", key, e);
                encode_error(&e.to_string())
            }
        }
    }

    /// Serve control requests until the event stream ends
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let sweeper = self.lifecycle.spawn_sweeper();
        info!("Proxy role running");

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::ControlRequest(request) => {
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        let peer_id = request.peer_id;
                        let response = service.handle_payload(&request.payload).await;
                        if !request.respond(response) {
                            debug!("{} went away before the answer", peer_id);
                        }
                    });
                }
                TransportEvent::BundleServed {
                    peer_id,
                    content_id,
                } => debug!("Served {} to {}", content_id, peer_id),
                TransportEvent::PeerConnected { peer_id } => debug!("Peer {} connected", peer_id),
                TransportEvent::PeerClosed { peer_id } => debug!("Peer {} closed", peer_id),
            }
        }

        sweeper.abort();
        info!("Proxy role stopped");
    }
}
