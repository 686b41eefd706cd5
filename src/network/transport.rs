//! Peer transport seam
//!
//! The trust protocol only needs request/response messaging with connected
//! peers and a way to ask for more of them. `NodeHandle` provides this over
//! libp2p; tests use a scripted in-process transport.

use async_trait::async_trait;
use libp2p::PeerId;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::content::ContentId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("Request to {peer} failed: {reason}")]
    RequestFailed { peer: PeerId, reason: String },
    #[error("Unexpected response from {0}")]
    UnexpectedResponse(PeerId),
    #[error("Transport stopped")]
    Stopped,
}

/// Request/response messaging with connected peers
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Send a control payload and wait for the single response
    async fn send(&self, peer: &PeerId, payload: String) -> Result<String, TransportError>;

    /// Ask the discovery layer for more peers; never blocks
    fn request_more_peers(&self);

    /// Shut the transport down
    async fn stop(&self);
}

/// Events surfaced by a running transport
#[derive(Debug)]
pub enum TransportEvent {
    /// First connection to a peer opened
    PeerConnected { peer_id: PeerId },
    /// Last connection to a peer closed
    PeerClosed { peer_id: PeerId },
    /// A peer sent a control payload and waits for an answer
    ControlRequest(InboundRequest),
    /// A locally held bundle was served to a peer
    BundleServed { peer_id: PeerId, content_id: ContentId },
}

/// An inbound control payload with its reply slot
#[derive(Debug)]
pub struct InboundRequest {
    pub peer_id: PeerId,
    pub payload: String,
    responder: oneshot::Sender<String>,
}

impl InboundRequest {
    pub fn new(peer_id: PeerId, payload: String, responder: oneshot::Sender<String>) -> Self {
        Self {
            peer_id,
            payload,
            responder,
        }
    }

    /// Answer the request. Returns false if the requester is gone.
    pub fn respond(self, response: String) -> bool {
        self.responder.send(response).is_ok()
    }
}
