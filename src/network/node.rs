//! P2P Node implementation
//!
//! The swarm is owned by a single task. Everything else talks to it through
//! a cloneable `NodeHandle`, which sends commands and waits on oneshot
//! replies keyed by outbound request id.

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identity, kad, noise,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::SwarmEvent,
    yamux, Multiaddr, PeerId, Swarm,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::behaviour::{WikiBehaviour, WikiBehaviourEvent};
use super::protocol::{WireRequest, WireResponse};
use super::transport::{InboundRequest, PeerTransport, TransportError, TransportEvent};
use crate::content::{Bundle, BundleFetcher, ContentId, ContentStore, LocalContentStore, StoreError};

/// How long a provider lookup may take before falling back to connected peers
const PROVIDER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Dial error: {0}")]
    Dial(String),
    #[error("Invalid listen address: {0}")]
    ListenAddress(String),
}

/// Node configuration
#[derive(Clone)]
pub struct NodeConfig {
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Bootstrap peers to connect to
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    /// Timeout for a single request on the wiki protocol
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_peers: vec![],
            request_timeout: Duration::from_secs(30),
        }
    }
}

enum NodeCommand {
    SendControl {
        peer: PeerId,
        payload: String,
        reply: oneshot::Sender<Result<String, TransportError>>,
    },
    FetchBundle {
        peer: PeerId,
        content_id: ContentId,
        reply: oneshot::Sender<Result<Option<Bundle>, TransportError>>,
    },
    Respond {
        channel: ResponseChannel<WireResponse>,
        response: WireResponse,
    },
    Announce {
        content_id: ContentId,
    },
    FindProviders {
        content_id: ContentId,
        reply: oneshot::Sender<HashSet<PeerId>>,
    },
    Discover,
    Shutdown,
}

enum PendingReply {
    Control(oneshot::Sender<Result<String, TransportError>>),
    Bundle(oneshot::Sender<Result<Option<Bundle>, TransportError>>),
}

impl PendingReply {
    fn fail(self, error: TransportError) {
        match self {
            PendingReply::Control(reply) => {
                let _ = reply.send(Err(error));
            }
            PendingReply::Bundle(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

struct ProviderQuery {
    found: HashSet<PeerId>,
    reply: oneshot::Sender<HashSet<PeerId>>,
}

/// P2P Node
pub struct P2PNode {
    swarm: Swarm<WikiBehaviour>,
    store: Arc<LocalContentStore>,
    event_tx: mpsc::Sender<TransportEvent>,
    command_tx: mpsc::UnboundedSender<NodeCommand>,
    command_rx: mpsc::UnboundedReceiver<NodeCommand>,
    pending: HashMap<OutboundRequestId, PendingReply>,
    provider_queries: HashMap<kad::QueryId, ProviderQuery>,
    connected: Arc<RwLock<HashSet<PeerId>>>,
    local_peer_id: PeerId,
}

impl P2PNode {
    /// Create a new P2P node serving bundles from `store`
    pub fn new(
        store: Arc<LocalContentStore>,
        config: NodeConfig,
    ) -> Result<(Self, NodeHandle, mpsc::Receiver<TransportEvent>), NodeError> {
        let local_key = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());
        let local_public_key = local_key.public();

        info!("Local peer ID: {}", local_peer_id);

        let request_timeout = config.request_timeout;
        let swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|_| WikiBehaviour::new(local_peer_id, local_public_key, request_timeout))
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let (event_tx, event_rx) = mpsc::channel(100);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(RwLock::new(HashSet::new()));

        let mut node = Self {
            swarm,
            store,
            event_tx,
            command_tx: command_tx.clone(),
            command_rx,
            pending: HashMap::new(),
            provider_queries: HashMap::new(),
            connected: connected.clone(),
            local_peer_id,
        };

        node.swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Server));

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| NodeError::ListenAddress(e.to_string()))?;
        node.swarm
            .listen_on(listen_addr)
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        for (peer_id, addr) in config.bootstrap_peers {
            node.swarm
                .dial(addr.clone())
                .map_err(|e| NodeError::Dial(e.to_string()))?;
            node.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
        }

        let handle = NodeHandle {
            command_tx,
            local_peer_id,
            connected,
        };

        Ok((node, handle, event_rx))
    }

    /// Get local peer ID
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Run the event loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the node event loop until shut down
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
                command = self.command_rx.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        for (_, reply) in self.pending.drain() {
            reply.fail(TransportError::Stopped);
        }
        for (_, query) in self.provider_queries.drain() {
            let _ = query.reply.send(query.found);
        }
        info!("Node {} stopped", self.local_peer_id);
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SendControl { peer, payload, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .wiki
                    .send_request(&peer, WireRequest::Control(payload));
                self.pending.insert(request_id, PendingReply::Control(reply));
            }
            NodeCommand::FetchBundle {
                peer,
                content_id,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .wiki
                    .send_request(&peer, WireRequest::Bundle { content_id });
                self.pending.insert(request_id, PendingReply::Bundle(reply));
            }
            NodeCommand::Respond { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .wiki
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Requester went away before the response was sent");
                }
            }
            NodeCommand::Announce { content_id } => {
                let key = kad::RecordKey::new(content_id.as_bytes());
                if let Err(e) = self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    warn!("Failed to announce {}: {:?}", content_id, e);
                }
            }
            NodeCommand::FindProviders { content_id, reply } => {
                let key = kad::RecordKey::new(content_id.as_bytes());
                let query_id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.provider_queries.insert(
                    query_id,
                    ProviderQuery {
                        found: HashSet::new(),
                        reply,
                    },
                );
            }
            NodeCommand::Discover => {
                if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                    debug!("Kademlia bootstrap skipped: {:?}", e);
                }
            }
            NodeCommand::Shutdown => {}
        }
    }

    /// Handle swarm events
    async fn handle_swarm_event(&mut self, event: SwarmEvent<WikiBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                if num_established.get() == 1 {
                    info!("Connected to {}", peer_id);
                    self.connected.write().insert(peer_id);
                    emit(&self.event_tx, TransportEvent::PeerConnected { peer_id }).await;
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    info!("Disconnected from {}", peer_id);
                    self.connected.write().remove(&peer_id);
                    emit(&self.event_tx, TransportEvent::PeerClosed { peer_id }).await;
                }
            }
            SwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(behaviour_event).await;
            }
            _ => {}
        }
    }

    /// Handle behaviour events
    async fn handle_behaviour_event(&mut self, event: WikiBehaviourEvent) {
        match event {
            WikiBehaviourEvent::Wiki(wiki_event) => {
                self.handle_wiki_event(wiki_event).await;
            }
            WikiBehaviourEvent::Kademlia(kad_event) => {
                self.handle_kad_event(kad_event);
            }
            WikiBehaviourEvent::Identify(identify_event) => {
                if let libp2p::identify::Event::Received { peer_id, info, .. } = identify_event {
                    debug!("Identified peer {}: {:?}", peer_id, info.protocols);
                    for addr in info.listen_addrs {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, addr);
                    }
                }
            }
            WikiBehaviourEvent::Ping(_) => {}
        }
    }

    async fn handle_wiki_event(&mut self, event: request_response::Event<WireRequest, WireResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.handle_request(peer, request, channel).await;
                }
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    self.handle_response(peer, request_id, response);
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!("Outbound request to {} failed: {:?}", peer, error);
                if let Some(reply) = self.pending.remove(&request_id) {
                    reply.fail(TransportError::RequestFailed {
                        peer,
                        reason: error.to_string(),
                    });
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!("Inbound request from {} failed: {:?}", peer, error);
            }
            _ => {}
        }
    }

    async fn handle_request(
        &mut self,
        peer: PeerId,
        request: WireRequest,
        channel: ResponseChannel<WireResponse>,
    ) {
        match request {
            WireRequest::Control(payload) => {
                let (responder, answer) = oneshot::channel();
                emit(&self.event_tx, TransportEvent::ControlRequest(InboundRequest::new(
                    peer, payload, responder,
                )))
                .await;

                // Answers can take as long as an origin build; wait off the loop
                let command_tx = self.command_tx.clone();
                tokio::spawn(async move {
                    match answer.await {
                        Ok(response) => {
                            let _ = command_tx.send(NodeCommand::Respond {
                                channel,
                                response: WireResponse::Control(response),
                            });
                        }
                        Err(_) => debug!("Control request from {} left unanswered", peer),
                    }
                });
            }
            WireRequest::Bundle { content_id } => {
                let response = match self.store.get(&content_id) {
                    Some(handle) => {
                        let bundle = handle.bundle().clone();
                        handle.record_upload(peer, bundle.size() as u64);
                        emit(&self.event_tx, TransportEvent::BundleServed {
                            peer_id: peer,
                            content_id,
                        })
                        .await;
                        WireResponse::Bundle(bundle)
                    }
                    None => WireResponse::NotFound { content_id },
                };
                if self
                    .swarm
                    .behaviour_mut()
                    .wiki
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Bundle requester {} went away", peer);
                }
            }
        }
    }

    fn handle_response(&mut self, peer: PeerId, request_id: OutboundRequestId, response: WireResponse) {
        let Some(reply) = self.pending.remove(&request_id) else {
            debug!("Response from {} for unknown request", peer);
            return;
        };

        match (reply, response) {
            (PendingReply::Control(reply), WireResponse::Control(payload)) => {
                let _ = reply.send(Ok(payload));
            }
            (PendingReply::Bundle(reply), WireResponse::Bundle(bundle)) => {
                let _ = reply.send(Ok(Some(bundle)));
            }
            (PendingReply::Bundle(reply), WireResponse::NotFound { .. }) => {
                let _ = reply.send(Ok(None));
            }
            (reply, _) => reply.fail(TransportError::UnexpectedResponse(peer)),
        }
    }

    /// Handle Kademlia events
    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!("Kademlia routing updated for {}", peer);
            }
            kad::Event::OutboundQueryProgressed { id, result, step, .. } => match result {
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    if let Some(query) = self.provider_queries.get_mut(&id) {
                        query.found.extend(providers);
                    }
                    if step.last {
                        self.finish_provider_query(id);
                    }
                }
                kad::QueryResult::GetProviders(_) => self.finish_provider_query(id),
                kad::QueryResult::StartProviding(Ok(kad::AddProviderOk { key })) => {
                    debug!("Started providing {:?}", key);
                }
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    debug!("Bootstrap step, {} peers remaining", ok.num_remaining);
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn finish_provider_query(&mut self, id: kad::QueryId) {
        if let Some(query) = self.provider_queries.remove(&id) {
            debug!("Provider lookup finished with {} peers", query.found.len());
            let _ = query.reply.send(query.found);
        }
    }
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    command_tx: mpsc::UnboundedSender<NodeCommand>,
    local_peer_id: PeerId,
    connected: Arc<RwLock<HashSet<PeerId>>>,
}

impl NodeHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Peers with at least one open connection
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.read().iter().copied().collect()
    }

    /// Advertise a locally seeded bundle in the DHT
    pub fn announce(&self, content_id: ContentId) {
        let _ = self.command_tx.send(NodeCommand::Announce { content_id });
    }

    /// Peers advertising `content_id` in the DHT
    pub async fn find_providers(&self, content_id: ContentId) -> HashSet<PeerId> {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(NodeCommand::FindProviders { content_id, reply })
            .is_err()
        {
            return HashSet::new();
        }
        tokio::time::timeout(PROVIDER_LOOKUP_TIMEOUT, rx)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default()
    }

    /// Ask one peer for a bundle. `Ok(None)` means the peer does not hold it.
    pub async fn request_bundle(
        &self,
        peer: PeerId,
        content_id: ContentId,
    ) -> Result<Option<Bundle>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::FetchBundle {
                peer,
                content_id,
                reply,
            })
            .map_err(|_| TransportError::Stopped)?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }
}

#[async_trait]
impl PeerTransport for NodeHandle {
    async fn send(&self, peer: &PeerId, payload: String) -> Result<String, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::SendControl {
                peer: *peer,
                payload,
                reply,
            })
            .map_err(|_| TransportError::Stopped)?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }

    fn request_more_peers(&self) {
        let _ = self.command_tx.send(NodeCommand::Discover);
    }

    async fn stop(&self) {
        let _ = self.command_tx.send(NodeCommand::Shutdown);
    }
}

#[async_trait]
impl BundleFetcher for NodeHandle {
    async fn fetch_bundle(
        &self,
        content_id: &ContentId,
        _announce_endpoints: &[String],
    ) -> Result<Bundle, StoreError> {
        let mut candidates: Vec<PeerId> = self.find_providers(*content_id).await.into_iter().collect();
        for peer in self.connected_peers() {
            if !candidates.contains(&peer) {
                candidates.push(peer);
            }
        }
        candidates.retain(|peer| *peer != self.local_peer_id);

        let mut last_error = None;
        for peer in candidates {
            match self.request_bundle(peer, *content_id).await {
                Ok(Some(bundle)) if bundle.content_id() == *content_id => {
                    debug!("Fetched {} from {}", content_id, peer);
                    return Ok(bundle);
                }
                Ok(Some(_)) => warn!("Peer {} served a bundle not matching {}", peer, content_id),
                Ok(None) => debug!("Peer {} does not hold {}", peer, content_id),
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(TransportError::Stopped) => Err(StoreError::Fetch(TransportError::Stopped.to_string())),
            _ => Err(StoreError::NotFound(*content_id)),
        }
    }
}

/// Forward an event to the role service.
///
/// Borrows only the sender: a `&P2PNode` held across the send would make the
/// event loop future `!Send`.
async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if events.send(event).await.is_err() {
        debug!("Transport event dropped, no listener");
    }
}
