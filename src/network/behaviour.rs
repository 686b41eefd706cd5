//! Network behaviour of a wiki node
//!
//! Kademlia locates peers and bundle providers, the wiki request-response
//! protocol carries control messages and bundle transfers. Identify feeds
//! listen addresses into Kademlia and ping keeps idle connections open.

use libp2p::{
    identify, identity, kad, ping,
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
    PeerId, StreamProtocol,
};
use std::time::Duration;

use super::protocol::{WikiCodec, WIKI_PROTOCOL};

const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2p-wiki/kad/1.0.0");
const IDENTIFY_PROTOCOL: &str = "/p2p-wiki/id/1.0.0";

const KAD_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
// Bundles are evicted after minutes of idleness; stale provider records
// should not outlive them by much.
const PROVIDER_RECORD_TTL: Duration = Duration::from_secs(15 * 60);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(NetworkBehaviour)]
pub struct WikiBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub wiki: request_response::Behaviour<WikiCodec>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

impl WikiBehaviour {
    /// `request_timeout` bounds every outbound control or bundle request
    pub fn new(
        local_peer_id: PeerId,
        local_public_key: identity::PublicKey,
        request_timeout: Duration,
    ) -> Self {
        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(KAD_QUERY_TIMEOUT);
        kad_config.set_provider_record_ttl(Some(PROVIDER_RECORD_TTL));
        let kademlia = kad::Behaviour::with_config(
            local_peer_id,
            kad::store::MemoryStore::new(local_peer_id),
            kad_config,
        );

        let wiki = request_response::Behaviour::new(
            [(WIKI_PROTOCOL, ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(request_timeout),
        );

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), local_public_key)
                .with_agent_version(format!("p2p-wiki/{}", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            kademlia,
            wiki,
            identify,
            ping: ping::Behaviour::new(ping::Config::new().with_interval(PING_INTERVAL)),
        }
    }
}
