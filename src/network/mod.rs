//! P2P Networking Layer
//!
//! Uses libp2p for peer-to-peer communication with:
//! - Kademlia DHT for peer discovery and bundle providers
//! - Request-Response protocol for control messages and bundle transfer
//! - Noise for encryption, Yamux for multiplexing

pub mod behaviour;
pub mod node;
pub mod protocol;
pub mod transport;

pub use behaviour::WikiBehaviour;
pub use node::{NodeConfig, NodeError, NodeHandle, P2PNode};
pub use protocol::{
    encode_error, ContentResponse, ControlRequest, ParseError, WireRequest, WireResponse,
    PROBE_TOKEN, PROXY_ACK_TOKEN,
};
pub use transport::{InboundRequest, PeerTransport, TransportError, TransportEvent};
