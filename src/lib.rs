//! p2p-wiki - Peer-to-Peer Encyclopedia Distribution
//!
//! Articles travel between peers as sealed content bundles:
//! - Proxy peers fetch articles from an origin source, package them into
//!   bundles and seed them, evicting bundles nobody downloads anymore
//! - Client peers discover proxies and ask all of them for an article
//! - A content identifier is trusted only once enough proxies agree on it
//! - Bundles are verified against their identifier after download

pub mod config;
pub mod consensus;
pub mod content;
pub mod network;
pub mod origin;
pub mod peers;
pub mod retrieval;
pub mod roles;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AppConfig, LifecycleConfig, NodeSettings, Role, SettingsError, TrustConfig};
pub use consensus::{ConsensusAggregator, ConsensusError, ResponseTally};
pub use content::{
    Article, Bundle, BundlePart, ContentHandle, ContentId, ContentKey, ContentLifecycleManager,
    ContentStore, Feed, LifecycleError, LocalContentStore,
};
pub use network::{NodeConfig, NodeHandle, P2PNode, PeerTransport, TransportError, TransportEvent};
pub use origin::{FsOrigin, OriginError, OriginFetcher};
pub use peers::{PeerRoleManager, PendingProbe, Registration};
pub use retrieval::{RetrievalCoordinator, RetrievalError};
pub use roles::{ClientService, ProxyService};
