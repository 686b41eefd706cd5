//! p2p-wiki node
//!
//! Runs as a proxy (packages and seeds articles) or a client (resolves
//! articles through proxy consensus). The role is persisted in the data
//! directory and read once at start.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use p2p_wiki_lib::config::{default_data_dir, AppConfig, NodeSettings, Role};
use p2p_wiki_lib::network::{NodeHandle, P2PNode, PeerTransport, TransportEvent};
use p2p_wiki_lib::{
    ClientService, ConsensusAggregator, ContentLifecycleManager, FsOrigin, LocalContentStore,
    PeerRoleManager, ProxyService, RetrievalCoordinator,
};

/// One week
const MAX_IDLE_MINUTES: u64 = 7 * 24 * 60;

#[derive(Parser)]
#[command(name = "p2p-wiki", about = "Peer-to-peer encyclopedia node")]
struct Cli {
    /// Directory for persisted settings
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Persist a new role before starting
    #[arg(long, value_enum)]
    set_role: Option<Role>,

    /// TCP port to listen on (0 for random)
    #[arg(long, default_value = "0")]
    listen_port: u16,

    /// Bootstrap peer address ending in /p2p/<peer id>
    #[arg(long)]
    bootstrap: Vec<Multiaddr>,

    /// Agreeing proxies required before a content identifier is trusted
    #[arg(long, default_value = "1")]
    threshold: usize,

    /// Seconds to wait for proxy consensus
    #[arg(long, default_value = "30")]
    fanout_timeout: u64,

    /// Minutes a seeded bundle may stay idle before eviction
    #[arg(long, default_value = "2", value_parser = clap::value_parser!(u64).range(1..=MAX_IDLE_MINUTES))]
    idle_minutes: u64,

    /// Seconds between idle sweeps
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    sweep_secs: u64,

    /// Origin content directory (proxy role)
    #[arg(long, default_value = "origin")]
    origin_dir: PathBuf,

    /// Article to retrieve once a proxy is known (client role)
    #[arg(long)]
    article: Option<String>,

    /// Feed locale to retrieve once a proxy is known (client role)
    #[arg(long)]
    lang: Option<String>,

    /// Seconds to wait for a proxy before retrieving
    #[arg(long, default_value = "15")]
    wait_secs: u64,
}

impl Cli {
    fn app_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig {
            data_dir: self.data_dir.clone().unwrap_or_else(default_data_dir),
            ..AppConfig::default()
        };

        config.node.listen_port = self.listen_port;
        config.node.bootstrap_peers = self
            .bootstrap
            .iter()
            .map(bootstrap_peer)
            .collect::<Result<_>>()?;

        config.trust.consensus_threshold = self.threshold;
        config.trust.fanout_timeout = Duration::from_secs(self.fanout_timeout);

        config.lifecycle.idle_threshold = Duration::from_secs(self.idle_minutes * 60);
        config.lifecycle.sweep_interval = Duration::from_secs(self.sweep_secs);
        Ok(config)
    }
}

fn bootstrap_peer(addr: &Multiaddr) -> Result<(PeerId, Multiaddr)> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, addr.clone())),
        _ => Err(anyhow!("bootstrap address {} has no /p2p/<peer id>", addr)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.app_config()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let settings = NodeSettings::open(config.data_dir.join("settings"))?;
    if let Some(role) = cli.set_role {
        settings.set_role(role)?;
    }
    let role = settings.role()?;
    info!("Starting p2p-wiki as {}", role);

    let store = Arc::new(LocalContentStore::new());
    let (node, handle, events) = P2PNode::new(store.clone(), config.node.clone())?;
    store.set_fetcher(Arc::new(handle.clone()));
    let node_task = node.spawn();

    match role {
        Role::Proxy => run_proxy(&cli, &config, store, handle.clone(), events).await,
        Role::Client => run_client(&cli, &config, store, handle.clone(), events).await?,
    }

    handle.stop().await;
    node_task.await?;
    Ok(())
}

async fn run_proxy(
    cli: &Cli,
    config: &AppConfig,
    store: Arc<LocalContentStore>,
    node: NodeHandle,
    events: mpsc::Receiver<TransportEvent>,
) {
    info!("Serving origin content from {}", cli.origin_dir.display());
    let origin = Arc::new(FsOrigin::new(cli.origin_dir.clone()));
    let lifecycle = Arc::new(ContentLifecycleManager::new(
        store,
        origin,
        config.lifecycle.clone(),
    ));
    let service = Arc::new(ProxyService::new(lifecycle).with_node(node));

    tokio::select! {
        _ = service.run(events) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
}

async fn run_client(
    cli: &Cli,
    config: &AppConfig,
    store: Arc<LocalContentStore>,
    node: NodeHandle,
    events: mpsc::Receiver<TransportEvent>,
) -> Result<()> {
    let peers = Arc::new(PeerRoleManager::new(Arc::new(node)));
    let consensus = Arc::new(ConsensusAggregator::new(peers.clone(), config.trust.clone()));
    let coordinator = RetrievalCoordinator::new(consensus, store);
    let client = tokio::spawn(ClientService::new(peers.clone()).run(events));

    if cli.article.is_none() && cli.lang.is_none() {
        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        client.abort();
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.wait_secs);
    while peers.is_empty() && tokio::time::Instant::now() < deadline {
        peers.transport().request_more_peers();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    if peers.is_empty() {
        warn!("No proxy found within {}s", cli.wait_secs);
    }

    if let Some(lang) = &cli.lang {
        let feed = coordinator.get_feed(lang).await?;
        println!("{}", String::from_utf8_lossy(&feed.document));
    }
    if let Some(name) = &cli.article {
        let article = coordinator.request_article(name).await?;
        info!(
            "Article '{}': {} bytes, {} media files",
            article.title,
            article.primary_document.len(),
            article.media.len()
        );
        for file in article.media.keys() {
            println!("{}", file);
        }
    }

    client.abort();
    Ok(())
}
