//! Client-side retrieval
//!
//! Resolves an article name (or a feed locale) to a content identifier
//! agreed on by enough proxies, fetches the bundle from the distribution
//! network unless it is already held, and materializes it. Resolved
//! articles and feeds are cached for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::consensus::{ConsensusAggregator, ConsensusError};
use crate::content::{Article, BundleError, ContentHandle, ContentStore, Feed, StoreError};
use crate::network::{ControlRequest, ParseError, PeerTransport};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("No proxy available")]
    NoProxyAvailable,
    #[error("Empty resource name")]
    EmptyName,
    #[error("Consensus failed: {0}")]
    Consensus(ConsensusError),
    #[error("Invalid trusted response: {0}")]
    InvalidResponse(#[from] ParseError),
    #[error("Content store error: {0}")]
    Store(#[from] StoreError),
    #[error("Malformed bundle: {0}")]
    Bundle(#[from] BundleError),
}

impl From<ConsensusError> for RetrievalError {
    fn from(error: ConsensusError) -> Self {
        match error {
            ConsensusError::NoProxies => RetrievalError::NoProxyAvailable,
            other => RetrievalError::Consensus(other),
        }
    }
}

/// End-to-end article and feed retrieval for client peers
pub struct RetrievalCoordinator<T: PeerTransport, S: ContentStore> {
    consensus: Arc<ConsensusAggregator<T>>,
    store: Arc<S>,
    announce_endpoints: Vec<String>,
    articles: RwLock<HashMap<String, Article>>,
    feeds: RwLock<HashMap<String, Feed>>,
}

impl<T: PeerTransport, S: ContentStore> RetrievalCoordinator<T, S> {
    pub fn new(consensus: Arc<ConsensusAggregator<T>>, store: Arc<S>) -> Self {
        let announce_endpoints = consensus.config().announce_endpoints.clone();
        Self {
            consensus,
            store,
            announce_endpoints,
            articles: RwLock::new(HashMap::new()),
            feeds: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve and materialize an article
    pub async fn request_article(&self, name: &str) -> Result<Article, RetrievalError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RetrievalError::EmptyName);
        }
        if let Some(article) = self.articles.read().await.get(name) {
            debug!("Article '{}' served from cache", name);
            return Ok(article.clone());
        }

        let handle = self
            .resolve(ControlRequest::Article {
                article_name: name.to_string(),
            })
            .await?;
        let article = Article::from_bundle(handle.bundle())?;
        info!(
            "Retrieved article '{}' with {} media files",
            article.title,
            article.media.len()
        );

        self.articles
            .write()
            .await
            .insert(name.to_string(), article.clone());
        Ok(article)
    }

    /// Resolve and materialize the feed for a locale
    pub async fn get_feed(&self, lang: &str) -> Result<Feed, RetrievalError> {
        let lang = lang.trim().to_lowercase();
        if lang.is_empty() {
            return Err(RetrievalError::EmptyName);
        }
        if let Some(feed) = self.feeds.read().await.get(&lang) {
            debug!("Feed '{}' served from cache", lang);
            return Ok(feed.clone());
        }

        let handle = self.resolve(ControlRequest::Feed { lang: lang.clone() }).await?;
        let feed = Feed::from_bundle(&lang, handle.bundle())?;
        info!("Retrieved feed '{}' ({} bytes)", lang, feed.document.len());

        self.feeds.write().await.insert(lang, feed.clone());
        Ok(feed)
    }

    async fn resolve(&self, request: ControlRequest) -> Result<Arc<ContentHandle>, RetrievalError> {
        let peers = self.consensus.peers();
        peers.transport().request_more_peers();
        if peers.is_empty() {
            return Err(RetrievalError::NoProxyAvailable);
        }

        let response = self.consensus.resolve_content(&request).await?;
        let content_id = response.content_id()?;

        match self.store.get(&content_id) {
            Some(handle) => {
                debug!("{} already held locally", content_id);
                Ok(handle)
            }
            None => Ok(self.store.add(&content_id, &self.announce_endpoints).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, TrustConfig};
    use crate::content::{
        BundleFetcher, BundlePart, ContentId, ContentLifecycleManager, LocalContentStore,
        SeedMetadata, ARTICLE_DOCUMENT,
    };
    use crate::network::ContentResponse;
    use crate::peers::PeerRoleManager;
    use crate::roles::ProxyService;
    use crate::testing::{test_peer, Reply, ScriptedOrigin, ScriptedTransport};
    use futures::FutureExt;
    use std::time::Duration;

    fn coordinator(
        transport: ScriptedTransport,
        store: Arc<LocalContentStore>,
        threshold: usize,
    ) -> RetrievalCoordinator<ScriptedTransport, LocalContentStore> {
        let peers = Arc::new(PeerRoleManager::new(Arc::new(transport)));
        let config = TrustConfig {
            consensus_threshold: threshold,
            fanout_timeout: Duration::from_secs(5),
            ..TrustConfig::default()
        };
        let consensus = Arc::new(ConsensusAggregator::new(peers, config));
        RetrievalCoordinator::new(consensus, store)
    }

    /// Pulls bundles straight out of a proxy's store
    struct ProxyStoreFetcher(Arc<LocalContentStore>);

    #[async_trait::async_trait]
    impl BundleFetcher for ProxyStoreFetcher {
        async fn fetch_bundle(
            &self,
            content_id: &ContentId,
            _: &[String],
        ) -> Result<crate::content::Bundle, StoreError> {
            self.0
                .get(content_id)
                .map(|handle| handle.bundle().clone())
                .ok_or(StoreError::NotFound(*content_id))
        }
    }

    /// Client wired to one in-process proxy
    async fn client_with_proxy(
        origin: ScriptedOrigin,
    ) -> (
        RetrievalCoordinator<ScriptedTransport, LocalContentStore>,
        Arc<ScriptedTransport>,
    ) {
        let proxy_store = Arc::new(LocalContentStore::new());
        let proxy = Arc::new(ProxyService::new(Arc::new(ContentLifecycleManager::new(
            proxy_store.clone(),
            Arc::new(origin),
            LifecycleConfig::default(),
        ))));

        let transport = ScriptedTransport::new().acknowledge_probe(test_peer(1));
        transport.set_handler(Arc::new(move |_, payload| {
            let proxy = proxy.clone();
            async move { proxy.handle_payload(&payload).await }.boxed()
        }));

        let client_store = Arc::new(LocalContentStore::new());
        client_store.set_fetcher(Arc::new(ProxyStoreFetcher(proxy_store)));

        let coordinator = coordinator(transport, client_store, 1);
        coordinator.consensus.peers().on_peer_connected(test_peer(1)).await;
        let transport = Arc::clone(coordinator.consensus.peers().transport());
        (coordinator, transport)
    }

    #[tokio::test]
    async fn test_dog_end_to_end() {
        let origin = ScriptedOrigin::new().with_article("Dog", &["File:Dog.jpg", "File:Puppy.png"]);
        let (coordinator, transport) = client_with_proxy(origin).await;

        let article = coordinator.request_article("Dog").await.unwrap();
        assert_eq!(article.title, "Dog");
        assert!(!article.primary_document.is_empty());
        assert_eq!(article.media.len(), 2);
        assert!(article.media.contains_key("File:Dog.jpg"));
        assert!(article.media.contains_key("File:Puppy.png"));

        assert_eq!(transport.discover_calls(), 1);
        let article_requests = transport
            .sent()
            .iter()
            .filter(|(_, payload)| payload.contains("\"articleName\":\"Dog\""))
            .count();
        assert_eq!(article_requests, 1);
    }

    #[tokio::test]
    async fn test_cached_article_skips_consensus() {
        let origin = ScriptedOrigin::new().with_article("Dog", &[]);
        let (coordinator, transport) = client_with_proxy(origin).await;

        coordinator.request_article("Dog").await.unwrap();
        let sends = transport.sent().len();
        coordinator.request_article(" Dog ").await.unwrap();
        assert_eq!(transport.sent().len(), sends);
    }

    #[tokio::test]
    async fn test_feed_cached() {
        let origin = ScriptedOrigin::new().with_feed("en", b"{\"tfa\":\"Dog\"}");
        let (coordinator, transport) = client_with_proxy(origin).await;

        let feed = coordinator.get_feed("en").await.unwrap();
        assert_eq!(feed.document, b"{\"tfa\":\"Dog\"}".to_vec());

        let sends = transport.sent().len();
        assert_eq!(coordinator.get_feed("EN").await.unwrap(), feed);
        assert_eq!(transport.sent().len(), sends);
    }

    #[tokio::test]
    async fn test_no_proxy_fails_fast() {
        let coordinator = coordinator(ScriptedTransport::new(), Arc::new(LocalContentStore::new()), 1);
        let result = coordinator.request_article("Dog").await;
        assert!(matches!(result, Err(RetrievalError::NoProxyAvailable)));
        assert_eq!(coordinator.consensus.peers().transport().discover_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_surfaces_without_content() {
        let origin = ScriptedOrigin::new()
            .with_article("Dog", &["File:Dog.jpg"])
            .with_failing_media("File:Dog.jpg");
        let (coordinator, _) = client_with_proxy(origin).await;

        // The proxy answers with an error object, which never reaches consensus
        let result = coordinator.request_article("Dog").await;
        assert!(matches!(result, Err(RetrievalError::Consensus(_))));
    }

    #[tokio::test]
    async fn test_locally_held_bundle_used_directly() {
        let store = Arc::new(LocalContentStore::new());
        let handle = store
            .seed(
                vec![BundlePart::new(ARTICLE_DOCUMENT, None, b"<p>Cat</p>".to_vec())],
                SeedMetadata {
                    name: "Cat".into(),
                    announce_endpoints: vec![],
                },
            )
            .await
            .unwrap();
        let answer = ContentResponse::new(handle.content_id(), "Cat").encode();
        let transport = ScriptedTransport::new().with_proxy(test_peer(1), Reply::Answer(answer));
        let coordinator = coordinator(transport, store, 1);
        coordinator.consensus.peers().on_peer_connected(test_peer(1)).await;

        let article = coordinator.request_article("Cat").await.unwrap();
        assert_eq!(article.primary_document, b"<p>Cat</p>".to_vec());
        assert!(article.media.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_content_without_fetcher() {
        let answer = ContentResponse::new(ContentId([9; 32]), "Cat").encode();
        let transport = ScriptedTransport::new().with_proxy(test_peer(1), Reply::Answer(answer));
        let coordinator = coordinator(transport, Arc::new(LocalContentStore::new()), 1);
        coordinator.consensus.peers().on_peer_connected(test_peer(1)).await;

        let result = coordinator.request_article("Cat").await;
        assert!(matches!(result, Err(RetrievalError::Store(StoreError::NoFetcher))));
    }
}
