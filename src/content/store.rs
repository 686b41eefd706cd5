//! Distribution-side content store
//!
//! `ContentStore` is the seam between the lifecycle manager and whatever
//! actually seeds bundles to other peers. `LocalContentStore` keeps seeded
//! and downloaded bundles in memory and pulls missing ones through a
//! `BundleFetcher`.

use async_trait::async_trait;
use libp2p::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::bundle::{Bundle, BundlePart, ContentId};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Content not found: {0}")]
    NotFound(ContentId),
    #[error("Content mismatch: expected {expected}, got {actual}")]
    ContentMismatch {
        expected: ContentId,
        actual: ContentId,
    },
    #[error("No bundle fetcher configured")]
    NoFetcher,
    #[error("Fetch error: {0}")]
    Fetch(String),
}

/// Seeding metadata for a new bundle
#[derive(Debug, Clone, Default)]
pub struct SeedMetadata {
    pub name: String,
    pub announce_endpoints: Vec<String>,
}

/// A bundle was served to a downloading peer
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub peer_id: PeerId,
    pub bytes: u64,
}

/// A bundle held by the store, seeded or downloaded
pub struct ContentHandle {
    content_id: ContentId,
    bundle: Bundle,
    announce_endpoints: Vec<String>,
    uploads: broadcast::Sender<UploadEvent>,
}

impl ContentHandle {
    pub fn new(bundle: Bundle, announce_endpoints: Vec<String>) -> Self {
        let (uploads, _) = broadcast::channel(64);
        Self {
            content_id: bundle.content_id(),
            bundle,
            announce_endpoints,
            uploads,
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn name(&self) -> &str {
        &self.bundle.name
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn announce_endpoints(&self) -> &[String] {
        &self.announce_endpoints
    }

    /// Subscribe to upload events for this bundle
    pub fn subscribe_uploads(&self) -> broadcast::Receiver<UploadEvent> {
        self.uploads.subscribe()
    }

    /// Report that the bundle was served to `peer_id`
    pub fn record_upload(&self, peer_id: PeerId, bytes: u64) {
        // No subscribers is fine: nobody tracks activity for this bundle.
        let _ = self.uploads.send(UploadEvent { peer_id, bytes });
    }
}

impl std::fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHandle")
            .field("content_id", &self.content_id)
            .field("name", &self.bundle.name)
            .field("parts", &self.bundle.parts.len())
            .finish()
    }
}

/// Storage and seeding of bundles on the distribution network
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Seal `parts` into a bundle and start seeding it
    async fn seed(
        &self,
        parts: Vec<BundlePart>,
        metadata: SeedMetadata,
    ) -> Result<Arc<ContentHandle>, StoreError>;

    /// Look up a locally held bundle
    fn get(&self, content_id: &ContentId) -> Option<Arc<ContentHandle>>;

    /// Download a bundle from the network (or return the local copy)
    async fn add(
        &self,
        content_id: &ContentId,
        announce_endpoints: &[String],
    ) -> Result<Arc<ContentHandle>, StoreError>;

    /// Stop seeding and drop a bundle. Returns false if it was not held.
    async fn destroy(&self, content_id: &ContentId) -> bool;
}

/// Pulls a bundle by identifier from remote peers
#[async_trait]
pub trait BundleFetcher: Send + Sync + 'static {
    async fn fetch_bundle(
        &self,
        content_id: &ContentId,
        announce_endpoints: &[String],
    ) -> Result<Bundle, StoreError>;
}

/// In-memory content store
#[derive(Default)]
pub struct LocalContentStore {
    handles: RwLock<HashMap<ContentId, Arc<ContentHandle>>>,
    fetcher: RwLock<Option<Arc<dyn BundleFetcher>>>,
}

impl LocalContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the fetcher used by `add` for bundles not held locally
    pub fn set_fetcher(&self, fetcher: Arc<dyn BundleFetcher>) {
        *self.fetcher.write() = Some(fetcher);
    }

    /// Number of bundles held
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    fn insert(&self, handle: ContentHandle) -> Arc<ContentHandle> {
        let mut handles = self.handles.write();
        handles
            .entry(handle.content_id())
            .or_insert_with(|| Arc::new(handle))
            .clone()
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn seed(
        &self,
        parts: Vec<BundlePart>,
        metadata: SeedMetadata,
    ) -> Result<Arc<ContentHandle>, StoreError> {
        let bundle = Bundle::new(metadata.name, parts);
        let handle = self.insert(ContentHandle::new(bundle, metadata.announce_endpoints));
        info!(
            "Seeding '{}' ({} parts): {}",
            handle.name(),
            handle.bundle().parts.len(),
            handle.content_id()
        );
        Ok(handle)
    }

    fn get(&self, content_id: &ContentId) -> Option<Arc<ContentHandle>> {
        self.handles.read().get(content_id).cloned()
    }

    async fn add(
        &self,
        content_id: &ContentId,
        announce_endpoints: &[String],
    ) -> Result<Arc<ContentHandle>, StoreError> {
        if let Some(handle) = self.get(content_id) {
            return Ok(handle);
        }

        let fetcher = self.fetcher.read().clone().ok_or(StoreError::NoFetcher)?;
        let bundle = fetcher.fetch_bundle(content_id, announce_endpoints).await?;

        let actual = bundle.content_id();
        if actual != *content_id {
            warn!("Downloaded bundle does not match {}", content_id);
            return Err(StoreError::ContentMismatch {
                expected: *content_id,
                actual,
            });
        }

        debug!("Downloaded '{}' ({} bytes)", bundle.name, bundle.size());
        Ok(self.insert(ContentHandle::new(bundle, announce_endpoints.to_vec())))
    }

    async fn destroy(&self, content_id: &ContentId) -> bool {
        let removed = self.handles.write().remove(content_id).is_some();
        if removed {
            info!("Stopped seeding {}", content_id);
        }
        removed
    }
}
