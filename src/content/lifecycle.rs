//! Proxy-side bundle lifecycle
//!
//! Each content key moves through `absent -> pending -> ready`, or
//! `pending -> failed` (the entry is dropped and every waiter rejected),
//! and finally `ready -> absent` when the idle sweep evicts it.
//!
//! There is exactly one entry per key. A request for a key that is already
//! pending joins the waiters of the in-flight build instead of starting a
//! second one.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bundle::{BundlePart, ContentId, ARTICLE_DOCUMENT, FEED_DOCUMENT};
use super::progress::{BuildProgress, SealedParts};
use super::store::{ContentHandle, ContentStore, SeedMetadata, StoreError};
use crate::config::LifecycleConfig;
use crate::origin::{MediaBytes, MediaListItem, OriginDocument, OriginError, OriginFetcher};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug, Clone)]
pub enum LifecycleError {
    #[error("Origin fetch failed: {0}")]
    Origin(#[from] OriginError),
    #[error("Seeding failed: {0}")]
    Seed(#[from] StoreError),
    #[error("Build ended without a result")]
    Abandoned,
}

/// Identifies one packaged resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentKey {
    Article(String),
    Feed(String),
}

impl ContentKey {
    pub fn article(name: &str) -> Self {
        ContentKey::Article(name.trim().to_string())
    }

    pub fn feed(lang: &str) -> Self {
        ContentKey::Feed(lang.trim().to_ascii_lowercase())
    }

    /// Article name or feed locale
    pub fn name(&self) -> &str {
        match self {
            ContentKey::Article(name) | ContentKey::Feed(name) => name,
        }
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKey::Article(name) => write!(f, "article:{}", name),
            ContentKey::Feed(lang) => write!(f, "feed:{}", lang),
        }
    }
}

type Waiter = oneshot::Sender<Result<Arc<ContentHandle>, LifecycleError>>;

/// Build state of a seeding entry
pub enum BuildState {
    Pending {
        progress: BuildProgress,
        waiters: Vec<Waiter>,
    },
    Ready {
        handle: Arc<ContentHandle>,
    },
}

/// One content key tracked by the manager
pub struct SeedingEntry {
    /// Distinguishes this entry from earlier failed builds of the same key
    generation: u64,
    state: BuildState,
    last_active: Instant,
}

impl SeedingEntry {
    fn pending(generation: u64, progress: BuildProgress, waiter: Waiter) -> Self {
        Self {
            generation,
            state: BuildState::Pending {
                progress,
                waiters: vec![waiter],
            },
            last_active: Instant::now(),
        }
    }
}

/// Coarse status of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Ready,
}

/// Snapshot of an entry for inspection
#[derive(Debug, Clone)]
pub struct EntryStatus {
    pub status: BuildStatus,
    pub content_id: Option<ContentId>,
    pub expected_media: Option<usize>,
    pub fetched_media: usize,
    pub last_active: Instant,
}

enum Arrival {
    Document(OriginDocument),
    MediaList(Vec<MediaListItem>),
    Media { title: String, media: MediaBytes },
    Feed(Vec<u8>),
}

type Fetch = BoxFuture<'static, Result<Arrival, OriginError>>;

async fn with_timeout<T>(
    limit: Duration,
    what: String,
    fetch: impl Future<Output = Result<T, OriginError>>,
) -> Result<T, OriginError> {
    tokio::time::timeout(limit, fetch)
        .await
        .map_err(|_| OriginError::Timeout(what))?
}

type Entries = Arc<RwLock<HashMap<ContentKey, SeedingEntry>>>;

/// Packages origin content into seeded bundles and evicts idle ones
pub struct ContentLifecycleManager<S: ContentStore, O: OriginFetcher> {
    store: Arc<S>,
    origin: Arc<O>,
    config: LifecycleConfig,
    entries: Entries,
    next_generation: AtomicU64,
}

impl<S: ContentStore, O: OriginFetcher> ContentLifecycleManager<S, O> {
    pub fn new(store: Arc<S>, origin: Arc<O>, config: LifecycleConfig) -> Self {
        Self {
            store,
            origin,
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Resolve `key` to a seeded bundle, building it if needed.
    ///
    /// Ready entries resolve immediately. Pending entries queue the caller
    /// until the in-flight build finishes. The build runs on its own task,
    /// so dropping the returned future does not stop it.
    pub async fn request(
        self: &Arc<Self>,
        key: ContentKey,
    ) -> Result<Arc<ContentHandle>, LifecycleError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&key) {
                Some(entry) => match &mut entry.state {
                    BuildState::Ready { handle } => {
                        debug!("{} already seeding as {}", key, handle.content_id());
                        return Ok(handle.clone());
                    }
                    BuildState::Pending { waiters, .. } => {
                        debug!("{} build in flight, queueing request", key);
                        waiters.push(tx);
                    }
                },
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let progress = match key {
                        ContentKey::Article(_) => BuildProgress::new(),
                        ContentKey::Feed(_) => BuildProgress::without_media(),
                    };
                    entries.insert(key.clone(), SeedingEntry::pending(generation, progress, tx));
                    info!("Started building {}", key);

                    let manager = Arc::clone(self);
                    let key = key.clone();
                    tokio::spawn(async move { manager.build(key, generation).await });
                }
            }
        }

        rx.await.map_err(|_| LifecycleError::Abandoned)?
    }

    async fn build(self: Arc<Self>, key: ContentKey, generation: u64) {
        if let Err(error) = self.run_build(&key, generation).await {
            self.fail(&key, generation, error).await;
        }
    }

    async fn run_build(&self, key: &ContentKey, generation: u64) -> Result<(), LifecycleError> {
        let mut fetches: FuturesUnordered<Fetch> = FuturesUnordered::new();
        match key {
            ContentKey::Article(name) => {
                fetches.push(self.fetch_document(name));
                fetches.push(self.fetch_media_list(name));
            }
            ContentKey::Feed(lang) => fetches.push(self.fetch_feed(lang)),
        }

        while let Some(arrival) = fetches.next().await {
            let arrival = arrival?;
            let sealed = {
                let mut entries = self.entries.write().await;
                let Some(progress) = pending_progress(&mut entries, key, generation) else {
                    debug!("{} build superseded, dropping part", key);
                    return Ok(());
                };

                match arrival {
                    Arrival::Document(document) => {
                        debug!("{}: fetched document", key);
                        progress.record_document(
                            document.title,
                            BundlePart::new(ARTICLE_DOCUMENT, Some("text/html".into()), document.bytes),
                        );
                    }
                    Arrival::MediaList(items) => {
                        let images = packable_images(key, items);
                        debug!("{}: media list has {} images", key, images.len());
                        progress.set_expected_media(images.len());
                        for (title, url) in images {
                            fetches.push(self.fetch_media(title, url));
                        }
                    }
                    Arrival::Media { title, media } => {
                        progress.record_media(BundlePart::new(title, media.content_type, media.bytes));
                        debug!(
                            "{}: fetched image {}/{}",
                            key,
                            progress.fetched_media(),
                            progress.expected_media().unwrap_or(0)
                        );
                    }
                    Arrival::Feed(document) => {
                        progress.record_document(
                            key.name(),
                            BundlePart::new(FEED_DOCUMENT, Some("application/json".into()), document),
                        );
                    }
                }

                progress.try_seal()
            };

            if let Some(sealed) = sealed {
                self.seal(key, generation, sealed).await?;
            }
        }

        Ok(())
    }

    fn fetch_document(&self, name: &str) -> Fetch {
        let origin = Arc::clone(&self.origin);
        let limit = self.config.origin_timeout;
        let name = name.to_string();
        async move {
            with_timeout(limit, name.clone(), origin.fetch_primary_document(&name))
                .await
                .map(Arrival::Document)
        }
        .boxed()
    }

    fn fetch_media_list(&self, name: &str) -> Fetch {
        let origin = Arc::clone(&self.origin);
        let limit = self.config.origin_timeout;
        let name = name.to_string();
        async move {
            with_timeout(limit, name.clone(), origin.fetch_media_list(&name))
                .await
                .map(Arrival::MediaList)
        }
        .boxed()
    }

    fn fetch_media(&self, title: String, url: String) -> Fetch {
        let origin = Arc::clone(&self.origin);
        let limit = self.config.origin_timeout;
        async move {
            let media = with_timeout(limit, url.clone(), origin.fetch_media_bytes(&url)).await?;
            Ok(Arrival::Media { title, media })
        }
        .boxed()
    }

    fn fetch_feed(&self, lang: &str) -> Fetch {
        let origin = Arc::clone(&self.origin);
        let limit = self.config.origin_timeout;
        let lang = lang.to_string();
        async move {
            with_timeout(limit, lang.clone(), origin.fetch_feed(&lang))
                .await
                .map(Arrival::Feed)
        }
        .boxed()
    }

    /// Hand sealed parts to the store and resolve every waiter
    async fn seal(
        &self,
        key: &ContentKey,
        generation: u64,
        sealed: SealedParts,
    ) -> Result<(), LifecycleError> {
        let metadata = SeedMetadata {
            name: sealed.title,
            announce_endpoints: self.config.announce_endpoints.clone(),
        };
        let handle = self.store.seed(sealed.parts, metadata).await?;

        let waiters = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(key) {
                Some(entry) if entry.generation == generation => {
                    entry.last_active = Instant::now();
                    let previous = std::mem::replace(
                        &mut entry.state,
                        BuildState::Ready {
                            handle: handle.clone(),
                        },
                    );
                    match previous {
                        BuildState::Pending { waiters, .. } => waiters,
                        BuildState::Ready { .. } => Vec::new(),
                    }
                }
                _ => {
                    drop(entries);
                    debug!("{} vanished while sealing, releasing bundle", key);
                    self.store.destroy(&handle.content_id()).await;
                    return Ok(());
                }
            }
        };

        info!("Sealed {} as {}", key, handle.content_id());
        self.track_activity(key.clone(), generation, &handle);

        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
        Ok(())
    }

    /// Drop a failed build and reject everyone waiting on it
    async fn fail(&self, key: &ContentKey, generation: u64, error: LifecycleError) {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(key) {
                Some(entry) if entry.generation == generation => entries.remove(key),
                _ => None,
            }
        };

        warn!("Building {} failed: {}", key, error);

        if let Some(SeedingEntry {
            state: BuildState::Pending { waiters, .. },
            ..
        }) = removed
        {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Refresh the entry whenever the bundle is uploaded to a peer
    fn track_activity(&self, key: ContentKey, generation: u64, handle: &ContentHandle) {
        let mut uploads = handle.subscribe_uploads();
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            loop {
                match uploads.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if !touch(&entries, &key, generation, Instant::now()).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Record a consumption event for a ready entry.
    /// Returns false if the key is not ready.
    pub async fn record_activity(&self, key: &ContentKey) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if matches!(entry.state, BuildState::Ready { .. }) => {
                entry.last_active = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Evict ready entries idle for longer than the threshold
    pub async fn sweep(&self) -> Vec<ContentKey> {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: Instant) -> Vec<ContentKey> {
        let idle_threshold = self.config.idle_threshold;
        let (evicted, still_held) = {
            let mut entries = self.entries.write().await;
            let expired: Vec<ContentKey> = entries
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry.state, BuildState::Ready { .. })
                        && now.saturating_duration_since(entry.last_active) > idle_threshold
                })
                .map(|(key, _)| key.clone())
                .collect();

            let mut evicted = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(SeedingEntry {
                    state: BuildState::Ready { handle },
                    ..
                }) = entries.remove(&key)
                {
                    evicted.push((key, handle));
                }
            }

            // Two keys can resolve to identical content; keep it if still in use
            let still_held: Vec<ContentId> = entries
                .values()
                .filter_map(|entry| match &entry.state {
                    BuildState::Ready { handle } => Some(handle.content_id()),
                    BuildState::Pending { .. } => None,
                })
                .collect();
            (evicted, still_held)
        };

        let mut keys = Vec::with_capacity(evicted.len());
        for (key, handle) in evicted {
            if !still_held.contains(&handle.content_id()) {
                self.store.destroy(&handle.content_id()).await;
            }
            info!("Evicted idle {}", key);
            keys.push(key);
        }
        keys
    }

    /// Run the idle sweep every `sweep_interval`
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            // A zero period would panic inside `interval`
            let period = manager.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = manager.sweep().await;
                if !evicted.is_empty() {
                    debug!("Idle sweep evicted {} bundles", evicted.len());
                }
            }
        })
    }

    pub async fn status(&self, key: &ContentKey) -> Option<EntryStatus> {
        let entries = self.entries.read().await;
        entries.get(key).map(|entry| match &entry.state {
            BuildState::Pending { progress, .. } => EntryStatus {
                status: BuildStatus::Pending,
                content_id: None,
                expected_media: progress.expected_media(),
                fetched_media: progress.fetched_media(),
                last_active: entry.last_active,
            },
            BuildState::Ready { handle } => {
                let media = handle.bundle().parts.len().saturating_sub(1);
                EntryStatus {
                    status: BuildStatus::Ready,
                    content_id: Some(handle.content_id()),
                    expected_media: Some(media),
                    fetched_media: media,
                    last_active: entry.last_active,
                }
            }
        })
    }

    /// Number of tracked entries, pending or ready
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Image entries of a media list, one per file name.
///
/// Entries without a source, repeated titles and titles that would shadow
/// the primary document are skipped, so every sealed media part maps to
/// its own file.
fn packable_images(key: &ContentKey, items: Vec<MediaListItem>) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(MediaListItem::is_image)
        .filter_map(|item| {
            if item.title == ARTICLE_DOCUMENT {
                warn!("{}: skipping media titled {}", key, item.title);
                return None;
            }
            if !seen.insert(item.title.clone()) {
                debug!("{}: skipping repeated media {}", key, item.title);
                return None;
            }
            item.source_url.map(|url| (item.title, url))
        })
        .collect()
}

fn pending_progress<'a>(
    entries: &'a mut HashMap<ContentKey, SeedingEntry>,
    key: &ContentKey,
    generation: u64,
) -> Option<&'a mut BuildProgress> {
    match entries.get_mut(key) {
        Some(SeedingEntry {
            generation: current,
            state: BuildState::Pending { progress, .. },
            ..
        }) if *current == generation => Some(progress),
        _ => None,
    }
}

async fn touch(entries: &Entries, key: &ContentKey, generation: u64, now: Instant) -> bool {
    let mut entries = entries.write().await;
    match entries.get_mut(key) {
        Some(entry) if entry.generation == generation => {
            entry.last_active = now;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Article, LocalContentStore};
    use crate::testing::{test_peer, ScriptedOrigin};

    fn manager(
        origin: ScriptedOrigin,
    ) -> (
        Arc<ContentLifecycleManager<LocalContentStore, ScriptedOrigin>>,
        Arc<LocalContentStore>,
    ) {
        let store = Arc::new(LocalContentStore::new());
        let manager = Arc::new(ContentLifecycleManager::new(
            store.clone(),
            Arc::new(origin),
            LifecycleConfig::default(),
        ));
        (manager, store)
    }

    #[tokio::test]
    async fn test_builds_article_with_media() {
        let origin = ScriptedOrigin::new().with_article("Dog", &["File:Dog.jpg", "File:Puppy.png"]);
        let (manager, store) = manager(origin);

        let handle = manager.request(ContentKey::article("Dog")).await.unwrap();
        let article = Article::from_bundle(handle.bundle()).unwrap();
        assert_eq!(article.title, "Dog");
        assert_eq!(article.media.len(), 2);
        assert!(store.get(&handle.content_id()).is_some());

        let status = manager.status(&ContentKey::article("Dog")).await.unwrap();
        assert_eq!(status.status, BuildStatus::Ready);
        assert_eq!(status.fetched_media, 2);
    }

    #[tokio::test]
    async fn test_non_image_media_not_counted() {
        let origin = ScriptedOrigin::new()
            .with_article("Dog", &["File:Dog.jpg"])
            .with_non_image("Dog", "Bark.ogg");
        let (manager, _) = manager(origin);

        let handle = manager.request(ContentKey::article("Dog")).await.unwrap();
        assert_eq!(handle.bundle().parts.len(), 2);
    }

    #[tokio::test]
    async fn test_content_id_independent_of_fetch_order() {
        let slow_a = ScriptedOrigin::new()
            .with_article("Dog", &["File:A.jpg", "File:B.jpg"])
            .with_media_delay("File:A.jpg", Duration::from_millis(50));
        let slow_b = ScriptedOrigin::new()
            .with_article("Dog", &["File:A.jpg", "File:B.jpg"])
            .with_media_delay("File:B.jpg", Duration::from_millis(50));
        let (first, _) = manager(slow_a);
        let (second, _) = manager(slow_b);

        let (a, b) = tokio::join!(
            first.request(ContentKey::article("Dog")),
            second.request(ContentKey::article("Dog")),
        );
        assert_eq!(a.unwrap().content_id(), b.unwrap().content_id());
    }

    #[tokio::test]
    async fn test_repeated_media_titles_packaged_once() {
        let origin = ScriptedOrigin::new().with_article("Dog", &["File:Dog.jpg", "File:Dog.jpg"]);
        let (manager, _) = manager(origin);

        let handle = manager.request(ContentKey::article("Dog")).await.unwrap();
        let article = Article::from_bundle(handle.bundle()).unwrap();
        assert_eq!(handle.bundle().parts.len(), 2);
        assert_eq!(article.media.len(), 1);
    }

    #[tokio::test]
    async fn test_media_named_like_document_skipped() {
        let origin = ScriptedOrigin::new().with_article("Dog", &[ARTICLE_DOCUMENT, "File:Dog.jpg"]);
        let (manager, _) = manager(origin);

        let handle = manager.request(ContentKey::article("Dog")).await.unwrap();
        let article = Article::from_bundle(handle.bundle()).unwrap();
        assert_eq!(article.primary_document, b"<html><h1>Dog</h1></html>".to_vec());
        assert_eq!(article.media.keys().collect::<Vec<_>>(), ["File:Dog.jpg"]);
        assert_eq!(handle.bundle().parts.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_build() {
        let origin = ScriptedOrigin::new()
            .with_article("Dog", &["File:Dog.jpg"])
            .with_delay(Duration::from_millis(50));
        let calls = origin.document_calls();
        let (manager, store) = manager(origin);

        let (a, b, c) = tokio::join!(
            manager.request(ContentKey::article("Dog")),
            manager.request(ContentKey::article("Dog")),
            manager.request(ContentKey::article("Dog")),
        );

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a.content_id(), b.content_id());
        assert_eq!(b.content_id(), c.content_id());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_ready_entry_resolves_without_rebuild() {
        let origin = ScriptedOrigin::new().with_article("Dog", &[]);
        let calls = origin.document_calls();
        let (manager, _) = manager(origin);

        let first = manager.request(ContentKey::article("Dog")).await.unwrap();
        let second = manager.request(ContentKey::article(" Dog ")).await.unwrap();
        assert_eq!(first.content_id(), second.content_id());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_origin_failure_rejects_all_waiters() {
        let origin = ScriptedOrigin::new()
            .with_article("Dog", &["File:Dog.jpg"])
            .with_failing_media("File:Dog.jpg")
            .with_delay(Duration::from_millis(20));
        let (manager, store) = manager(origin);

        let (a, b) = tokio::join!(
            manager.request(ContentKey::article("Dog")),
            manager.request(ContentKey::article("Dog")),
        );
        assert!(matches!(a, Err(LifecycleError::Origin(_))));
        assert!(matches!(b, Err(LifecycleError::Origin(_))));
        assert!(manager.status(&ContentKey::article("Dog")).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_article_fails() {
        let (manager, _) = manager(ScriptedOrigin::new());
        let result = manager.request(ContentKey::article("Nope")).await;
        assert!(matches!(result, Err(LifecycleError::Origin(OriginError::NotFound(_)))));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_feed_bundle() {
        let origin = ScriptedOrigin::new().with_feed("en", b"{\"mostread\":[]}");
        let (manager, _) = manager(origin);

        let handle = manager.request(ContentKey::feed("EN")).await.unwrap();
        assert_eq!(handle.bundle().parts.len(), 1);
        assert_eq!(handle.bundle().parts[0].name, FEED_DOCUMENT);
    }

    #[tokio::test]
    async fn test_idle_entry_evicted() {
        let origin = ScriptedOrigin::new().with_article("Dog", &[]);
        let (manager, store) = manager(origin);
        let key = ContentKey::article("Dog");
        let handle = manager.request(key.clone()).await.unwrap();

        let now = Instant::now();
        let idle = manager.config().idle_threshold;
        assert!(manager.sweep_at(now).await.is_empty());

        let evicted = manager.sweep_at(now + idle + Duration::from_millis(1)).await;
        assert_eq!(evicted, vec![key.clone()]);
        assert!(manager.status(&key).await.is_none());
        assert!(store.get(&handle.content_id()).is_none());
    }

    #[tokio::test]
    async fn test_refreshed_entry_survives() {
        let origin = ScriptedOrigin::new().with_article("Dog", &[]);
        let (manager, _) = manager(origin);
        let key = ContentKey::article("Dog");
        manager.request(key.clone()).await.unwrap();

        let refreshed_at = Instant::now();
        assert!(manager.record_activity(&key).await);

        let idle = manager.config().idle_threshold;
        let tick = refreshed_at + idle - Duration::from_millis(1);
        assert!(manager.sweep_at(tick).await.is_empty());
        assert!(manager.status(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_upload_refreshes_activity() {
        let origin = ScriptedOrigin::new().with_article("Dog", &[]);
        let (manager, _) = manager(origin);
        let key = ContentKey::article("Dog");
        let handle = manager.request(key.clone()).await.unwrap();

        let before_upload = Instant::now();
        handle.record_upload(test_peer(7), 10);

        // Let the activity tracker run
        let mut refreshed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let status = manager.status(&key).await.unwrap();
            if status.last_active >= before_upload {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed);

        let idle = manager.config().idle_threshold;
        assert!(manager
            .sweep_at(before_upload + idle - Duration::from_millis(1))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_survives_zero_interval() {
        let store = Arc::new(LocalContentStore::new());
        let config = LifecycleConfig {
            idle_threshold: Duration::ZERO,
            sweep_interval: Duration::ZERO,
            ..LifecycleConfig::default()
        };
        let manager = Arc::new(ContentLifecycleManager::new(
            store.clone(),
            Arc::new(ScriptedOrigin::new().with_article("Dog", &[])),
            config,
        ));
        manager.request(ContentKey::article("Dog")).await.unwrap();

        let sweeper = manager.spawn_sweeper();
        for _ in 0..50 {
            if manager.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!sweeper.is_finished());
        assert!(manager.is_empty().await);
        assert!(store.is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_pending_entry_not_evicted() {
        let origin = ScriptedOrigin::new()
            .with_article("Dog", &[])
            .with_delay(Duration::from_millis(100));
        let (manager, _) = manager(origin);
        let key = ContentKey::article("Dog");

        let request = {
            let manager = manager.clone();
            let key = key.clone();
            tokio::spawn(async move { manager.request(key).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(manager.sweep_at(far_future).await.is_empty());
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rebuild_after_failure() {
        let origin = ScriptedOrigin::new()
            .with_article("Dog", &["File:Dog.jpg"])
            .with_failing_media("File:Dog.jpg");
        let (manager, _) = manager(origin.clone());

        assert!(manager.request(ContentKey::article("Dog")).await.is_err());
        origin.clear_failures();
        assert!(manager.request(ContentKey::article("Dog")).await.is_ok());
    }
}
