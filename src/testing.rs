//! Shared fixtures for unit tests

use async_trait::async_trait;
use futures::future::BoxFuture;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::network::{PeerTransport, TransportError, PROBE_TOKEN, PROXY_ACK_TOKEN};
use crate::origin::{MediaBytes, MediaListItem, OriginDocument, OriginError, OriginFetcher};

pub(crate) fn test_peer(n: u8) -> PeerId {
    let bytes = [n; 32];
    let key = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes).unwrap();
    let keypair = libp2p::identity::ed25519::Keypair::from(key);
    PeerId::from(libp2p::identity::PublicKey::from(keypair.public()))
}

fn media_url(title: &str) -> String {
    format!("https://upload.example.org/{}", title)
}

#[derive(Default)]
struct OriginScript {
    articles: HashMap<String, Vec<MediaListItem>>,
    feeds: HashMap<String, Vec<u8>>,
    failing_media: HashSet<String>,
    media_delays: HashMap<String, Duration>,
    delay: Option<Duration>,
}

/// In-memory origin with scripted articles, feeds and failures
#[derive(Clone, Default)]
pub(crate) struct ScriptedOrigin {
    script: Arc<Mutex<OriginScript>>,
    document_calls: Arc<AtomicUsize>,
}

impl ScriptedOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Article `name` whose media list holds the given images
    pub fn with_article(self, name: &str, images: &[&str]) -> Self {
        {
            let mut script = self.script.lock();
            let items = script.articles.entry(name.to_string()).or_default();
            items.extend(images.iter().map(|title| MediaListItem {
                title: title.to_string(),
                source_url: Some(media_url(title)),
            }));
        }
        self
    }

    /// Media list entry without an image source
    pub fn with_non_image(self, name: &str, title: &str) -> Self {
        self.script
            .lock()
            .articles
            .entry(name.to_string())
            .or_default()
            .push(MediaListItem {
                title: title.to_string(),
                source_url: None,
            });
        self
    }

    pub fn with_failing_media(self, title: &str) -> Self {
        self.script.lock().failing_media.insert(media_url(title));
        self
    }

    /// Delay the download of one image on top of the common delay
    pub fn with_media_delay(self, title: &str, delay: Duration) -> Self {
        self.script.lock().media_delays.insert(media_url(title), delay);
        self
    }

    /// Delay every fetch
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().delay = Some(delay);
        self
    }

    pub fn with_feed(self, lang: &str, document: &[u8]) -> Self {
        self.script
            .lock()
            .feeds
            .insert(lang.to_string(), document.to_vec());
        self
    }

    /// Counter of primary document fetches
    pub fn document_calls(&self) -> Arc<AtomicUsize> {
        self.document_calls.clone()
    }

    pub fn clear_failures(&self) {
        self.script.lock().failing_media.clear();
    }

    async fn pause(&self) {
        let delay = self.script.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl OriginFetcher for ScriptedOrigin {
    async fn fetch_primary_document(&self, name: &str) -> Result<OriginDocument, OriginError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if !self.script.lock().articles.contains_key(name) {
            return Err(OriginError::NotFound(name.to_string()));
        }
        Ok(OriginDocument {
            title: name.to_string(),
            bytes: format!("<html><h1>{}</h1></html>", name).into_bytes(),
        })
    }

    async fn fetch_media_list(&self, name: &str) -> Result<Vec<MediaListItem>, OriginError> {
        self.pause().await;
        self.script
            .lock()
            .articles
            .get(name)
            .cloned()
            .ok_or_else(|| OriginError::NotFound(name.to_string()))
    }

    async fn fetch_media_bytes(&self, source_url: &str) -> Result<MediaBytes, OriginError> {
        self.pause().await;
        let extra = self.script.lock().media_delays.get(source_url).copied();
        if let Some(extra) = extra {
            tokio::time::sleep(extra).await;
        }
        if self.script.lock().failing_media.contains(source_url) {
            return Err(OriginError::Io(format!("connection reset: {}", source_url)));
        }
        Ok(MediaBytes {
            bytes: source_url.as_bytes().to_vec(),
            content_type: Some("image/jpeg".into()),
        })
    }

    async fn fetch_feed(&self, locale: &str) -> Result<Vec<u8>, OriginError> {
        self.pause().await;
        self.script
            .lock()
            .feeds
            .get(locale)
            .cloned()
            .ok_or_else(|| OriginError::NotFound(locale.to_string()))
    }
}

/// Scripted answer of one peer
#[derive(Clone)]
pub(crate) enum Reply {
    Answer(String),
    Delayed(Duration, String),
    Fail,
    /// Never answers
    Silent,
}

pub(crate) type Handler = Arc<dyn Fn(PeerId, String) -> BoxFuture<'static, String> + Send + Sync>;

/// In-process transport with per-peer scripted replies
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<HashMap<PeerId, Reply>>,
    proxies: Mutex<HashSet<PeerId>>,
    probe_delays: Mutex<HashMap<PeerId, Duration>>,
    handler: Mutex<Option<Handler>>,
    sent: Mutex<Vec<(PeerId, String)>>,
    discover_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, peer: PeerId, reply: Reply) -> Self {
        self.replies.lock().insert(peer, reply);
        self
    }

    /// Answer the probe from `peer` with the proxy acknowledgement
    pub fn acknowledge_probe(self, peer: PeerId) -> Self {
        self.proxies.lock().insert(peer);
        self
    }

    /// Acknowledge the probe from `peer` only after `delay`
    pub fn acknowledge_probe_after(self, peer: PeerId, delay: Duration) -> Self {
        self.probe_delays.lock().insert(peer, delay);
        self.acknowledge_probe(peer)
    }

    /// A proxy answering everything but the probe with `reply`
    pub fn with_proxy(self, peer: PeerId, reply: Reply) -> Self {
        self.acknowledge_probe(peer).with_reply(peer, reply)
    }

    /// Route every send without a scripted reply through `handler`
    pub fn set_handler(&self, handler: Handler) {
        *self.handler.lock() = Some(handler);
    }

    pub fn sent(&self) -> Vec<(PeerId, String)> {
        self.sent.lock().clone()
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn send(&self, peer: &PeerId, payload: String) -> Result<String, TransportError> {
        self.sent.lock().push((*peer, payload.clone()));
        if payload == PROBE_TOKEN && self.proxies.lock().contains(peer) {
            let delay = self.probe_delays.lock().get(peer).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            return Ok(PROXY_ACK_TOKEN.to_string());
        }

        let reply = self.replies.lock().get(peer).cloned();
        match reply {
            Some(Reply::Answer(response)) => Ok(response),
            Some(Reply::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Reply::Fail) => Err(TransportError::RequestFailed {
                peer: *peer,
                reason: "stream reset".into(),
            }),
            Some(Reply::Silent) => futures::future::pending().await,
            None => {
                let handler = self.handler.lock().clone();
                match handler {
                    Some(handler) => Ok(handler(*peer, payload).await),
                    None => Err(TransportError::NotConnected(*peer)),
                }
            }
        }
    }

    fn request_more_peers(&self) {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self) {}
}
