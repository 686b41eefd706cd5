//! Origin encyclopedia access
//!
//! Proxies package articles from an origin source. The trait below is the
//! only thing the lifecycle manager knows about it.

mod fs;

pub use fs::FsOrigin;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OriginError {
    #[error("Not found at origin: {0}")]
    NotFound(String),
    #[error("Origin I/O error: {0}")]
    Io(String),
    #[error("Invalid origin data: {0}")]
    InvalidData(String),
    #[error("Origin fetch timed out: {0}")]
    Timeout(String),
}

/// The primary document of an article
#[derive(Debug, Clone)]
pub struct OriginDocument {
    pub title: String,
    pub bytes: Vec<u8>,
}

/// One entry of an article's media list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaListItem {
    pub title: String,
    /// Image source; entries without one are not packaged
    pub source_url: Option<String>,
}

impl MediaListItem {
    pub fn is_image(&self) -> bool {
        self.source_url.is_some()
    }
}

/// Raw media bytes as served by the origin
#[derive(Debug, Clone)]
pub struct MediaBytes {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait OriginFetcher: Send + Sync + 'static {
    async fn fetch_primary_document(&self, name: &str) -> Result<OriginDocument, OriginError>;

    /// Ordered media list of an article
    async fn fetch_media_list(&self, name: &str) -> Result<Vec<MediaListItem>, OriginError>;

    async fn fetch_media_bytes(&self, source_url: &str) -> Result<MediaBytes, OriginError>;

    /// Opaque feed document for a locale
    async fn fetch_feed(&self, locale: &str) -> Result<Vec<u8>, OriginError>;
}
