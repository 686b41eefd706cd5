//! Origin backed by a local mirror directory
//!
//! Layout:
//!
//! ```text
//! <root>/articles/<name>/article.html
//! <root>/articles/<name>/title          (optional, defaults to <name>)
//! <root>/articles/<name>/media-list.json
//! <root>/feeds/<locale>.json
//! ```
//!
//! `media-list.json` mirrors the origin media-list shape:
//! `{"items": [{"title": "...", "srcset": [{"src": "relative/path"}]}]}`.
//! Media sources are paths relative to `<root>`.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{MediaBytes, MediaListItem, OriginDocument, OriginError, OriginFetcher};

#[derive(Deserialize)]
struct MediaList {
    #[serde(default)]
    items: Vec<MediaEntry>,
}

#[derive(Deserialize)]
struct MediaEntry {
    title: String,
    #[serde(default)]
    srcset: Vec<MediaSource>,
}

#[derive(Deserialize)]
struct MediaSource {
    src: String,
}

/// Filesystem mirror of the origin encyclopedia
#[derive(Debug, Clone)]
pub struct FsOrigin {
    root: PathBuf,
}

impl FsOrigin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path under the root, refusing escapes
    fn resolve(&self, relative: &str) -> Result<PathBuf, OriginError> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.is_empty() {
            return Err(OriginError::InvalidData(format!("bad path '{}'", relative)));
        }
        Ok(self.root.join(path))
    }

    fn article_dir(&self, name: &str) -> Result<PathBuf, OriginError> {
        if name.contains('/') {
            return Err(OriginError::InvalidData(format!("bad article name '{}'", name)));
        }
        self.resolve(&format!("articles/{}", name))
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, OriginError> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => OriginError::NotFound(path.display().to_string()),
        _ => OriginError::Io(e.to_string()),
    })
}

fn content_type_for(path: &str) -> Option<String> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(mime.to_string())
}

#[async_trait]
impl OriginFetcher for FsOrigin {
    async fn fetch_primary_document(&self, name: &str) -> Result<OriginDocument, OriginError> {
        let dir = self.article_dir(name)?;
        let bytes = read(&dir.join("article.html")).await?;
        let title = match read(&dir.join("title")).await {
            Ok(raw) => String::from_utf8_lossy(&raw).trim().to_string(),
            Err(OriginError::NotFound(_)) => name.to_string(),
            Err(e) => return Err(e),
        };
        debug!("Origin: read document for '{}' ({} bytes)", name, bytes.len());
        Ok(OriginDocument { title, bytes })
    }

    async fn fetch_media_list(&self, name: &str) -> Result<Vec<MediaListItem>, OriginError> {
        let raw = match read(&self.article_dir(name)?.join("media-list.json")).await {
            Ok(raw) => raw,
            Err(OriginError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let list: MediaList = serde_json::from_slice(&raw)
            .map_err(|e| OriginError::InvalidData(e.to_string()))?;

        Ok(list
            .items
            .into_iter()
            .map(|entry| MediaListItem {
                title: entry.title,
                source_url: entry.srcset.into_iter().next().map(|s| s.src),
            })
            .collect())
    }

    async fn fetch_media_bytes(&self, source_url: &str) -> Result<MediaBytes, OriginError> {
        let bytes = read(&self.resolve(source_url)?).await?;
        Ok(MediaBytes {
            bytes,
            content_type: content_type_for(source_url),
        })
    }

    async fn fetch_feed(&self, locale: &str) -> Result<Vec<u8>, OriginError> {
        read(&self.resolve(&format!("feeds/{}.json", locale))?).await
    }
}
