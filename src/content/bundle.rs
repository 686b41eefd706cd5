//! Content bundles and their content-derived identifiers
//!
//! A bundle is the sealed set of parts describing one article (or feed).
//! Its identifier is the BLAKE3 hash of the bundle name and every part,
//! so a client can verify that what it downloaded is what the proxies
//! agreed on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// File name of the primary document inside an article bundle
pub const ARTICLE_DOCUMENT: &str = "article.html";

/// File name of the primary document inside a feed bundle
pub const FEED_DOCUMENT: &str = "feed.json";

/// A content-addressed bundle identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    /// Compute the identifier for a bundle name and its parts
    pub fn for_parts(name: &str, parts: &[BundlePart]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        for part in parts {
            hasher.update(&(part.name.len() as u64).to_le_bytes());
            hasher.update(part.name.as_bytes());
            hasher.update(&(part.bytes.len() as u64).to_le_bytes());
            hasher.update(&part.bytes);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({}...)", &self.to_hex()[..8])
    }
}

/// One file inside a bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePart {
    /// File name, unique within the bundle
    pub name: String,
    /// MIME type reported by the origin, if any
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl BundlePart {
    pub fn new(name: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type,
            bytes,
        }
    }
}

/// A sealed, self-contained set of parts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Display name (the article title)
    pub name: String,
    pub parts: Vec<BundlePart>,
}

impl Bundle {
    pub fn new(name: impl Into<String>, parts: Vec<BundlePart>) -> Self {
        Self {
            name: name.into(),
            parts,
        }
    }

    /// Identifier derived from this bundle's contents
    pub fn content_id(&self) -> ContentId {
        ContentId::for_parts(&self.name, &self.parts)
    }

    /// Total payload size in bytes
    pub fn size(&self) -> usize {
        self.parts.iter().map(|p| p.bytes.len()).sum()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error("Bundle has no '{0}' part")]
    MissingDocument(&'static str),
    #[error("Bundle has more than one '{0}' part")]
    DuplicateDocument(&'static str),
}

/// An article materialized from a bundle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub primary_document: Vec<u8>,
    /// Media files keyed by their original file name
    pub media: BTreeMap<String, Vec<u8>>,
}

impl Article {
    /// Split a bundle into its primary document and media mapping
    pub fn from_bundle(bundle: &Bundle) -> Result<Self, BundleError> {
        let mut primary_document = None;
        let mut media = BTreeMap::new();

        for part in &bundle.parts {
            if part.name == ARTICLE_DOCUMENT {
                if primary_document.is_some() {
                    return Err(BundleError::DuplicateDocument(ARTICLE_DOCUMENT));
                }
                primary_document = Some(part.bytes.clone());
            } else {
                media.insert(part.name.clone(), part.bytes.clone());
            }
        }

        Ok(Self {
            title: bundle.name.clone(),
            primary_document: primary_document
                .ok_or(BundleError::MissingDocument(ARTICLE_DOCUMENT))?,
            media,
        })
    }
}

/// A localized feed document materialized from a bundle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feed {
    pub lang: String,
    pub document: Vec<u8>,
}

impl Feed {
    pub fn from_bundle(lang: &str, bundle: &Bundle) -> Result<Self, BundleError> {
        let mut documents = bundle.parts.iter().filter(|p| p.name == FEED_DOCUMENT);
        let document = documents
            .next()
            .ok_or(BundleError::MissingDocument(FEED_DOCUMENT))?;
        if documents.next().is_some() {
            return Err(BundleError::DuplicateDocument(FEED_DOCUMENT));
        }
        Ok(Self {
            lang: lang.to_string(),
            document: document.bytes.clone(),
        })
    }
}
