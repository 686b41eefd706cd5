//! Build progress of a pending bundle
//!
//! Parts arrive in any order. The bundle is complete once the primary
//! document is in and the media count matches the media list; the media
//! list itself may arrive after the document, so an unknown expected count
//! never counts as complete. Sealed media parts are ordered by name, so the
//! content identifier does not depend on fetch timing.

use super::bundle::BundlePart;

/// Parts of a bundle ready to be seeded
#[derive(Debug, Clone)]
pub struct SealedParts {
    pub title: String,
    pub parts: Vec<BundlePart>,
}

#[derive(Debug, Default)]
pub struct BuildProgress {
    title: Option<String>,
    document: Option<BundlePart>,
    media: Vec<BundlePart>,
    expected_media: Option<usize>,
    sealed: bool,
}

impl BuildProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress for a bundle that never carries media
    pub fn without_media() -> Self {
        Self {
            expected_media: Some(0),
            ..Self::default()
        }
    }

    pub fn record_document(&mut self, title: impl Into<String>, part: BundlePart) {
        self.title = Some(title.into());
        self.document = Some(part);
    }

    pub fn set_expected_media(&mut self, count: usize) {
        self.expected_media = Some(count);
    }

    pub fn record_media(&mut self, part: BundlePart) {
        self.media.push(part);
    }

    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }

    pub fn expected_media(&self) -> Option<usize> {
        self.expected_media
    }

    pub fn fetched_media(&self) -> usize {
        self.media.len()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_complete(&self) -> bool {
        self.document.is_some() && self.expected_media == Some(self.media.len())
    }

    /// Take the parts out the first time the bundle is complete.
    ///
    /// Returns `None` while incomplete and on every call after the one
    /// that sealed.
    pub fn try_seal(&mut self) -> Option<SealedParts> {
        if self.sealed || !self.is_complete() {
            return None;
        }
        self.sealed = true;

        let document = self.document.take()?;
        self.media.sort_by(|a, b| a.name.cmp(&b.name));
        let mut parts = Vec::with_capacity(self.media.len() + 1);
        parts.push(document);
        parts.append(&mut self.media);

        Some(SealedParts {
            title: self.title.take().unwrap_or_default(),
            parts,
        })
    }
}
