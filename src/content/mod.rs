//! Content bundles
//!
//! - `bundle`: bundles, their parts and content identifiers
//! - `store`: the seeding seam and the in-memory store
//! - `progress`: build progress and the sealing rule
//! - `lifecycle`: proxy-side build, seed and idle eviction

mod bundle;
mod lifecycle;
mod progress;
mod store;

pub use bundle::{
    Article, Bundle, BundleError, BundlePart, ContentId, Feed, ARTICLE_DOCUMENT, FEED_DOCUMENT,
};
pub use lifecycle::{BuildStatus, ContentKey, ContentLifecycleManager, EntryStatus, LifecycleError};
pub use progress::{BuildProgress, SealedParts};
pub use store::{
    BundleFetcher, ContentHandle, ContentStore, LocalContentStore, SeedMetadata, StoreError,
    UploadEvent,
};
