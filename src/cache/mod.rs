//! Thumbnail caching layer
//!
//! [`ImageCache`] deduplicates and schedules downloads; each completed
//! download becomes an [`ImageStore`] holding the decoded original and its
//! scaled views.

pub mod loader;
pub mod store;

pub use loader::{CacheStats, ImageCache, LoadError, LoadResult};
pub use store::{ImageStore, StoreError};
