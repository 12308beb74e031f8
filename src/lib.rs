//! thumbcache - asynchronous thumbnail loading
//!
//! Fetches remote images on a bounded worker pool, shares one download
//! between every caller asking for the same URL, memoizes scaled views, and
//! drops outstanding work in bulk when the caller's visible set changes.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod fetch;

pub use cache::{CacheStats, ImageCache, ImageStore, LoadError, LoadResult, StoreError};
pub use config::{CacheConfig, ConfigError};
pub use dispatch::{ChannelDispatcher, DispatchQueue, Dispatcher, InlineDispatcher, Job};
pub use fetch::{
    DecodeError, FetchError, HttpFetcher, ImageCrateDecoder, ImageDecoder, ImageFetcher,
};
