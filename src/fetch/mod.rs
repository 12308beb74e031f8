//! Image transport and codec collaborators
//!
//! The cache never talks to the network or an image codec directly; it goes
//! through [`ImageFetcher`] and [`ImageDecoder`] so both can be swapped out.

pub mod client;
pub mod decode;
pub mod errors;

use async_trait::async_trait;

pub use client::HttpFetcher;
pub use decode::{ImageCrateDecoder, ImageDecoder};
pub use errors::{DecodeError, FetchError};

/// Retrieves the raw bytes behind a resource key
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the full body for `url`
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}
