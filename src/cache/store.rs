//! Decoded Image Store
//!
//! Holds one decoded original and memoizes aspect-preserving scaled views
//! keyed by target height. Views are never evicted; a store that is asked
//! for many distinct heights grows without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::imageops::FilterType;
use image::DynamicImage;
use tracing::trace;

/// Resampling filter for scaled views
const SCALE_FILTER: FilterType = FilterType::Lanczos3;

/// Invalid-argument errors for store construction and scaling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Image has no pixels ({0}x{1})")]
    EmptyImage(u32, u32),

    #[error("Target height must be positive")]
    ZeroHeight,

    #[error("Target height {0} scales the width to zero")]
    DegenerateWidth(u32),
}

/// One decoded image plus its scaled views
pub struct ImageStore {
    /// The decoded original, never mutated
    original: Arc<DynamicImage>,
    /// Scaled views by target height
    scaled: Mutex<HashMap<u32, Arc<DynamicImage>>>,
    /// Number of resampling passes performed
    resamples: AtomicU64,
}

impl ImageStore {
    /// Wrap a decoded image
    ///
    /// Fails if the image has zero width or height.
    pub fn new(image: DynamicImage) -> Result<Self, StoreError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(StoreError::EmptyImage(width, height));
        }

        Ok(Self {
            original: Arc::new(image),
            scaled: Mutex::new(HashMap::new()),
            resamples: AtomicU64::new(0),
        })
    }

    /// The unscaled image
    pub fn original(&self) -> &Arc<DynamicImage> {
        &self.original
    }

    /// (width, height) of the original
    pub fn dimensions(&self) -> (u32, u32) {
        (self.original.width(), self.original.height())
    }

    /// Width a view of `height` pixels would have: floor(w * height / h)
    pub fn scaled_width(&self, height: u32) -> u32 {
        let (w, h) = self.dimensions();
        // u64 keeps w * height from overflowing; the result is <= w * height / h
        ((w as u64 * height as u64) / h as u64).min(u32::MAX as u64) as u32
    }

    /// Get the view scaled to `height`, computing it on first use
    ///
    /// Repeated calls with the same height return the same shared image.
    pub fn scaled_view(&self, height: u32) -> Result<Arc<DynamicImage>, StoreError> {
        if height == 0 {
            return Err(StoreError::ZeroHeight);
        }

        // Lock held across the resample so two callers never compute the same view
        let mut scaled = self.views();
        if let Some(view) = scaled.get(&height) {
            trace!(height = height, "Scaled view HIT");
            return Ok(Arc::clone(view));
        }

        let width = self.scaled_width(height);
        if width == 0 {
            return Err(StoreError::DegenerateWidth(height));
        }

        let view = Arc::new(self.original.resize_exact(width, height, SCALE_FILTER));
        self.resamples.fetch_add(1, Ordering::Relaxed);
        trace!(width = width, height = height, "Computed scaled view");

        scaled.insert(height, Arc::clone(&view));
        Ok(view)
    }

    /// Number of distinct heights memoized so far
    pub fn view_count(&self) -> usize {
        self.views().len()
    }

    /// Lock the view map, recovering it if a resample panicked mid-insert
    fn views(&self) -> MutexGuard<'_, HashMap<u32, Arc<DynamicImage>>> {
        self.scaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of resampling passes performed over the store's lifetime
    pub fn resample_count(&self) -> u64 {
        self.resamples.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height) = self.dimensions();
        f.debug_struct("ImageStore")
            .field("width", &width)
            .field("height", &height)
            .field("views", &self.view_count())
            .finish()
    }
}
