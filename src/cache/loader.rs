//! Asynchronous Image Cache
//!
//! Answers "do we already have this image, are we already fetching it, and
//! who should be told when it arrives". Completed images live in a moka
//! cache, running fetches in a sharded in-flight registry, and the worker
//! pool is a semaphore gating tasks spawned on a tokio runtime.
//!
//! Cancellation is cooperative. A task checks its token before taking a
//! worker slot, races it against the network fetch, and checks it again
//! after decoding. Decoding itself runs on a blocking thread and cannot be
//! interrupted, so a cancelled task may finish decoding before it notices;
//! its result is then discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::sync::Cache;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::store::{ImageStore, StoreError};
use crate::config::{CacheConfig, ConfigError};
use crate::dispatch::Dispatcher;
use crate::fetch::{DecodeError, FetchError, ImageCrateDecoder, ImageDecoder, ImageFetcher};

/// Why a listener received no image
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Resource key is empty")]
    InvalidKey,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Decode worker failed: {0}")]
    Worker(String),
}

/// What a listener receives: the shared store, or why there is none
pub type LoadResult = Result<Arc<ImageStore>, LoadError>;

/// A pending completion callback
type Listener = Box<dyn FnOnce(LoadResult) + Send + 'static>;

/// A fetch currently owned by a worker task
struct InFlight {
    /// Distinguishes this fetch from later fetches of the same key
    id: u64,
    /// Cancels the worker task
    token: CancellationToken,
    /// Callbacks waiting on this fetch
    listeners: Mutex<Vec<Listener>>,
}

impl InFlight {
    fn new(id: u64, token: CancellationToken, listener: Listener) -> Self {
        Self {
            id,
            token,
            listeners: Mutex::new(vec![listener]),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn into_listeners(self) -> Vec<Listener> {
        self.listeners
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Requests answered from the completed cache
    pub hits: u64,
    /// Requests that scheduled a new fetch
    pub misses: u64,
    /// Requests that joined a fetch already in flight
    pub joined: u64,
    /// Fetches that actually reached the transport
    pub fetches: u64,
    /// Fetches that ended in a transport or decode failure
    pub failures: u64,
    /// Tasks abandoned because of cancellation
    pub cancelled: u64,
}

/// State shared between the cache handle and its worker tasks
struct CacheState {
    /// Successfully loaded images by URL
    completed: Cache<String, Arc<ImageStore>>,
    /// Running fetches by URL
    in_flight: DashMap<String, InFlight>,
    fetcher: Arc<dyn ImageFetcher>,
    decoder: Arc<dyn ImageDecoder>,
    dispatcher: Arc<dyn Dispatcher>,
    /// One permit per worker slot
    workers: Arc<Semaphore>,
    fetch_timeout: Option<Duration>,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    cancelled: AtomicU64,
}

/// Shared thumbnail cache
///
/// Construct one per process and clone the handle into every consumer;
/// clones share all state.
#[derive(Clone)]
pub struct ImageCache {
    state: Arc<CacheState>,
    /// Runtime the worker tasks are spawned on
    runtime: Handle,
}

impl ImageCache {
    /// Create a cache using the `image` crate decoder
    ///
    /// # Arguments
    /// * `config` - Worker count, capacity and timeout settings
    /// * `fetcher` - Transport used to download image bytes
    /// * `dispatcher` - Context listeners are marshalled onto
    /// * `runtime` - Runtime worker tasks run on
    pub fn new(
        config: &CacheConfig,
        fetcher: Arc<dyn ImageFetcher>,
        dispatcher: Arc<dyn Dispatcher>,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        Self::with_decoder(
            config,
            fetcher,
            Arc::new(ImageCrateDecoder),
            dispatcher,
            runtime,
        )
    }

    /// Create a cache with a custom decoder
    pub fn with_decoder(
        config: &CacheConfig,
        fetcher: Arc<dyn ImageFetcher>,
        decoder: Arc<dyn ImageDecoder>,
        dispatcher: Arc<dyn Dispatcher>,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut builder = Cache::builder().name("completed_images");
        if let Some(max_entries) = config.max_entries {
            builder = builder.max_capacity(max_entries);
        }

        let state = CacheState {
            completed: builder.build(),
            in_flight: DashMap::new(),
            fetcher,
            decoder,
            dispatcher,
            workers: Arc::new(Semaphore::new(config.workers)),
            fetch_timeout: config.fetch_timeout(),
            next_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        };

        info!(
            workers = config.workers,
            max_entries = ?config.max_entries,
            fetch_timeout = ?config.fetch_timeout(),
            "Image cache initialized"
        );

        Ok(Self {
            state: Arc::new(state),
            runtime,
        })
    }

    /// Request the image behind `url`
    ///
    /// A cached image is handed to `listener` right away on the calling
    /// thread. Otherwise the listener is attached to the fetch for `url`,
    /// starting one if none is running, and is later invoked through the
    /// dispatcher with the shared outcome. Listeners attached to a fetch
    /// that gets cancelled are dropped without being called.
    pub fn request<F>(&self, url: &str, listener: F)
    where
        F: FnOnce(LoadResult) + Send + 'static,
    {
        let state = &self.state;

        if url.is_empty() {
            warn!("Image requested with an empty URL");
            listener(Err(LoadError::InvalidKey));
            return;
        }

        if let Some(store) = state.completed.get(url) {
            state.hits.fetch_add(1, Ordering::Relaxed);
            trace!(url = %url, "Image cache HIT");
            listener(Ok(store));
            return;
        }

        match state.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) => {
                state.joined.fetch_add(1, Ordering::Relaxed);
                let mut listeners = entry.get().listeners();
                listeners.push(Box::new(listener));
                let pending = listeners.len();
                trace!(url = %url, listeners = pending, "Joined in-flight fetch");
            }
            Entry::Vacant(entry) => {
                // A worker publishes before releasing its in-flight entry, so
                // re-checking under the shard lock closes the gap since the
                // lookup above.
                if let Some(store) = state.completed.get(url) {
                    drop(entry);
                    state.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(url = %url, "Image cache HIT");
                    listener(Ok(store));
                    return;
                }

                state.misses.fetch_add(1, Ordering::Relaxed);
                let id = state.next_id.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                entry.insert(InFlight::new(id, token.clone(), Box::new(listener)));

                debug!(url = %url, id = id, "Image cache MISS, scheduling fetch");
                self.runtime
                    .spawn(run_fetch(Arc::clone(state), url.to_string(), id, token));
            }
        }
    }

    /// Cancel every in-flight fetch
    ///
    /// Pending listeners are dropped without being called and the registry
    /// is emptied, so the next request for any of those URLs starts a fresh
    /// fetch. Completed images are kept.
    pub fn cancel_all(&self) {
        let mut fetches = 0usize;
        let mut listeners = 0usize;

        self.state.in_flight.retain(|_, entry| {
            entry.token.cancel();
            fetches += 1;
            listeners += entry.listeners().len();
            false
        });

        if fetches > 0 {
            info!(
                fetches = fetches,
                dropped_listeners = listeners,
                "Cancelled in-flight image loads"
            );
        }
    }

    /// Cancel the in-flight fetch for one URL
    ///
    /// Returns true if a fetch was running.
    pub fn cancel(&self, url: &str) -> bool {
        // Fire the token while the shard lock is held so a finishing worker
        // never sees its entry gone with the token still live
        let removed = self.state.in_flight.remove_if(url, |_, entry| {
            entry.token.cancel();
            true
        });

        match removed {
            Some((_, entry)) => {
                debug!(
                    url = %url,
                    dropped_listeners = entry.listeners().len(),
                    "Cancelled image load"
                );
                true
            }
            None => false,
        }
    }

    /// Look up a completed image without fetching
    pub fn get(&self, url: &str) -> Option<Arc<ImageStore>> {
        self.state.completed.get(url)
    }

    /// Whether `url` has a completed image
    pub fn contains(&self, url: &str) -> bool {
        self.state.completed.contains_key(url)
    }

    /// Whether a fetch for `url` is running
    pub fn is_in_flight(&self, url: &str) -> bool {
        self.state.in_flight.contains_key(url)
    }

    /// Number of running fetches
    pub fn in_flight_count(&self) -> usize {
        self.state.in_flight.len()
    }

    /// Number of completed images held
    pub fn cached_count(&self) -> u64 {
        self.state.completed.run_pending_tasks();
        self.state.completed.entry_count()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = &self.state;
        CacheStats {
            hits: state.hits.load(Ordering::Relaxed),
            misses: state.misses.load(Ordering::Relaxed),
            joined: state.joined.load(Ordering::Relaxed),
            fetches: state.fetches.load(Ordering::Relaxed),
            failures: state.failures.load(Ordering::Relaxed),
            cancelled: state.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            joined = stats.joined,
            fetches = stats.fetches,
            failures = stats.failures,
            cancelled = stats.cancelled,
            cached = self.cached_count(),
            in_flight = self.in_flight_count(),
            "Image cache metrics"
        );
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("in_flight", &self.in_flight_count())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Worker task for one in-flight entry
async fn run_fetch(state: Arc<CacheState>, url: String, id: u64, token: CancellationToken) {
    // Dropping the load future on cancellation also drops any pending I/O
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        outcome = state.load(&url, &token) => outcome,
    };

    match outcome {
        Some(result) => state.publish(&url, id, &token, result),
        None => state.abandon(&url, id),
    }
}

impl CacheState {
    /// Fetch and decode `url`; None means the token fired along the way
    async fn load(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Option<Result<ImageStore, LoadError>> {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok()?,
        };

        if token.is_cancelled() {
            return None;
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, "Fetching image");

        let fetched = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.fetcher.fetch(url)).await {
                Ok(fetched) => fetched,
                Err(_) => Err(FetchError::Timeout),
            },
            None => self.fetcher.fetch(url).await,
        };

        if token.is_cancelled() {
            return None;
        }

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(e.into())),
        };

        // The permit moves into the blocking task so the slot stays taken
        // until decoding really ends, even if this future is dropped.
        let decoder = Arc::clone(&self.decoder);
        let decoded = tokio::task::spawn_blocking(move || -> Result<ImageStore, LoadError> {
            let _permit = permit;
            let image = decoder.decode(&bytes)?;
            Ok(ImageStore::new(image)?)
        })
        .await;

        if token.is_cancelled() {
            return None;
        }

        Some(decoded.unwrap_or_else(|e| Err(LoadError::Worker(e.to_string()))))
    }

    /// Release the in-flight entry and deliver the outcome to its listeners
    fn publish(
        &self,
        url: &str,
        id: u64,
        token: &CancellationToken,
        result: Result<ImageStore, LoadError>,
    ) {
        let result = result.map(Arc::new);

        let listeners = match self.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) if entry.get().id == id => {
                if let Ok(store) = &result {
                    self.completed.insert(url.to_string(), Arc::clone(store));
                }
                entry.remove().into_listeners()
            }
            _ => {
                // Entries only disappear through cancellation, which fires the
                // token before removing them.
                assert!(
                    token.is_cancelled(),
                    "in-flight entry for {} vanished without cancellation",
                    url
                );
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, id = id, "Discarding result of cancelled fetch");
                return;
            }
        };

        match &result {
            Ok(store) => {
                let (width, height) = store.dimensions();
                debug!(
                    url = %url,
                    width = width,
                    height = height,
                    listeners = listeners.len(),
                    "Image loaded"
                );
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(url = %url, error = %e, listeners = listeners.len(), "Image load failed");
            }
        }

        for listener in listeners {
            let result = result.clone();
            self.dispatcher.dispatch(Box::new(move || listener(result)));
        }
    }

    /// Clean up after a task that saw its token fire
    fn abandon(&self, url: &str, id: u64) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        // Only our own entry; a newer fetch for the same key may be registered
        let removed = self.in_flight.remove_if(url, |_, entry| entry.id == id);
        debug!(url = %url, id = id, removed = removed.is_some(), "Fetch cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ChannelDispatcher, DispatchQueue};
    use crate::fetch::decode::tests::png_bytes;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted transport double
    struct MockFetcher {
        body: Vec<u8>,
        /// Fetches wait for a permit here when gated
        gate: Option<Semaphore>,
        hang: bool,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockFetcher {
        fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                gate: None,
                hang: false,
                failures_left: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn png() -> Self {
            Self::new(png_bytes(80, 40))
        }

        fn gated(mut self) -> Self {
            self.gate = Some(Semaphore::new(0));
            self
        }

        fn hanging(mut self) -> Self {
            self.hang = true;
            self
        }

        fn failing(self, times: usize) -> Self {
            self.failures_left.store(times, Ordering::SeqCst);
            self
        }

        fn open(&self, fetches: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(fetches);
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageFetcher for MockFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(FetchError::Network("connection reset".to_string()));
            }
            Ok(self.body.clone())
        }
    }

    type Seen = Arc<Mutex<Vec<LoadResult>>>;

    fn cache_with(
        fetcher: &Arc<MockFetcher>,
        config: CacheConfig,
    ) -> (ImageCache, DispatchQueue) {
        let (dispatcher, queue) = ChannelDispatcher::new();
        let cache = ImageCache::new(
            &config,
            Arc::clone(fetcher) as Arc<dyn ImageFetcher>,
            Arc::new(dispatcher),
            Handle::current(),
        )
        .unwrap();
        (cache, queue)
    }

    fn recorder(seen: &Seen) -> impl FnOnce(LoadResult) + Send + 'static {
        let seen = Arc::clone(seen);
        move |result| seen.lock().unwrap().push(result)
    }

    /// Run `jobs` listener jobs from the queue, failing the test if they never arrive
    async fn drain(queue: &mut DispatchQueue, jobs: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            for _ in 0..jobs {
                assert!(queue.next().await);
            }
        })
        .await
        .expect("listeners were not dispatched in time");
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_request_served_from_cache() {
        let fetcher = Arc::new(MockFetcher::png());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("https://cdn.test/a.png", recorder(&seen));
        drain(&mut queue, 1).await;
        assert!(cache.contains("https://cdn.test/a.png"));
        assert!(!cache.is_in_flight("https://cdn.test/a.png"));

        // Answered synchronously, nothing goes through the queue
        cache.request("https://cdn.test/a.png", recorder(&seen));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(queue.run_pending(), 0);

        let seen = seen.lock().unwrap();
        let first = seen[0].as_ref().unwrap();
        let second = seen[1].as_ref().unwrap();
        assert!(Arc::ptr_eq(first, second));
        assert_eq!(first.dimensions(), (80, 40));

        assert_eq!(fetcher.calls(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.fetches), (1, 1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_request_joins_in_flight_fetch() {
        let fetcher = Arc::new(MockFetcher::png().gated());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("u1", recorder(&seen));
        cache.request("u1", recorder(&seen));
        assert_eq!(cache.in_flight_count(), 1);

        fetcher.open(1);
        drain(&mut queue, 2).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let l1 = seen[0].as_ref().unwrap();
        let l2 = seen[1].as_ref().unwrap();
        assert!(Arc::ptr_eq(l1, l2));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.stats().joined, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_callers_share_one_fetch() {
        const CALLERS: usize = 16;
        let fetcher = Arc::new(MockFetcher::png().gated());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        let threads: Vec<_> = (0..CALLERS)
            .map(|_| {
                let cache = cache.clone();
                let listener = recorder(&seen);
                std::thread::spawn(move || cache.request("https://cdn.test/shared.png", listener))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        fetcher.open(1);
        drain(&mut queue, CALLERS).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), CALLERS);
        let first = seen[0].as_ref().unwrap();
        assert!(seen.iter().all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_not_cached() {
        let fetcher = Arc::new(MockFetcher::png().failing(usize::MAX));
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("https://cdn.test/broken.png", recorder(&seen));
        drain(&mut queue, 1).await;
        assert!(matches!(
            seen.lock().unwrap()[0],
            Err(LoadError::Fetch(FetchError::Network(_)))
        ));
        assert!(!cache.contains("https://cdn.test/broken.png"));
        assert_eq!(cache.in_flight_count(), 0);

        cache.request("https://cdn.test/broken.png", recorder(&seen));
        drain(&mut queue, 1).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.stats().failures, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_after_failure_succeeds() {
        let fetcher = Arc::new(MockFetcher::png().failing(1));
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("u", recorder(&seen));
        drain(&mut queue, 1).await;
        cache.request("u", recorder(&seen));
        drain(&mut queue, 1).await;

        let seen = seen.lock().unwrap();
        assert!(seen[0].is_err());
        assert!(seen[1].is_ok());
        assert!(cache.contains("u"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decode_failure_reported() {
        let fetcher = Arc::new(MockFetcher::new(b"<html>404</html>".to_vec()));
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("https://cdn.test/page", recorder(&seen));
        drain(&mut queue, 1).await;

        assert!(matches!(
            seen.lock().unwrap()[0],
            Err(LoadError::Decode(DecodeError::UnsupportedFormat(_)))
        ));
        assert!(!cache.contains("https://cdn.test/page"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_all_frees_slot() {
        let fetcher = Arc::new(MockFetcher::png().gated());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let stale: Seen = Arc::default();
        let fresh: Seen = Arc::default();

        cache.request("u1", recorder(&stale));
        cache.request("u1", recorder(&stale));
        wait_until(|| fetcher.calls() == 1).await;

        cache.cancel_all();
        assert_eq!(cache.in_flight_count(), 0);
        assert!(!cache.is_in_flight("u1"));

        cache.request("u1", recorder(&fresh));
        assert!(cache.is_in_flight("u1"));
        wait_until(|| fetcher.calls() == 2).await;

        fetcher.open(2);
        drain(&mut queue, 1).await;
        wait_until(|| cache.stats().cancelled == 1).await;

        assert_eq!(queue.run_pending(), 0);
        assert!(stale.lock().unwrap().is_empty());
        assert!(fresh.lock().unwrap()[0].is_ok());
        assert!(cache.contains("u1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_task_keeps_newer_entry() {
        let fetcher = Arc::new(MockFetcher::png().gated());
        let (cache, _queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("u1", recorder(&seen));
        wait_until(|| fetcher.calls() == 1).await;
        cache.cancel_all();

        cache.request("u1", recorder(&seen));
        wait_until(|| cache.stats().cancelled == 1).await;

        // The abandoned task must not have removed the new registration
        assert!(cache.is_in_flight("u1"));
        cache.cancel_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_task_cancelled_before_fetching() {
        let fetcher = Arc::new(MockFetcher::png().gated());
        let config = CacheConfig {
            workers: 1,
            ..CacheConfig::default()
        };
        let (cache, mut queue) = cache_with(&fetcher, config);
        let seen: Seen = Arc::default();

        cache.request("a", recorder(&seen));
        cache.request("b", recorder(&seen));
        wait_until(|| fetcher.calls() == 1).await;
        assert_eq!(cache.in_flight_count(), 2);

        cache.cancel_all();
        fetcher.open(2);
        wait_until(|| cache.stats().cancelled == 2).await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(queue.run_pending(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_bounds_concurrency() {
        let fetcher = Arc::new(MockFetcher::png().gated());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        for i in 0..5 {
            cache.request(&format!("https://cdn.test/{i}.png"), recorder(&seen));
        }
        wait_until(|| fetcher.calls() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(), 2);

        fetcher.open(5);
        drain(&mut queue, 5).await;

        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.calls(), 5);
        assert_eq!(cache.cached_count(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_all_idempotent_and_keeps_completed() {
        let fetcher = Arc::new(MockFetcher::png());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.cancel_all();
        cache.cancel_all();

        cache.request("u1", recorder(&seen));
        drain(&mut queue, 1).await;
        cache.cancel_all();

        assert!(cache.contains("u1"));
        assert_eq!(cache.stats().cancelled, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_single_url() {
        let fetcher = Arc::new(MockFetcher::png().gated());
        let (cache, _queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("a", recorder(&seen));
        cache.request("b", recorder(&seen));

        assert!(cache.cancel("a"));
        assert!(!cache.cancel("a"));
        assert!(!cache.is_in_flight("a"));
        assert!(cache.is_in_flight("b"));
        cache.cancel_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_completed_fetch() {
        const ROUNDS: usize = 200;
        let fetcher = Arc::new(MockFetcher::png());
        let config = CacheConfig {
            workers: 4,
            ..CacheConfig::default()
        };
        let (cache, mut queue) = cache_with(&fetcher, config);
        let seen: Seen = Arc::default();

        let mut cancelled = 0u64;
        for i in 0..ROUNDS {
            let url = format!("https://cdn.test/race/{i}.png");
            cache.request(&url, recorder(&seen));
            if cancel_after_spin(&cache, &url, i) {
                cancelled += 1;
            }
        }

        // Every cancelled task is accounted for; none died on the way out
        wait_until(|| cache.stats().cancelled == cancelled).await;
        drain(&mut queue, ROUNDS - cancelled as usize).await;

        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(seen.lock().unwrap().len(), ROUNDS - cancelled as usize);
        assert!(seen.lock().unwrap().iter().all(|r| r.is_ok()));
    }

    /// Cancel `url` after a varying delay so some cancels land mid-publish
    fn cancel_after_spin(cache: &ImageCache, url: &str, round: usize) -> bool {
        for _ in 0..(round % 16) * 500 {
            std::hint::spin_loop();
        }
        cache.cancel(url)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listeners_run_on_queue_thread() {
        let fetcher = Arc::new(MockFetcher::png());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let ran_on = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&ran_on);
        cache.request("u1", move |_| {
            *slot.lock().unwrap() = Some(std::thread::current().id());
        });
        drain(&mut queue, 1).await;

        assert_eq!(*ran_on.lock().unwrap(), Some(std::thread::current().id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_key_rejected() {
        let fetcher = Arc::new(MockFetcher::png());
        let (cache, _queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("", recorder(&seen));

        assert!(matches!(seen.lock().unwrap()[0], Err(LoadError::InvalidKey)));
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_fetch_holds_slot_without_timeout() {
        let fetcher = Arc::new(MockFetcher::png().hanging());
        let (cache, mut queue) = cache_with(&fetcher, CacheConfig::default());
        let seen: Seen = Arc::default();

        cache.request("u1", recorder(&seen));
        wait_until(|| fetcher.calls() == 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nothing bounds the fetch; only cancellation releases it
        assert!(cache.is_in_flight("u1"));
        assert_eq!(queue.run_pending(), 0);

        cache.cancel_all();
        wait_until(|| cache.stats().cancelled == 1).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_reports_failure() {
        let fetcher = Arc::new(MockFetcher::png().hanging());
        let config = CacheConfig {
            fetch_timeout_secs: Some(3),
            ..CacheConfig::default()
        };
        let (cache, mut queue) = cache_with(&fetcher, config);
        let seen: Seen = Arc::default();

        cache.request("u1", recorder(&seen));
        drain(&mut queue, 1).await;

        assert!(matches!(
            seen.lock().unwrap()[0],
            Err(LoadError::Fetch(FetchError::Timeout))
        ));
        assert!(!cache.is_in_flight("u1"));
        assert!(!cache.contains("u1"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (dispatcher, _queue) = ChannelDispatcher::new();
        let config = CacheConfig {
            workers: 0,
            ..CacheConfig::default()
        };
        let result = ImageCache::new(
            &config,
            Arc::new(MockFetcher::png()),
            Arc::new(dispatcher),
            Handle::current(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
