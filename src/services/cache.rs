//! Decoded-segment cache with fetch de-duplication.
//!
//! A key is either absent, loading (one shared fetch+decode future that
//! every caller awaits) or ready. Eviction bumps a generation counter so
//! fetches that started before it never write back.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::audio::decode::AudioDecoder;
use crate::kernel::audio::segment::{DecodedSegment, SegmentDescriptor, SegmentKey};
use crate::kernel::scheduler::DecodedLookup;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Fetch of {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("Fetch of {url} returned {code}")]
    Status { url: String, code: u16 },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Segment {0} has no audio URL")]
    MissingUrl(String),
}

/// Source of raw segment bytes.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| CacheError::Fetch {
            url: String::new(),
            message: e.to_string(),
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AudioFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError> {
        let failed = |e: reqwest::Error| CacheError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(failed)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::Status {
                url: url.to_string(),
                code: status.as_u16(),
            });
        }
        response.bytes().await.map_err(failed)
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<DecodedSegment>, CacheError>>>;

enum Entry {
    Loading(LoadFuture),
    Ready(Arc<DecodedSegment>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub fetches: u64,
    pub hits: u64,
    pub failures: u64,
    pub ready: usize,
    pub in_flight: usize,
}

struct CacheInner {
    entries: Mutex<HashMap<SegmentKey, Entry>>,
    fetcher: Arc<dyn AudioFetcher>,
    decoder: AudioDecoder,
    generation: AtomicU64,
    fetches: AtomicU64,
    hits: AtomicU64,
    failures: AtomicU64,
}

impl CacheInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<SegmentKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct SegmentCache {
    inner: Arc<CacheInner>,
}

impl SegmentCache {
    pub fn new(fetcher: Arc<dyn AudioFetcher>, decoder: AudioDecoder) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                fetcher,
                decoder,
                generation: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Decoded audio if already present. Never waits.
    pub fn get(&self, key: &SegmentKey) -> Option<Arc<DecodedSegment>> {
        match self.inner.entries().get(key) {
            Some(Entry::Ready(segment)) => Some(segment.clone()),
            _ => None,
        }
    }

    pub fn is_in_flight(&self, key: &SegmentKey) -> bool {
        matches!(self.inner.entries().get(key), Some(Entry::Loading(_)))
    }

    /// Cached audio, the in-flight load for this key, or a new load.
    pub async fn resolve(&self, descriptor: &SegmentDescriptor) -> Result<Arc<DecodedSegment>, CacheError> {
        let key = descriptor.key();
        let load = {
            let mut entries = self.inner.entries();
            match entries.get(&key) {
                Some(Entry::Ready(segment)) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(segment.clone());
                }
                Some(Entry::Loading(load)) => load.clone(),
                None => {
                    let load = self.start_load(descriptor.clone());
                    entries.insert(key, Entry::Loading(load.clone()));
                    load
                }
            }
        };
        load.await
    }

    fn start_load(&self, descriptor: SegmentDescriptor) -> LoadFuture {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let fetcher = self.inner.fetcher.clone();
        let decoder = self.inner.decoder;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);

        async move {
            let key = descriptor.key();
            let result = fetch_and_decode(fetcher, decoder, &descriptor).await;

            if let Some(inner) = weak.upgrade() {
                let mut entries = inner.entries();
                // Evicted while loading: leave the map alone.
                if inner.generation.load(Ordering::SeqCst) == generation {
                    match &result {
                        Ok(segment) => {
                            entries.insert(key, Entry::Ready(segment.clone()));
                        }
                        Err(_) => {
                            inner.failures.fetch_add(1, Ordering::Relaxed);
                            entries.remove(&key);
                        }
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Warm up to `ahead` segments that are neither cached nor loading.
    /// Failures are logged and forgotten.
    pub fn preload(&self, descriptors: &[SegmentDescriptor], ahead: usize) {
        let picked: Vec<SegmentDescriptor> = {
            let entries = self.inner.entries();
            descriptors
                .iter()
                .filter(|d| d.is_ready() && !entries.contains_key(&d.key()))
                .take(ahead)
                .cloned()
                .collect()
        };
        for descriptor in picked {
            let cache = self.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.resolve(&descriptor).await {
                    debug!(index = descriptor.index, error = %e, "Preload failed");
                }
            });
        }
    }

    /// Drop every buffer and forget every in-flight load.
    pub fn evict_all(&self) {
        let mut entries = self.inner.entries();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = entries.len();
        entries.clear();
        debug!(dropped, "Cache evicted");
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.entries();
        let in_flight = entries.values().filter(|e| matches!(e, Entry::Loading(_))).count();
        CacheStats {
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            hits: self.inner.hits.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            ready: entries.len() - in_flight,
            in_flight,
        }
    }
}

impl DecodedLookup for SegmentCache {
    fn decoded(&self, key: &SegmentKey) -> Option<Arc<DecodedSegment>> {
        self.get(key)
    }
}

async fn fetch_and_decode(
    fetcher: Arc<dyn AudioFetcher>,
    decoder: AudioDecoder,
    descriptor: &SegmentDescriptor,
) -> Result<Arc<DecodedSegment>, CacheError> {
    if descriptor.fetch_url.is_empty() {
        return Err(CacheError::MissingUrl(descriptor.segment_id.clone()));
    }
    let bytes = fetcher.fetch(&descriptor.fetch_url).await?;
    let key = descriptor.key();
    let hint = descriptor.format;
    let decoded = tokio::task::spawn_blocking(move || decoder.decode(key, &bytes, hint))
        .await
        .map_err(|e| CacheError::Decode(e.to_string()))?
        .map_err(|e| CacheError::Decode(e.to_string()))?;
    debug!(index = descriptor.index, seconds = decoded.duration_seconds, "Segment ready");
    Ok(Arc::new(decoded))
}
