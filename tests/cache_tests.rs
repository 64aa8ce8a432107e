use async_trait::async_trait;
use bytes::Bytes;
use narrator::audio::decode::{downmix, resample, sniff_format, AudioDecoder};
use narrator::kernel::audio::segment::{AudioFormat, JobId, SegmentDescriptor, SegmentReadyState};
use narrator::services::cache::{AudioFetcher, CacheError, SegmentCache};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn wav_bytes(frames: usize, rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec).unwrap();
        for i in 0..frames * channels as usize {
            writer.write_sample(((i % 100) as i16) * 100).unwrap();
        }
        writer.finalize().unwrap();
    }
    buffer
}

fn desc(index: usize) -> SegmentDescriptor {
    SegmentDescriptor {
        index,
        segment_id: format!("s{}", index),
        job_id: JobId::new("job-1"),
        state: SegmentReadyState::Ready,
        fetch_url: format!("http://backend/audio/{}.wav", index),
        format: Some(AudioFormat::Wav),
    }
}

/// Serves the same short WAV for every URL, optionally holding each fetch
/// until released.
struct CountingFetcher {
    fetches: AtomicU64,
    body: Vec<u8>,
    gate: Option<Arc<Notify>>,
    missing: bool,
}

impl CountingFetcher {
    fn new() -> Self {
        Self {
            fetches: AtomicU64::new(0),
            body: wav_bytes(800, 8000, 1),
            gate: None,
            missing: false,
        }
    }

    fn count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.missing {
            return Err(CacheError::Status {
                url: url.to_string(),
                code: 404,
            });
        }
        Ok(Bytes::from(self.body.clone()))
    }
}

#[tokio::test]
async fn test_concurrent_resolve_fetches_once() {
    let fetcher = Arc::new(CountingFetcher::new());
    let cache = SegmentCache::new(fetcher.clone(), AudioDecoder::new(None));
    let d = desc(0);

    // 1. Three callers race for the same segment
    let (a, b, c) = tokio::join!(cache.resolve(&d), cache.resolve(&d), cache.resolve(&d));
    let a = a.unwrap();
    let b = b.unwrap();
    let c = c.unwrap();

    // 2. One fetch, one buffer
    assert_eq!(fetcher.count(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert!((a.duration_seconds - 0.1).abs() < 1e-9);

    // 3. Later lookups are hits
    assert!(cache.get(&d.key()).is_some());
    cache.resolve(&d).await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_failed_fetch_is_not_cached() {
    let fetcher = Arc::new(CountingFetcher {
        missing: true,
        ..CountingFetcher::new()
    });
    let cache = SegmentCache::new(fetcher.clone(), AudioDecoder::new(None));
    let d = desc(3);

    let err = cache.resolve(&d).await.unwrap_err();
    assert_eq!(
        err,
        CacheError::Status {
            url: d.fetch_url.clone(),
            code: 404
        }
    );
    assert!(cache.get(&d.key()).is_none());
    assert!(!cache.is_in_flight(&d.key()));

    // A later resolve tries again
    assert!(cache.resolve(&d).await.is_err());
    assert_eq!(fetcher.count(), 2);
    assert_eq!(cache.stats().failures, 2);
}

#[tokio::test]
async fn test_missing_url_fails_without_fetch() {
    let fetcher = Arc::new(CountingFetcher::new());
    let cache = SegmentCache::new(fetcher.clone(), AudioDecoder::new(None));
    let d = SegmentDescriptor {
        fetch_url: String::new(),
        ..desc(1)
    };

    let err = cache.resolve(&d).await.unwrap_err();
    assert_eq!(err, CacheError::MissingUrl("s1".to_string()));
    assert_eq!(fetcher.count(), 0);
}

#[tokio::test]
async fn test_eviction_discards_in_flight_load() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(CountingFetcher {
        gate: Some(gate.clone()),
        ..CountingFetcher::new()
    });
    let cache = SegmentCache::new(fetcher.clone(), AudioDecoder::new(None));
    let d = desc(0);

    // 1. Start a load and let it reach the fetcher
    let pending = {
        let cache = cache.clone();
        let d = d.clone();
        tokio::spawn(async move { cache.resolve(&d).await })
    };
    while fetcher.count() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(cache.is_in_flight(&d.key()));

    // 2. Evict, then let the fetch complete
    cache.evict_all();
    gate.notify_one();
    let result = pending.await.unwrap();

    // 3. The caller still gets its audio, the cache stays empty
    assert!(result.is_ok());
    assert!(cache.get(&d.key()).is_none());
    assert_eq!(cache.stats().ready, 0);
}

#[tokio::test]
async fn test_preload_warms_limited_batch() {
    let fetcher = Arc::new(CountingFetcher::new());
    let cache = SegmentCache::new(fetcher.clone(), AudioDecoder::new(None));
    let batch: Vec<SegmentDescriptor> = (0..4).map(desc).collect();

    cache.preload(&batch, 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.stats().ready < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("preload did not finish");

    assert!(cache.get(&desc(0).key()).is_some());
    assert!(cache.get(&desc(1).key()).is_some());
    assert!(cache.get(&desc(2).key()).is_none());
    assert_eq!(fetcher.count(), 2);

    // Already cached entries are not fetched again
    cache.preload(&batch[..2], 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.count(), 2);
}

#[test]
fn test_sniff_format_prefers_magic_bytes() {
    assert_eq!(sniff_format(&wav_bytes(10, 8000, 1)), Some(AudioFormat::Wav));
    assert_eq!(sniff_format(b"ID3\x04\x00rest"), Some(AudioFormat::Mpeg));
    assert_eq!(sniff_format(&[0xFF, 0xFB, 0x90, 0x00]), Some(AudioFormat::Mpeg));
    assert_eq!(sniff_format(b"hello"), None);
}

#[test]
fn test_decode_wav_downmixes_and_resamples() {
    let decoder = AudioDecoder::new(Some(16_000));
    let key = desc(0).key();

    // Stereo 8 kHz, half a second; the MPEG hint is overruled by the header
    let decoded = decoder
        .decode(key, &wav_bytes(4000, 8000, 2), Some(AudioFormat::Mpeg))
        .unwrap();
    assert_eq!(decoded.sample_rate, 16_000);
    assert_eq!(decoded.samples.len(), 8000);
    assert!((decoded.duration_seconds - 0.5).abs() < 1e-9);
}

#[test]
fn test_decode_rejects_empty_payload() {
    let decoder = AudioDecoder::new(None);
    assert!(decoder.decode(desc(0).key(), &[], None).is_err());
}

#[test]
fn test_downmix_and_resample_helpers() {
    assert_eq!(downmix(vec![1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    assert_eq!(downmix(vec![0.25, 0.75], 1), vec![0.25, 0.75]);

    let same = resample(&[0.1, 0.2, 0.3], 8000, 8000).unwrap();
    assert_eq!(same, vec![0.1, 0.2, 0.3]);

    let input = vec![0.0f32; 2205];
    let up = resample(&input, 22_050, 44_100).unwrap();
    assert_eq!(up.len(), 4410);
}
