//! Identity-matching cache.
//!
//! Readers clone an `Arc` snapshot and scan it without holding any lock.
//! Writers (refresh, enroll, remove) serialise on an async mutex, build the
//! next snapshot off to the side and publish it with one pointer swap.
//! Every published snapshot is persisted to the [`EncodingStore`]; a failed
//! write leaves the cache dirty until [`EncodingCache::flush_pending`]
//! succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollcall_core::{BoundingBox, DistanceMetric, FeatureVector, Frame, MatchResult, NearestNeighbor};
use serde::Serialize;
use thiserror::Error;

use crate::encoder::{EncodeError, FrameEncoder};
use crate::source::{validate_subject_id, ReferenceSource, SourceError};
use crate::store::{EncodingStore, PersistedCache, StoreError};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("feature dimension mismatch: cache holds {expected}-d vectors, got {found}-d")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("feature vector is empty or contains NaN/Inf")]
    InvalidVector,
    #[error("invalid subject id '{0}'")]
    InvalidSubject(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("reference source error: {0}")]
    Source(#[from] SourceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub metric: DistanceMetric,
    /// Required vector dimension; `None` lets the first vector decide.
    pub dimension: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            metric: DistanceMetric::default(),
            dimension: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    records: HashMap<String, Vec<FeatureVector>>,
    dimension: Option<usize>,
    last_refresh: Option<DateTime<Utc>>,
}

impl Snapshot {
    fn vector_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    fn to_persisted(&self) -> PersistedCache {
        PersistedCache {
            records: self.records.clone(),
            dimension: self.dimension,
            last_refresh: self.last_refresh,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    /// False when the cache was still fresh and nothing was rescanned.
    pub refreshed: bool,
    pub subjects: usize,
    pub vectors: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub subject_id: String,
    /// Vectors now held for this subject, including the new one.
    pub vectors: usize,
    pub dimension: usize,
    pub region: Option<BoundingBox>,
    /// Whether the frame was kept as a reference image for future refreshes.
    pub reference_saved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub subjects: usize,
    pub vectors: usize,
    pub dimension: Option<usize>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub stale: bool,
    pub pending_persist: bool,
}

pub struct EncodingCache {
    snapshot: RwLock<Arc<Snapshot>>,
    writer: tokio::sync::Mutex<()>,
    store: EncodingStore,
    source: Arc<dyn ReferenceSource>,
    encoder: Arc<dyn FrameEncoder>,
    settings: CacheSettings,
    force_refresh: AtomicBool,
    dirty: AtomicBool,
}

impl EncodingCache {
    /// Load the persisted snapshot. A corrupt or unreadable store yields an
    /// empty cache that rebuilds itself on first use.
    pub async fn open(
        store: EncodingStore,
        source: Arc<dyn ReferenceSource>,
        encoder: Arc<dyn FrameEncoder>,
        settings: CacheSettings,
    ) -> Self {
        let (snapshot, force) = match store.load().await {
            Ok(Some(persisted)) => match (settings.dimension, persisted.dimension) {
                (Some(want), Some(have)) if want != have => {
                    tracing::warn!(
                        configured = want,
                        stored = have,
                        "stored encodings have a different dimension — discarding"
                    );
                    (Snapshot::default(), true)
                }
                _ => {
                    let snapshot = Snapshot {
                        records: persisted.records,
                        dimension: persisted.dimension,
                        last_refresh: persisted.last_refresh,
                    };
                    tracing::info!(
                        subjects = snapshot.records.len(),
                        vectors = snapshot.vector_count(),
                        "encoding cache loaded"
                    );
                    (snapshot, false)
                }
            },
            Ok(None) => {
                tracing::info!("encoding store is empty");
                (Snapshot::default(), true)
            }
            Err(e) if e.is_corrupt() => {
                tracing::warn!(error = %e, "encoding store corrupt — starting empty, forcing refresh");
                (Snapshot::default(), true)
            }
            Err(e) => {
                tracing::error!(error = %e, "encoding store unreadable — starting empty, forcing refresh");
                (Snapshot::default(), true)
            }
        };

        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: tokio::sync::Mutex::new(()),
            store,
            source,
            encoder,
            settings,
            force_refresh: AtomicBool::new(force),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn current(&self) -> Arc<Snapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    fn publish(&self, next: Snapshot) -> Arc<Snapshot> {
        let next = Arc::new(next);
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&next);
        next
    }

    fn is_stale(&self, snapshot: &Snapshot) -> bool {
        if self.force_refresh.load(Ordering::Acquire) {
            return true;
        }
        match snapshot.last_refresh {
            None => true,
            // A timestamp in the future (clock step) counts as fresh.
            Some(at) => (Utc::now() - at)
                .to_std()
                .map(|age| age > self.settings.ttl)
                .unwrap_or(false),
        }
    }

    /// Rebuild from the reference source if `force` or stale.
    pub async fn refresh(&self, force: bool) -> Result<RefreshSummary, CacheError> {
        let _writer = self.writer.lock().await;

        // Another writer may have refreshed while we waited.
        let current = self.current();
        if !force && !self.is_stale(&current) {
            return Ok(RefreshSummary {
                refreshed: false,
                subjects: current.records.len(),
                vectors: current.vector_count(),
                skipped: 0,
            });
        }

        let source = Arc::clone(&self.source);
        let encoder = Arc::clone(&self.encoder);
        let fixed_dim = self.settings.dimension;
        let rebuilt = tokio::task::spawn_blocking(move || {
            rebuild(source.as_ref(), encoder.as_ref(), fixed_dim)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        let next = Snapshot {
            records: rebuilt.records,
            dimension: rebuilt.dimension.or(fixed_dim),
            last_refresh: Some(Utc::now()),
        };
        let summary = RefreshSummary {
            refreshed: true,
            subjects: next.records.len(),
            vectors: next.vector_count(),
            skipped: rebuilt.skipped,
        };

        let published = self.publish(next);
        self.force_refresh.store(false, Ordering::Release);
        tracing::info!(
            subjects = summary.subjects,
            vectors = summary.vectors,
            skipped = summary.skipped,
            "encoding cache refreshed"
        );

        self.persist(&published).await;
        Ok(summary)
    }

    /// Nearest enrolled subject for `query`.
    ///
    /// A stale cache is refreshed first; if that fails the current snapshot
    /// is used anyway.
    pub async fn find_match(
        &self,
        query: &FeatureVector,
        threshold: f32,
    ) -> Result<MatchResult, CacheError> {
        if query.dim() == 0 || !query.is_finite() {
            return Err(CacheError::InvalidVector);
        }

        if self.is_stale(&self.current()) {
            if let Err(e) = self.refresh(false).await {
                tracing::warn!(error = %e, "lazy cache refresh failed — matching against current snapshot");
            }
        }

        let snapshot = self.current();
        if let Some(expected) = snapshot.dimension.or(self.settings.dimension) {
            if query.dim() != expected {
                return Err(CacheError::DimensionMismatch {
                    expected,
                    found: query.dim(),
                });
            }
        }

        let result = NearestNeighbor::new(self.settings.metric).best_match(query, &snapshot.records, threshold);
        tracing::debug!(
            matched = result.matched,
            subject = result.subject_id.as_deref().unwrap_or("-"),
            similarity = result.similarity,
            candidates = snapshot.vector_count(),
            "cache lookup"
        );
        Ok(result)
    }

    /// Encode `frame` and add it to `subject_id`'s samples.
    ///
    /// Nothing changes if encoding fails or the dimension does not match.
    pub async fn enroll(&self, subject_id: &str, frame: Frame) -> Result<Enrollment, CacheError> {
        validate_subject_id(subject_id).map_err(|_| CacheError::InvalidSubject(subject_id.to_string()))?;

        let encoder = Arc::clone(&self.encoder);
        let (encoded, frame) = tokio::task::spawn_blocking(move || {
            let encoded = encoder.encode(&frame);
            (encoded, frame)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?;
        let encoded = encoded?;

        let _writer = self.writer.lock().await;
        let current = self.current();

        let found = encoded.vector.dim();
        if let Some(expected) = current.dimension.or(self.settings.dimension) {
            if found != expected {
                tracing::warn!(subject = subject_id, expected, found, "enrollment rejected — dimension mismatch");
                return Err(CacheError::DimensionMismatch { expected, found });
            }
        }

        let mut next = Snapshot::clone(&current);
        let samples = next.records.entry(subject_id.to_string()).or_default();
        samples.push(encoded.vector);
        let vectors = samples.len();
        next.dimension = Some(found);
        let published = self.publish(next);

        let source = Arc::clone(&self.source);
        let subject = subject_id.to_string();
        let reference_saved = match tokio::task::spawn_blocking(move || source.save(&subject, &frame)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(subject = subject_id, error = %e, "reference image not saved — sample will not survive a refresh");
                false
            }
            Err(e) => {
                tracing::warn!(subject = subject_id, error = %e, "reference save task failed");
                false
            }
        };

        self.persist(&published).await;
        tracing::info!(subject = subject_id, vectors, dimension = found, "subject enrolled");

        Ok(Enrollment {
            subject_id: subject_id.to_string(),
            vectors,
            dimension: found,
            region: encoded.region,
            reference_saved,
        })
    }

    /// Forget a subject in the cache, the store and the reference source.
    /// Returns whether anything was removed.
    pub async fn remove_subject(&self, subject_id: &str) -> Result<bool, CacheError> {
        let _writer = self.writer.lock().await;

        let source = Arc::clone(&self.source);
        let subject = subject_id.to_string();
        let images = tokio::task::spawn_blocking(move || source.remove(&subject))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))??;

        let current = self.current();
        let mut removed = images > 0;
        if current.records.contains_key(subject_id) {
            let mut next = Snapshot::clone(&current);
            next.records.remove(subject_id);
            let published = self.publish(next);
            self.persist(&published).await;
            removed = true;
        }

        tracing::info!(subject = subject_id, images, removed, "subject removed");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.current();
        CacheStats {
            subjects: snapshot.records.len(),
            vectors: snapshot.vector_count(),
            dimension: snapshot.dimension,
            last_refresh: snapshot.last_refresh,
            stale: self.is_stale(&snapshot),
            pending_persist: self.dirty.load(Ordering::Acquire),
        }
    }

    /// Retry a persist that failed earlier. Returns whether a write happened.
    pub async fn flush_pending(&self) -> Result<bool, CacheError> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        let _writer = self.writer.lock().await;
        let snapshot = self.current();
        self.store.save(&snapshot.to_persisted()).await?;
        self.dirty.store(false, Ordering::Release);
        tracing::info!(subjects = snapshot.records.len(), "pending cache persist flushed");
        Ok(true)
    }

    /// Write `snapshot` to the store. Failures are logged and retried by
    /// `flush_pending`; the caller's operation still succeeds.
    async fn persist(&self, snapshot: &Snapshot) {
        match self.store.save(&snapshot.to_persisted()).await {
            Ok(()) => self.dirty.store(false, Ordering::Release),
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                tracing::warn!(error = %e, "cache persist failed — will retry");
            }
        }
    }
}

struct Rebuilt {
    records: HashMap<String, Vec<FeatureVector>>,
    dimension: Option<usize>,
    skipped: usize,
}

/// Encode every reference image. Per-image failures are skipped with a
/// warning naming the image.
fn rebuild(
    source: &dyn ReferenceSource,
    encoder: &dyn FrameEncoder,
    fixed_dim: Option<usize>,
) -> Result<Rebuilt, SourceError> {
    let images = source.scan()?;
    let mut records: HashMap<String, Vec<FeatureVector>> = HashMap::new();
    let mut dimension = fixed_dim;
    let mut skipped = 0;

    for image in &images {
        let frame = match source.load(image) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(subject = %image.subject_id, path = %image.path.display(), error = %e, "skipping unreadable reference image");
                skipped += 1;
                continue;
            }
        };
        let encoded = match encoder.encode(&frame) {
            Ok(enc) => enc,
            Err(e) => {
                tracing::warn!(subject = %image.subject_id, path = %image.path.display(), error = %e, "skipping reference image");
                skipped += 1;
                continue;
            }
        };

        let dim = encoded.vector.dim();
        match dimension {
            Some(expected) if expected != dim => {
                tracing::warn!(
                    subject = %image.subject_id,
                    path = %image.path.display(),
                    expected,
                    found = dim,
                    "skipping reference image — dimension mismatch"
                );
                skipped += 1;
                continue;
            }
            Some(_) => {}
            None => dimension = Some(dim),
        }

        records
            .entry(image.subject_id.clone())
            .or_default()
            .push(encoded.vector);
    }

    Ok(Rebuilt {
        records,
        dimension,
        skipped,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::source::ReferenceImage;

    /// Reference source held in memory.
    #[derive(Default)]
    pub struct MemorySource {
        images: Mutex<Vec<(ReferenceImage, Frame)>>,
        pub fail_scan: AtomicBool,
    }

    impl MemorySource {
        pub fn insert(&self, subject_id: &str, frame: Frame) {
            self.save(subject_id, &frame).unwrap();
        }

        pub fn len(&self) -> usize {
            self.images.lock().unwrap().len()
        }
    }

    impl ReferenceSource for MemorySource {
        fn scan(&self) -> Result<Vec<ReferenceImage>, SourceError> {
            if self.fail_scan.load(Ordering::SeqCst) {
                return Err(SourceError::Io {
                    path: PathBuf::from("mem"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "scan disabled"),
                });
            }
            Ok(self.images.lock().unwrap().iter().map(|(i, _)| i.clone()).collect())
        }

        fn load(&self, image: &ReferenceImage) -> Result<Frame, SourceError> {
            let images = self.images.lock().unwrap();
            images
                .iter()
                .find(|(i, _)| i == image)
                .map(|(_, f)| f.clone())
                .ok_or_else(|| SourceError::Io {
                    path: image.path.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
        }

        fn save(&self, subject_id: &str, frame: &Frame) -> Result<ReferenceImage, SourceError> {
            let mut images = self.images.lock().unwrap();
            let image = ReferenceImage {
                subject_id: subject_id.to_string(),
                path: PathBuf::from(format!("mem/{subject_id}/{}", images.len())),
            };
            images.push((image.clone(), frame.clone()));
            Ok(image)
        }

        fn remove(&self, subject_id: &str) -> Result<usize, SourceError> {
            let mut images = self.images.lock().unwrap();
            let before = images.len();
            images.retain(|(i, _)| i.subject_id != subject_id);
            Ok(before - images.len())
        }
    }
}
