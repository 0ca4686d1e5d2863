use std::sync::Arc;
use std::time::{Duration, Instant};

use rollcall_core::providers::largest_face;
use rollcall_core::session::{BlinkInput, Breakdown};
use rollcall_core::{
    FeatureExtractor, Frame, LandmarkProvider, LivenessMethod, MatchResult, QualityMetrics,
    SpoofOutcome, SpoofScorer,
};
use serde::Serialize;
use thiserror::Error;

use crate::cache::{CacheError, CacheSettings, CacheStats, EncodingCache, RefreshSummary};
use crate::config::Config;
use crate::encoder::{EncodeError, FrameEncoder, RegionEncoder, CROP_MARGIN};
use crate::sessions::{SessionRegistry, SessionTemplate};
use crate::source::DirectorySource;
use crate::store::{EncodingStore, StoreError};

pub const NO_FACE_DETECTED: &str = "no face detected";
pub const INVALID_FRAME: &str = "invalid frame";

/// Message for a frame that must not reach the providers, if any.
fn frame_problem(frame: &Frame) -> Option<&'static str> {
    if frame.is_empty() {
        Some("empty frame")
    } else if !frame.is_well_formed() {
        Some(INVALID_FRAME)
    } else {
        None
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// External models the engine drives.
#[derive(Clone)]
pub struct Providers {
    pub locator: Arc<dyn LandmarkProvider>,
    pub extractor: Arc<dyn FeatureExtractor>,
    /// `None` leaves the spoof channel permanently unavailable.
    pub spoof: Option<Arc<dyn SpoofScorer>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub session_id: String,
    pub is_live: bool,
    pub confidence: f32,
    pub message: String,
    /// `None` when the face locator itself failed.
    pub faces_detected: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Breakdown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionReport {
    pub result: MatchResult,
    pub faces_detected: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vectors: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RefreshSummary>,
}

/// Clone-safe handle to the liveness and recognition pipeline.
///
/// Facade calls never return errors; each produces a report whose `message`
/// explains a negative outcome.
#[derive(Clone)]
pub struct Engine {
    locator: Arc<dyn LandmarkProvider>,
    spoof: Option<Arc<dyn SpoofScorer>>,
    encoder: Arc<dyn FrameEncoder>,
    cache: Arc<EncodingCache>,
    sessions: Arc<SessionRegistry>,
    method: LivenessMethod,
    similarity_threshold: f32,
    spoof_timeout: Duration,
    maintenance_interval: Duration,
}

impl Engine {
    /// Open the encoding store and reference directory named in `config`.
    pub async fn open(config: &Config, providers: Providers) -> Result<Self, EngineError> {
        let (store, recovered) = EncodingStore::open_or_recover(&config.db_path).await?;
        tracing::info!(path = %config.db_path.display(), recovered, "encoding store opened");

        let source = Arc::new(DirectorySource::new(&config.face_db_dir));
        let encoder: Arc<dyn FrameEncoder> = Arc::new(RegionEncoder::new(
            Arc::clone(&providers.locator),
            Arc::clone(&providers.extractor),
        ));
        let cache = EncodingCache::open(
            store,
            source,
            Arc::clone(&encoder),
            cache_settings(config),
        )
        .await;

        Ok(Self::from_parts(config, providers, encoder, Arc::new(cache)))
    }

    /// Assemble an engine around an already opened cache.
    pub fn from_parts(
        config: &Config,
        providers: Providers,
        encoder: Arc<dyn FrameEncoder>,
        cache: Arc<EncodingCache>,
    ) -> Self {
        let template = SessionTemplate {
            method: config.liveness_method,
            blink: config.blink,
            fusion: config.fusion,
        };
        tracing::info!(
            method = ?config.liveness_method,
            threshold = config.similarity_threshold,
            spoof_scorer = providers.spoof.is_some(),
            "engine ready"
        );

        Self {
            locator: providers.locator,
            spoof: providers.spoof,
            encoder,
            cache,
            sessions: Arc::new(SessionRegistry::new(template, config.session_idle)),
            method: config.liveness_method,
            similarity_threshold: config.similarity_threshold,
            spoof_timeout: config.spoof_timeout,
            maintenance_interval: config.maintenance_interval,
        }
    }

    pub fn cache(&self) -> &EncodingCache {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Feed one frame to the liveness session `session_id`.
    pub async fn check_liveness(&self, frame: Frame, session_id: &str) -> LivenessReport {
        let report = |is_live, confidence, message: &str, faces_detected, breakdown| LivenessReport {
            session_id: session_id.to_string(),
            is_live,
            confidence,
            message: message.to_string(),
            faces_detected,
            breakdown,
        };

        if let Some(problem) = frame_problem(&frame) {
            tracing::warn!(session = session_id, width = frame.width, height = frame.height, bytes = frame.data.len(), reason = problem, "frame rejected");
            return report(false, 0.0, problem, Some(0), None);
        }
        let frame = Arc::new(frame);

        let locator = Arc::clone(&self.locator);
        let located = {
            let frame = Arc::clone(&frame);
            tokio::task::spawn_blocking(move || locator.locate_faces(&frame)).await
        };

        // Landmarks for the blink channel and the region the spoof scorer sees.
        let (landmarks, spoof_target, faces_detected) = match located {
            Ok(Ok(faces)) => {
                let count = faces.len();
                let Some(face) = largest_face(faces) else {
                    tracing::debug!(session = session_id, "no face in frame");
                    return report(false, 0.0, NO_FACE_DETECTED, Some(0), None);
                };
                let crop = frame.crop(&face.region, CROP_MARGIN);
                let target = if crop.is_empty() { Arc::clone(&frame) } else { Arc::new(crop) };
                (Some(face.landmarks), target, Some(count))
            }
            Ok(Err(e)) => {
                tracing::warn!(session = session_id, error = %e, "face locator unavailable — blink channel excluded");
                (None, Arc::clone(&frame), None)
            }
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "face locator task failed");
                (None, Arc::clone(&frame), None)
            }
        };

        let quality = QualityMetrics::measure(&spoof_target);
        let spoof = self.score_spoof(spoof_target, session_id).await;

        let blink_input = match &landmarks {
            Some(Some(set)) => BlinkInput::Landmarks(set),
            Some(None) => BlinkInput::NoLandmarks,
            None => BlinkInput::ProviderUnavailable,
        };

        let session = self.sessions.acquire(session_id);
        let mut verdict = session.lock().await.evaluate(blink_input, spoof, Instant::now());
        verdict.breakdown.quality = quality;

        tracing::info!(
            session = session_id,
            is_live = verdict.result.is_live,
            confidence = verdict.result.confidence,
            window = verdict.result.window_len,
            "liveness checked"
        );

        report(
            verdict.result.is_live,
            verdict.result.confidence,
            &verdict.result.message,
            faces_detected,
            Some(verdict.breakdown),
        )
    }

    /// Run the spoof scorer on a blocking thread, bounded by the configured
    /// timeout. A timed-out call keeps running but its result is discarded.
    async fn score_spoof(&self, face: Arc<Frame>, session_id: &str) -> SpoofOutcome {
        if !self.method.uses_spoof() {
            return SpoofOutcome::Unavailable {
                reason: "spoof channel disabled".to_string(),
            };
        }
        let Some(scorer) = self.spoof.as_ref().map(Arc::clone) else {
            return SpoofOutcome::Unavailable {
                reason: "no spoof scorer configured".to_string(),
            };
        };

        let task = tokio::task::spawn_blocking(move || scorer.score(&face));
        match tokio::time::timeout(self.spoof_timeout, task).await {
            Ok(Ok(result)) => {
                let outcome = SpoofOutcome::from_result(result);
                if let SpoofOutcome::Unavailable { reason } = &outcome {
                    tracing::warn!(session = session_id, reason = %reason, "spoof score unavailable");
                }
                outcome
            }
            Ok(Err(e)) => {
                tracing::warn!(session = session_id, error = %e, "spoof scorer task failed");
                SpoofOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                tracing::warn!(
                    session = session_id,
                    timeout_ms = self.spoof_timeout.as_millis() as u64,
                    "spoof scorer timed out"
                );
                SpoofOutcome::Timeout
            }
        }
    }

    /// Identify the largest face in `frame`.
    pub async fn recognize(&self, frame: Frame, threshold: Option<f32>) -> RecognitionReport {
        if let Some(problem) = frame_problem(&frame) {
            tracing::warn!(width = frame.width, height = frame.height, bytes = frame.data.len(), reason = problem, "frame rejected");
            return RecognitionReport {
                result: MatchResult::no_match(0.0),
                faces_detected: 0,
                message: problem.to_string(),
            };
        }
        let threshold = threshold.unwrap_or(self.similarity_threshold);
        let encoder = Arc::clone(&self.encoder);
        let encoded = match tokio::task::spawn_blocking(move || encoder.encode(&frame)).await {
            Ok(Ok(encoded)) => encoded,
            Ok(Err(e)) => {
                let message = match e {
                    EncodeError::NoFace => NO_FACE_DETECTED.to_string(),
                    other => other.to_string(),
                };
                tracing::info!(message = %message, "recognition failed");
                return RecognitionReport {
                    result: MatchResult::no_match(0.0),
                    faces_detected: 0,
                    message,
                };
            }
            Err(e) => {
                tracing::error!(error = %e, "encoder task failed");
                return RecognitionReport {
                    result: MatchResult::no_match(0.0),
                    faces_detected: 0,
                    message: format!("encoder task failed: {e}"),
                };
            }
        };

        match self.cache.find_match(&encoded.vector, threshold).await {
            Ok(mut result) => {
                result.region = encoded.region;
                let message = match &result.subject_id {
                    Some(id) if result.matched => format!("recognized {id}"),
                    _ => "no matching subject".to_string(),
                };
                tracing::info!(
                    matched = result.matched,
                    subject = result.subject_id.as_deref().unwrap_or("-"),
                    similarity = result.similarity,
                    "recognition complete"
                );
                RecognitionReport {
                    result,
                    faces_detected: encoded.faces_detected,
                    message,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognition lookup failed");
                RecognitionReport {
                    result: MatchResult::no_match(0.0),
                    faces_detected: encoded.faces_detected,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Add `frame` as a new sample of `subject_id`.
    pub async fn enroll(&self, subject_id: &str, frame: Frame) -> EnrollOutcome {
        tracing::info!(subject = subject_id, "enroll requested");
        if let Some(problem) = frame_problem(&frame) {
            tracing::warn!(subject = subject_id, width = frame.width, height = frame.height, bytes = frame.data.len(), reason = problem, "frame rejected");
            return EnrollOutcome {
                success: false,
                message: problem.to_string(),
                vectors: None,
            };
        }
        match self.cache.enroll(subject_id, frame).await {
            Ok(enrollment) => EnrollOutcome {
                success: true,
                message: if enrollment.reference_saved {
                    format!("enrolled {subject_id} ({} samples)", enrollment.vectors)
                } else {
                    format!(
                        "enrolled {subject_id} ({} samples); reference image not saved",
                        enrollment.vectors
                    )
                },
                vectors: Some(enrollment.vectors),
            },
            Err(e) => {
                tracing::warn!(subject = subject_id, error = %e, "enroll failed");
                let message = match e {
                    CacheError::Encode(EncodeError::NoFace) => NO_FACE_DETECTED.to_string(),
                    other => other.to_string(),
                };
                EnrollOutcome {
                    success: false,
                    message,
                    vectors: None,
                }
            }
        }
    }

    /// Forget a liveness session. Returns whether it existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.end(session_id)
    }

    pub async fn refresh_cache(&self, force: bool) -> RefreshReport {
        match self.cache.refresh(force).await {
            Ok(summary) => RefreshReport {
                success: true,
                message: if summary.refreshed {
                    format!(
                        "refreshed {} subjects ({} vectors, {} skipped)",
                        summary.subjects, summary.vectors, summary.skipped
                    )
                } else {
                    "cache is fresh".to_string()
                },
                summary: Some(summary),
            },
            Err(e) => {
                tracing::warn!(error = %e, "cache refresh failed");
                RefreshReport {
                    success: false,
                    message: e.to_string(),
                    summary: None,
                }
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Periodically retry failed cache writes and drop idle sessions.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let sessions = Arc::clone(&self.sessions);
        let period = self.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            tracing::debug!(period_secs = period.as_secs(), "maintenance task started");
            loop {
                ticker.tick().await;
                if let Err(e) = cache.flush_pending().await {
                    tracing::warn!(error = %e, "pending cache persist still failing");
                }
                sessions.evict_idle();
            }
        })
    }
}

pub fn cache_settings(config: &Config) -> CacheSettings {
    CacheSettings {
        ttl: config.cache_ttl,
        metric: config.distance_metric,
        dimension: config.embedding_dim,
    }
}
