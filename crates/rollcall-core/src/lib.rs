//! rollcall-core: liveness decision and identity matching primitives.
//!
//! Blink detection over facial landmarks, spoof-score fusion with temporal
//! smoothing, and nearest-neighbor matching of face embeddings. No I/O; the
//! landmark detector, embedding extractor and spoof classifier are plugged in
//! through the traits in [`providers`] and [`spoof`].

pub mod blink;
pub mod fusion;
pub mod matcher;
pub mod providers;
pub mod session;
pub mod spoof;
pub mod types;

pub use blink::{BlinkConfig, BlinkDetector, BlinkObservation, BlinkStrategy};
pub use fusion::{FusionConfig, FusionEngine, LivenessMethod, SmoothedResult};
pub use matcher::{DistanceMetric, NearestNeighbor};
pub use providers::{DetectedFace, ExtractError, FeatureExtractor, LandmarkProvider, ProviderError};
pub use session::LivenessSession;
pub use spoof::{QualityMetrics, SpoofOutcome, SpoofScorer};
pub use types::{BoundingBox, FeatureVector, Frame, LandmarkSet, LivenessSignal, MatchResult, Point, SignalSource};
