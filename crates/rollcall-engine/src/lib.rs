//! rollcall-engine: runtime around `rollcall-core`.
//!
//! Wires the external face locator, feature extractor and spoof scorer into
//! per-session liveness checks, and keeps the identity-matching cache in sync
//! with its reference images and its encrypted SQLite store.

pub mod cache;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod sessions;
pub mod source;
pub mod store;

pub use cache::{CacheError, CacheSettings, CacheStats, EncodingCache, Enrollment, RefreshSummary};
pub use config::{Config, ConfigError};
pub use encoder::{EncodeError, FrameEncoder, RegionEncoder};
pub use engine::{Engine, EngineError, EnrollOutcome, LivenessReport, Providers, RecognitionReport, RefreshReport};
pub use sessions::SessionRegistry;
pub use source::{DirectorySource, ReferenceSource, SourceError};
pub use store::{EncodingStore, StoreError};
