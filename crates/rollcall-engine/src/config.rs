use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::{BlinkConfig, BlinkStrategy, DistanceMetric, FusionConfig, LivenessMethod};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite encoding store.
    pub db_path: PathBuf,
    /// Root of the reference image tree (`<root>/<subject_id>/*.jpg`).
    pub face_db_dir: PathBuf,
    /// Maximum cache age before a lazy refresh rescans the reference images.
    pub cache_ttl: Duration,
    /// Minimum similarity (1 − distance) for a positive match.
    pub similarity_threshold: f32,
    pub distance_metric: DistanceMetric,
    /// Fixes the vector dimension up front; otherwise the first vector does.
    pub embedding_dim: Option<usize>,
    pub liveness_method: LivenessMethod,
    pub blink: BlinkConfig,
    pub fusion: FusionConfig,
    /// Upper bound on a single spoof-scorer call.
    pub spoof_timeout: Duration,
    /// Liveness sessions unused for this long are dropped.
    pub session_idle: Duration,
    /// Period of the background flush/eviction task.
    pub maintenance_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("encodings.db"),
            face_db_dir: data_dir.join("faces"),
            cache_ttl: Duration::from_secs(60),
            similarity_threshold: 0.6,
            distance_metric: DistanceMetric::default(),
            embedding_dim: None,
            liveness_method: LivenessMethod::default(),
            blink: BlinkConfig::default(),
            fusion: FusionConfig::default(),
            spoof_timeout: Duration::from_millis(3000),
            session_idle: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let liveness_method = env.parsed("ROLLCALL_LIVENESS_METHOD", defaults.liveness_method)?;
        let distance_metric = env.parsed("ROLLCALL_DISTANCE_METRIC", defaults.distance_metric)?;

        let ear_threshold = env.f32("ROLLCALL_EAR_THRESHOLD", 0.20);
        let consecutive_frames = env.u64("ROLLCALL_BLINK_CONSEC_FRAMES", 2).max(1) as u32;
        let strategy = match lookup("ROLLCALL_BLINK_STRATEGY")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("fixed") => BlinkStrategy::FixedThreshold {
                threshold: ear_threshold,
                consecutive_frames,
            },
            Some("adaptive") => {
                let mut adaptive = BlinkStrategy::adaptive();
                if let BlinkStrategy::AdaptiveBaseline {
                    fallback_threshold, ..
                } = &mut adaptive
                {
                    *fallback_threshold = ear_threshold;
                }
                adaptive
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "ROLLCALL_BLINK_STRATEGY",
                    message: format!("unknown blink strategy '{other}' (expected fixed|adaptive)"),
                })
            }
        };

        let embedding_dim = lookup("ROLLCALL_EMBEDDING_DIM")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&d| d > 0);

        Ok(Self {
            db_path: lookup("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            face_db_dir: lookup("ROLLCALL_FACE_DB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.face_db_dir),
            cache_ttl: Duration::from_secs(env.u64("ROLLCALL_CACHE_TTL_SECS", 60)),
            similarity_threshold: env
                .f32("ROLLCALL_SIMILARITY_THRESHOLD", defaults.similarity_threshold)
                .clamp(0.0, 1.0),
            distance_metric,
            embedding_dim,
            liveness_method,
            blink: BlinkConfig {
                strategy,
                freshness: Duration::from_secs(env.u64("ROLLCALL_BLINK_FRESHNESS_SECS", 5)),
                ..defaults.blink
            },
            fusion: FusionConfig {
                blink_weight: env.f32("ROLLCALL_BLINK_WEIGHT", defaults.fusion.blink_weight),
                spoof_weight: env.f32("ROLLCALL_SPOOF_WEIGHT", defaults.fusion.spoof_weight),
                window_capacity: env
                    .usize("ROLLCALL_DECISION_WINDOW", defaults.fusion.window_capacity)
                    .max(1),
            },
            spoof_timeout: Duration::from_millis(env.u64("ROLLCALL_SPOOF_TIMEOUT_MS", 3000)),
            session_idle: Duration::from_secs(env.u64("ROLLCALL_SESSION_IDLE_SECS", 120).max(1)),
            maintenance_interval: Duration::from_secs(
                env.u64("ROLLCALL_MAINTENANCE_INTERVAL_SECS", 30).max(1),
            ),
        })
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn f32(&self, key: &str, default: f32) -> f32 {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Enumerated values must parse; a typo is an error, not a silent default.
    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr<Err = String>,
    {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|message| ConfigError::Invalid { key, message }),
        }
    }
}
