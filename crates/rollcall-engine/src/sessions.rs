use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rollcall_core::{BlinkConfig, FusionConfig, LivenessMethod, LivenessSession};

/// Settings every new session is created with.
#[derive(Debug, Clone, Copy)]
pub struct SessionTemplate {
    pub method: LivenessMethod,
    pub blink: BlinkConfig,
    pub fusion: FusionConfig,
}

impl SessionTemplate {
    fn build(&self) -> LivenessSession {
        LivenessSession::new(self.method, self.blink, self.fusion)
    }
}

struct SessionRecord {
    session: Arc<tokio::sync::Mutex<LivenessSession>>,
    last_used: Instant,
}

/// Liveness sessions keyed by caller-chosen id.
///
/// Each session sits behind its own async mutex, so frames for one session
/// are evaluated in order while different sessions never contend. The map
/// lock is only held to look up or insert a record. Sessions unused for
/// `idle` are dropped by [`SessionRegistry::evict_idle`]; a lookup of an
/// expired session starts a fresh one.
pub struct SessionRegistry {
    records: Mutex<HashMap<String, SessionRecord>>,
    template: SessionTemplate,
    idle: Duration,
}

impl SessionRegistry {
    pub fn new(template: SessionTemplate, idle: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            template,
            idle,
        }
    }

    pub fn acquire(&self, session_id: &str) -> Arc<tokio::sync::Mutex<LivenessSession>> {
        self.acquire_at(session_id, Instant::now())
    }

    pub fn acquire_at(&self, session_id: &str, now: Instant) -> Arc<tokio::sync::Mutex<LivenessSession>> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let template = self.template;
        let record = records.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session = session_id, "liveness session created");
            SessionRecord {
                session: Arc::new(tokio::sync::Mutex::new(template.build())),
                last_used: now,
            }
        });

        if now.saturating_duration_since(record.last_used) >= self.idle {
            // Idle expired, start over
            tracing::debug!(session = session_id, "liveness session expired — restarting");
            record.session = Arc::new(tokio::sync::Mutex::new(template.build()));
        }
        record.last_used = now;
        Arc::clone(&record.session)
    }

    /// Drop a session. Returns whether it existed.
    pub fn end(&self, session_id: &str) -> bool {
        let removed = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
            .is_some();
        if removed {
            tracing::debug!(session = session_id, "liveness session ended");
        }
        removed
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|_, r| now.saturating_duration_since(r.last_used) < self.idle);
        let evicted = before - records.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = records.len(), "idle liveness sessions evicted");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::session::BlinkInput;
    use rollcall_core::SpoofOutcome;

    const IDLE: Duration = Duration::from_secs(120);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            SessionTemplate {
                method: LivenessMethod::SpoofScore,
                blink: BlinkConfig::default(),
                fusion: FusionConfig::default(),
            },
            IDLE,
        )
    }

    #[tokio::test]
    async fn test_same_id_returns_same_session() {
        let reg = registry();
        let now = Instant::now();
        let a = reg.acquire_at("kiosk-1", now);
        a.lock().await.evaluate(
            BlinkInput::ProviderUnavailable,
            SpoofOutcome::Score { value: 0.9 },
            now,
        );
        let again = reg.acquire_at("kiosk-1", now + Duration::from_secs(1));
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(again.lock().await.frames_seen(), 1);
    }

    #[test]
    fn test_independent_per_session() {
        let reg = registry();
        let now = Instant::now();
        let a = reg.acquire_at("kiosk-1", now);
        let b = reg.acquire_at("kiosk-2", now);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_expired_session_restarts() {
        let reg = registry();
        let now = Instant::now();
        let a = reg.acquire_at("kiosk-1", now);
        let b = reg.acquire_at("kiosk-1", now + IDLE);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_evict_idle() {
        let reg = registry();
        let now = Instant::now();
        reg.acquire_at("old", now);
        reg.acquire_at("recent", now + Duration::from_secs(100));

        assert_eq!(reg.evict_idle_at(now + Duration::from_secs(150)), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.evict_idle_at(now + Duration::from_secs(150)), 0);
    }

    #[test]
    fn test_end_session() {
        let reg = registry();
        reg.acquire("kiosk-1");
        assert!(reg.end("kiosk-1"));
        assert!(!reg.end("kiosk-1"));
        assert!(reg.is_empty());
    }
}
