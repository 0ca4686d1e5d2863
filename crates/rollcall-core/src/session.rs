use std::time::Instant;

use serde::Serialize;

use crate::blink::{BlinkConfig, BlinkDetector, BlinkObservation};
use crate::fusion::{FusedSignal, FusionConfig, FusionEngine, LivenessMethod, SmoothedResult};
use crate::spoof::{QualityMetrics, SpoofOutcome};
use crate::types::LandmarkSet;

/// Blink channel input for one frame.
#[derive(Debug, Clone, Copy)]
pub enum BlinkInput<'a> {
    Landmarks(&'a LandmarkSet),
    /// A face was found but no landmarks were fitted.
    NoLandmarks,
    /// The landmark provider failed.
    ProviderUnavailable,
}

/// Per-channel provenance attached to every verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blink: Option<BlinkObservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoof: Option<SpoofOutcome>,
    pub fused: FusedSignal,
    /// Filled in by the caller that holds the face crop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionVerdict {
    pub result: SmoothedResult,
    pub breakdown: Breakdown,
}

/// State of one ongoing liveness check: blink counters plus the decision
/// window. Owned by exactly one caller at a time.
pub struct LivenessSession {
    method: LivenessMethod,
    blink: BlinkDetector,
    fusion: FusionEngine,
    frames_seen: u64,
}

impl LivenessSession {
    pub fn new(method: LivenessMethod, blink: BlinkConfig, fusion: FusionConfig) -> Self {
        Self {
            method,
            blink: BlinkDetector::new(blink),
            fusion: FusionEngine::new(fusion),
            frames_seen: 0,
        }
    }

    pub fn method(&self) -> LivenessMethod {
        self.method
    }

    pub fn blink_detector(&self) -> &BlinkDetector {
        &self.blink
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Feed one frame's channel inputs and return the smoothed verdict.
    ///
    /// `spoof` is ignored when the configured method does not use the spoof
    /// channel; the blink detector is not advanced when the method does not
    /// use blinks.
    pub fn evaluate(&mut self, blink: BlinkInput<'_>, spoof: SpoofOutcome, now: Instant) -> SessionVerdict {
        self.frames_seen += 1;

        let blink_obs = if self.method.uses_blink() {
            match blink {
                BlinkInput::Landmarks(landmarks) => Some(self.blink.observe_at(Some(landmarks), now)),
                BlinkInput::NoLandmarks => Some(self.blink.observe_at(None, now)),
                BlinkInput::ProviderUnavailable => None,
            }
        } else {
            None
        };

        let spoof = if self.method.uses_spoof() {
            Some(spoof)
        } else {
            None
        };

        let blink_signal = blink_obs
            .as_ref()
            .filter(|obs| obs.is_face())
            .map(|obs| obs.signal());
        let spoof_for_fusion = spoof.clone().unwrap_or(SpoofOutcome::Unavailable {
            reason: "spoof channel disabled".to_string(),
        });

        let fused = self.fusion.fuse(blink_signal.as_ref(), &spoof_for_fusion);
        let result = self.fusion.push(&fused);

        tracing::debug!(
            method = ?self.method,
            is_live = result.is_live,
            confidence = result.confidence,
            window = result.window_len,
            "liveness frame evaluated"
        );

        SessionVerdict {
            result,
            breakdown: Breakdown {
                blink: blink_obs,
                spoof,
                fused,
                quality: None,
            },
        }
    }

    pub fn reset(&mut self) {
        self.blink.reset();
        self.fusion.reset();
        self.frames_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blink::BlinkStrategy;
    use crate::fusion::NO_USABLE_SIGNAL;
    use crate::types::{Point, LANDMARK_COUNT};
    use std::time::Duration;

    fn landmarks_with_ear(ear: f32) -> LandmarkSet {
        let mut points = vec![Point::default(); LANDMARK_COUNT];
        for (start, offset) in [(36usize, 0.0f32), (42, 3.0)] {
            let half = ear / 2.0;
            let eye = [
                Point::new(offset, 0.0),
                Point::new(offset + 0.33, -half),
                Point::new(offset + 0.66, -half),
                Point::new(offset + 1.0, 0.0),
                Point::new(offset + 0.66, half),
                Point::new(offset + 0.33, half),
            ];
            points[start..start + 6].copy_from_slice(&eye);
        }
        LandmarkSet::new(points).unwrap()
    }

    fn session(method: LivenessMethod) -> LivenessSession {
        LivenessSession::new(
            method,
            BlinkConfig {
                strategy: BlinkStrategy::FixedThreshold {
                    threshold: 0.2,
                    consecutive_frames: 1,
                },
                ..BlinkConfig::default()
            },
            FusionConfig::default(),
        )
    }

    #[test]
    fn test_blink_then_spoof_fused() {
        let mut s = session(LivenessMethod::Fused);
        let start = Instant::now();
        let open = landmarks_with_ear(0.3);
        let closed = landmarks_with_ear(0.1);
        let good = SpoofOutcome::Score { value: 0.9 };

        s.evaluate(BlinkInput::Landmarks(&open), good.clone(), start);
        s.evaluate(
            BlinkInput::Landmarks(&closed),
            good.clone(),
            start + Duration::from_millis(33),
        );
        let v = s.evaluate(
            BlinkInput::Landmarks(&open),
            good,
            start + Duration::from_millis(66),
        );
        assert!(v.result.is_live);
        assert_eq!(s.blink_detector().state().total_blinks, 1);
        assert_eq!(v.breakdown.fused.channels.len(), 2);
        assert_eq!(s.frames_seen(), 3);
    }

    #[test]
    fn test_provider_unavailable_excludes_blink() {
        let mut s = session(LivenessMethod::Fused);
        let v = s.evaluate(
            BlinkInput::ProviderUnavailable,
            SpoofOutcome::Score { value: 0.8 },
            Instant::now(),
        );
        assert!(v.breakdown.blink.is_none());
        assert_eq!(v.breakdown.fused.channels.len(), 1);
        assert!(v.result.is_live);
    }

    #[test]
    fn test_no_landmarks_and_timeout_is_no_signal() {
        let mut s = session(LivenessMethod::Fused);
        let v = s.evaluate(BlinkInput::NoLandmarks, SpoofOutcome::Timeout, Instant::now());
        assert_eq!(v.breakdown.blink, Some(BlinkObservation::NoFace));
        assert!(!v.result.is_live);
        assert_eq!(v.result.message, NO_USABLE_SIGNAL);
    }

    #[test]
    fn test_blink_method_ignores_spoof() {
        let mut s = session(LivenessMethod::Blink);
        let open = landmarks_with_ear(0.3);
        let v = s.evaluate(
            BlinkInput::Landmarks(&open),
            SpoofOutcome::Score { value: 1.0 },
            Instant::now(),
        );
        assert!(v.breakdown.spoof.is_none());
        assert!(!v.result.is_live);
    }

    #[test]
    fn test_spoof_method_does_not_advance_blinks() {
        let mut s = session(LivenessMethod::SpoofScore);
        let closed = landmarks_with_ear(0.1);
        let start = Instant::now();
        s.evaluate(BlinkInput::Landmarks(&closed), SpoofOutcome::Score { value: 0.7 }, start);
        assert_eq!(s.blink_detector().state().closure_counter, 0);
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut a = session(LivenessMethod::Blink);
        let mut b = session(LivenessMethod::Blink);
        let start = Instant::now();
        let open = landmarks_with_ear(0.3);
        let closed = landmarks_with_ear(0.1);
        a.evaluate(BlinkInput::Landmarks(&closed), SpoofOutcome::Timeout, start);
        b.evaluate(BlinkInput::Landmarks(&open), SpoofOutcome::Timeout, start);
        a.evaluate(BlinkInput::Landmarks(&open), SpoofOutcome::Timeout, start);
        assert_eq!(a.blink_detector().state().total_blinks, 1);
        assert_eq!(b.blink_detector().state().total_blinks, 0);
    }
}
