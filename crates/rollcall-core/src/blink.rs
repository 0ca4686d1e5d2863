//! Blink-based liveness via the eye aspect ratio (EAR).
//!
//! A printed photograph or a still screen cannot blink. Each call to
//! [`BlinkDetector::observe`] takes the landmarks of one face, measures how
//! open the eyes are, and tracks closure runs over time. A run of closed-eye
//! frames followed by an open-eye frame confirms one blink; a recent blink
//! makes the channel report "live".
//!
//! # Strategies
//!
//! - [`BlinkStrategy::FixedThreshold`] closes the eye when EAR drops below a
//!   fixed ratio. Strict and predictable.
//! - [`BlinkStrategy::AdaptiveBaseline`] learns the subject's open-eye EAR and
//!   flags a relative or absolute drop from it. Looser; tolerates narrow eyes
//!   and oblique poses.
//!
//! The detector is session state. Create one per liveness check and drop it at
//! the end of the session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::{LandmarkSet, LivenessSignal, Point, SignalSource};

/// EAR reported when the horizontal eye extent collapses to a point.
/// Treated as "wide open" so degenerate landmarks never count as a closure.
pub const EAR_UNDEFINED: f32 = f32::MAX;

const MIN_EYE_WIDTH: f32 = 1e-6;

/// Eye aspect ratio of a 6-point eye contour `p1..p6`:
/// `(|p2-p6| + |p3-p5|) / (2 |p1-p4|)`.
pub fn eye_aspect_ratio(eye: &[Point]) -> f32 {
    if eye.len() != 6 {
        return EAR_UNDEFINED;
    }
    let vertical_a = eye[1].distance(&eye[5]);
    let vertical_b = eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);

    if horizontal < MIN_EYE_WIDTH {
        return EAR_UNDEFINED;
    }

    (vertical_a + vertical_b) / (2.0 * horizontal)
}

/// Mean EAR of both eyes. If only one eye is measurable, that eye's EAR.
pub fn mean_ear(landmarks: &LandmarkSet) -> f32 {
    let left = eye_aspect_ratio(landmarks.left_eye());
    let right = eye_aspect_ratio(landmarks.right_eye());
    match (left == EAR_UNDEFINED, right == EAR_UNDEFINED) {
        (false, false) => (left + right) / 2.0,
        (true, false) => right,
        (false, true) => left,
        (true, true) => EAR_UNDEFINED,
    }
}

/// How a single EAR sample is classified as "eye closed".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlinkStrategy {
    FixedThreshold {
        threshold: f32,
        consecutive_frames: u32,
    },
    AdaptiveBaseline {
        /// Fractional drop below baseline that counts as closed (0.25 = 25%).
        relative_drop: f32,
        /// Absolute EAR drop below baseline that counts as closed.
        absolute_drop: f32,
        /// Open-eye samples required before the baseline is trusted.
        warmup_samples: usize,
        consecutive_frames: u32,
        /// Threshold used until the baseline is established.
        fallback_threshold: f32,
    },
}

impl BlinkStrategy {
    pub fn fixed() -> Self {
        BlinkStrategy::FixedThreshold {
            threshold: 0.20,
            consecutive_frames: 2,
        }
    }

    pub fn adaptive() -> Self {
        BlinkStrategy::AdaptiveBaseline {
            relative_drop: 0.25,
            absolute_drop: 0.08,
            warmup_samples: 10,
            consecutive_frames: 1,
            fallback_threshold: 0.20,
        }
    }

    fn consecutive_frames(&self) -> u32 {
        match *self {
            BlinkStrategy::FixedThreshold {
                consecutive_frames, ..
            }
            | BlinkStrategy::AdaptiveBaseline {
                consecutive_frames, ..
            } => consecutive_frames.max(1),
        }
    }
}

impl Default for BlinkStrategy {
    fn default() -> Self {
        Self::fixed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlinkConfig {
    pub strategy: BlinkStrategy,
    /// A blink counts towards liveness only this long after it was confirmed.
    pub freshness: Duration,
    /// Capacity of the rolling EAR history.
    pub history_len: usize,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            strategy: BlinkStrategy::default(),
            freshness: Duration::from_secs(5),
            history_len: 30,
        }
    }
}

/// Per-session blink counters.
#[derive(Debug, Clone, Default)]
pub struct BlinkState {
    pub closure_counter: u32,
    pub total_blinks: u32,
    pub last_blink_at: Option<Instant>,
    pub ear_history: VecDeque<f32>,
    pub baseline_ear: Option<f32>,
}

/// What the detector saw on one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlinkObservation {
    /// No landmarks were supplied. Distinct from "no blink yet".
    NoFace,
    Observed {
        ear: f32,
        eye_closed: bool,
        blink_confirmed: bool,
        total_blinks: u32,
        signal: LivenessSignal,
    },
}

impl BlinkObservation {
    pub fn signal(&self) -> LivenessSignal {
        match self {
            BlinkObservation::NoFace => LivenessSignal::new(false, 0.0, SignalSource::Blink),
            BlinkObservation::Observed { signal, .. } => *signal,
        }
    }

    pub fn is_face(&self) -> bool {
        matches!(self, BlinkObservation::Observed { .. })
    }
}

pub struct BlinkDetector {
    config: BlinkConfig,
    state: BlinkState,
}

impl BlinkDetector {
    pub fn new(config: BlinkConfig) -> Self {
        Self {
            config,
            state: BlinkState::default(),
        }
    }

    pub fn state(&self) -> &BlinkState {
        &self.state
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    pub fn observe(&mut self, landmarks: Option<&LandmarkSet>) -> BlinkObservation {
        self.observe_at(landmarks, Instant::now())
    }

    pub fn observe_at(&mut self, landmarks: Option<&LandmarkSet>, now: Instant) -> BlinkObservation {
        match landmarks {
            Some(landmarks) => self.observe_ear_at(mean_ear(landmarks), now),
            None => BlinkObservation::NoFace,
        }
    }

    /// Feed one pre-computed EAR sample.
    pub fn observe_ear_at(&mut self, ear: f32, now: Instant) -> BlinkObservation {
        let eye_closed = self.is_closed(ear);
        let mut blink_confirmed = false;

        if eye_closed {
            self.state.closure_counter += 1;
        } else {
            if self.state.closure_counter >= self.config.strategy.consecutive_frames() {
                self.state.total_blinks += 1;
                self.state.last_blink_at = Some(now);
                blink_confirmed = true;
                tracing::debug!(
                    total_blinks = self.state.total_blinks,
                    closed_frames = self.state.closure_counter,
                    "blink confirmed"
                );
            }
            self.state.closure_counter = 0;
        }

        self.record_history(ear, eye_closed);

        BlinkObservation::Observed {
            ear,
            eye_closed,
            blink_confirmed,
            total_blinks: self.state.total_blinks,
            signal: self.signal_at(now),
        }
    }

    /// Liveness signal from the current state without feeding a new sample.
    pub fn signal_at(&self, now: Instant) -> LivenessSignal {
        let fresh = self
            .state
            .last_blink_at
            .map(|at| now.saturating_duration_since(at) <= self.config.freshness)
            .unwrap_or(false);

        if self.state.total_blinks > 0 && fresh {
            let confidence = (0.5 + 0.1 * self.state.total_blinks as f32).min(0.95);
            LivenessSignal::new(true, confidence, SignalSource::Blink)
        } else {
            LivenessSignal::new(false, 0.0, SignalSource::Blink)
        }
    }

    pub fn reset(&mut self) {
        self.state = BlinkState::default();
    }

    fn is_closed(&self, ear: f32) -> bool {
        if ear == EAR_UNDEFINED || !ear.is_finite() {
            return false;
        }
        match self.config.strategy {
            BlinkStrategy::FixedThreshold { threshold, .. } => ear < threshold,
            BlinkStrategy::AdaptiveBaseline {
                relative_drop,
                absolute_drop,
                fallback_threshold,
                ..
            } => match self.state.baseline_ear {
                Some(baseline) => {
                    ear < baseline * (1.0 - relative_drop) || baseline - ear > absolute_drop
                }
                None => ear < fallback_threshold,
            },
        }
    }

    fn record_history(&mut self, ear: f32, eye_closed: bool) {
        // Only open-eye samples feed the baseline; a long closure must not drag it down.
        if eye_closed || ear == EAR_UNDEFINED || !ear.is_finite() {
            return;
        }

        let capacity = self.config.history_len.max(1);
        while self.state.ear_history.len() >= capacity {
            self.state.ear_history.pop_front();
        }
        self.state.ear_history.push_back(ear);

        if let BlinkStrategy::AdaptiveBaseline { warmup_samples, .. } = self.config.strategy {
            if self.state.ear_history.len() >= warmup_samples.max(1) {
                let sum: f32 = self.state.ear_history.iter().sum();
                self.state.baseline_ear = Some(sum / self.state.ear_history.len() as f32);
            }
        }
    }
}
