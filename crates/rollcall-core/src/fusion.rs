//! Fusion of the blink and spoof channels, smoothed over a short window.
//!
//! Each frame yields at most one signal per channel. Channels that produced
//! nothing (no face, scorer down or timed out) drop out and the remaining
//! weights are renormalised. The fused signal then goes through a majority
//! vote over the last few frames so a single noisy frame cannot flip the
//! decision.

use std::collections::VecDeque;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::spoof::SpoofOutcome;
use crate::types::{LivenessSignal, SignalSource};

const WEIGHT_EPSILON: f32 = 1e-6;

pub const NO_USABLE_SIGNAL: &str = "no usable signal";

/// Which channels feed the decision. Chosen once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMethod {
    Blink,
    SpoofScore,
    #[default]
    Fused,
}

impl LivenessMethod {
    pub fn uses_blink(&self) -> bool {
        matches!(self, LivenessMethod::Blink | LivenessMethod::Fused)
    }

    pub fn uses_spoof(&self) -> bool {
        matches!(self, LivenessMethod::SpoofScore | LivenessMethod::Fused)
    }
}

impl FromStr for LivenessMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blink" => Ok(LivenessMethod::Blink),
            "spoof" | "spoof_score" | "deep_learning" => Ok(LivenessMethod::SpoofScore),
            "fused" | "improved" => Ok(LivenessMethod::Fused),
            other => Err(format!("unknown liveness method '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub blink_weight: f32,
    pub spoof_weight: f32,
    pub window_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            blink_weight: 0.3,
            spoof_weight: 0.7,
            window_capacity: 5,
        }
    }
}

/// One channel's contribution after renormalisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelContribution {
    pub source: SignalSource,
    pub is_live: bool,
    pub confidence: f32,
    pub weight: f32,
}

/// Result of fusing one frame's channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedSignal {
    /// `None` when no channel was usable.
    pub signal: Option<LivenessSignal>,
    pub channels: Vec<ChannelContribution>,
}

/// Decision after smoothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmoothedResult {
    pub is_live: bool,
    pub confidence: f32,
    pub message: String,
    /// Entries in the window when the decision was made.
    pub window_len: usize,
    pub smoothed: bool,
}

/// Fixed-capacity FIFO of fused signals.
#[derive(Debug, Clone)]
pub struct DecisionWindow {
    capacity: usize,
    entries: VecDeque<LivenessSignal>,
}

impl DecisionWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, signal: LivenessSignal) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(signal);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_votes(&self) -> usize {
        self.entries.iter().filter(|s| s.is_live).count()
    }

    /// Strict majority of the configured capacity, not of the current length.
    pub fn majority_live(&self) -> bool {
        self.live_votes() * 2 > self.capacity
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(|s| s.confidence).sum::<f32>() / self.entries.len() as f32
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct FusionEngine {
    config: FusionConfig,
    window: DecisionWindow,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            window: DecisionWindow::new(config.window_capacity),
            config,
        }
    }

    pub fn window(&self) -> &DecisionWindow {
        &self.window
    }

    /// Combine the channels available for one frame.
    ///
    /// `blink` is `None` when the blink channel produced nothing (no face, or
    /// landmarks unavailable); a face with no blink yet is `Some` with
    /// `is_live = false`.
    pub fn fuse(&self, blink: Option<&LivenessSignal>, spoof: &SpoofOutcome) -> FusedSignal {
        let mut raw: Vec<(SignalSource, bool, f32, f32)> = Vec::with_capacity(2);
        if let Some(b) = blink {
            raw.push((SignalSource::Blink, b.is_live, b.confidence, self.config.blink_weight));
        }
        if let Some(score) = spoof.score() {
            raw.push((SignalSource::SpoofScore, score > 0.5, score, self.config.spoof_weight));
        }

        let total: f32 = raw.iter().map(|(_, _, _, w)| w.max(0.0)).sum();
        if raw.is_empty() || total <= WEIGHT_EPSILON {
            return FusedSignal {
                signal: None,
                channels: Vec::new(),
            };
        }

        let channels: Vec<ChannelContribution> = raw
            .into_iter()
            .map(|(source, is_live, confidence, w)| ChannelContribution {
                source,
                is_live,
                confidence,
                weight: w.max(0.0) / total,
            })
            .collect();

        let confidence: f32 = channels.iter().map(|c| c.confidence * c.weight).sum();
        let live_weight: f32 = channels
            .iter()
            .filter(|c| c.is_live)
            .map(|c| c.weight)
            .sum();

        // A live channel carrying exactly half the weight only wins if the
        // other half agrees; exact ties fall to "not live".
        let dominant_live = channels.iter().any(|c| {
            c.is_live
                && (c.weight > 0.5 + WEIGHT_EPSILON
                    || ((c.weight - 0.5).abs() <= WEIGHT_EPSILON
                        && live_weight > 0.5 + WEIGHT_EPSILON))
        });

        let is_live = confidence > 0.5 || dominant_live;

        FusedSignal {
            signal: Some(LivenessSignal::new(is_live, confidence, SignalSource::Fused)),
            channels,
        }
    }

    /// Push a fused signal into the window and return the smoothed decision.
    pub fn push(&mut self, fused: &FusedSignal) -> SmoothedResult {
        let Some(current) = fused.signal else {
            return SmoothedResult {
                is_live: false,
                confidence: 0.0,
                message: NO_USABLE_SIGNAL.to_string(),
                window_len: self.window.len(),
                smoothed: false,
            };
        };

        self.window.push(current);

        if self.window.len() < 2 {
            return SmoothedResult {
                is_live: current.is_live,
                confidence: current.confidence,
                message: verdict_message(current.is_live).to_string(),
                window_len: self.window.len(),
                smoothed: false,
            };
        }

        let is_live = self.window.majority_live();
        SmoothedResult {
            is_live,
            confidence: self.window.mean_confidence(),
            message: verdict_message(is_live).to_string(),
            window_len: self.window.len(),
            smoothed: true,
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

fn verdict_message(is_live: bool) -> &'static str {
    if is_live {
        "live face"
    } else {
        "possible spoof"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blink(is_live: bool, confidence: f32) -> LivenessSignal {
        LivenessSignal::new(is_live, confidence, SignalSource::Blink)
    }

    fn fused(is_live: bool, confidence: f32) -> FusedSignal {
        FusedSignal {
            signal: Some(LivenessSignal::new(is_live, confidence, SignalSource::Fused)),
            channels: Vec::new(),
        }
    }

    #[test]
    fn test_weighted_mean_both_channels() {
        let engine = FusionEngine::new(FusionConfig::default());
        let out = engine.fuse(Some(&blink(true, 0.8)), &SpoofOutcome::Score { value: 0.4 });
        let signal = out.signal.unwrap();
        assert!((signal.confidence - 0.52).abs() < 1e-6);
        assert_eq!(signal.source, SignalSource::Fused);
        // 0.52 > 0.5 → live
        assert!(signal.is_live);
        assert_eq!(out.channels.len(), 2);
    }

    #[test]
    fn test_renormalises_when_spoof_unavailable() {
        let engine = FusionEngine::new(FusionConfig::default());
        let out = engine.fuse(Some(&blink(true, 0.6)), &SpoofOutcome::Timeout);
        let signal = out.signal.unwrap();
        assert_eq!(out.channels.len(), 1);
        assert!((out.channels[0].weight - 1.0).abs() < 1e-6);
        assert!((signal.confidence - 0.6).abs() < 1e-6);
        assert!(signal.is_live);
    }

    #[test]
    fn test_renormalises_when_blink_missing() {
        let engine = FusionEngine::new(FusionConfig::default());
        let out = engine.fuse(None, &SpoofOutcome::Score { value: 0.3 });
        let signal = out.signal.unwrap();
        assert!((signal.confidence - 0.3).abs() < 1e-6);
        assert!(!signal.is_live);
    }

    #[test]
    fn test_dominant_live_channel_wins_below_half_confidence() {
        // Spoof says live (0.55) at weight 0.7, blink says not live.
        // Confidence 0.7*0.55 = 0.385 < 0.5, but spoof holds > half the weight.
        let engine = FusionEngine::new(FusionConfig::default());
        let out = engine.fuse(Some(&blink(false, 0.0)), &SpoofOutcome::Score { value: 0.55 });
        let signal = out.signal.unwrap();
        assert!(signal.confidence < 0.5);
        assert!(signal.is_live);
    }

    #[test]
    fn test_minor_live_channel_does_not_win() {
        let engine = FusionEngine::new(FusionConfig::default());
        let out = engine.fuse(Some(&blink(true, 0.6)), &SpoofOutcome::Score { value: 0.2 });
        let signal = out.signal.unwrap();
        // 0.3*0.6 + 0.7*0.2 = 0.32
        assert!((signal.confidence - 0.32).abs() < 1e-6);
        assert!(!signal.is_live);
    }

    #[test]
    fn test_exact_tie_is_not_live() {
        let engine = FusionEngine::new(FusionConfig {
            blink_weight: 0.5,
            spoof_weight: 0.5,
            window_capacity: 5,
        });
        // Blink live at 0.5 confidence, spoof not live at 0.5: confidence 0.5, tie.
        let out = engine.fuse(Some(&blink(true, 0.5)), &SpoofOutcome::Score { value: 0.5 });
        let signal = out.signal.unwrap();
        assert!((signal.confidence - 0.5).abs() < 1e-6);
        assert!(!signal.is_live);
    }

    #[test]
    fn test_equal_weights_both_live() {
        let engine = FusionEngine::new(FusionConfig {
            blink_weight: 0.5,
            spoof_weight: 0.5,
            window_capacity: 5,
        });
        let out = engine.fuse(Some(&blink(true, 0.5)), &SpoofOutcome::Score { value: 0.51 });
        assert!(out.signal.unwrap().is_live);
    }

    #[test]
    fn test_no_channels_is_no_usable_signal() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let out = engine.fuse(
            None,
            &SpoofOutcome::Unavailable {
                reason: "down".into(),
            },
        );
        assert!(out.signal.is_none());
        let result = engine.push(&out);
        assert!(!result.is_live);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.message, NO_USABLE_SIGNAL);
        assert!(engine.window().is_empty());
    }

    #[test]
    fn test_single_entry_is_unsmoothed() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let result = engine.push(&fused(true, 0.9));
        assert!(result.is_live);
        assert!((result.confidence - 0.9).abs() < 1e-6);
        assert!(!result.smoothed);
    }

    #[test]
    fn test_window_majority_of_capacity() {
        // Capacity 5: live iff at least 3 of the last 5 were live.
        let mut engine = FusionEngine::new(FusionConfig::default());
        let pattern = [true, false, true, false, false];
        let mut last = None;
        for live in pattern {
            last = Some(engine.push(&fused(live, if live { 0.8 } else { 0.2 })));
        }
        let last = last.unwrap();
        assert!(!last.is_live);
        assert!((last.confidence - 0.44).abs() < 1e-5);

        // Evicts the oldest (live) entry: window = F T F F T → 2 live
        let r = engine.push(&fused(true, 0.8));
        assert!(!r.is_live);
        // window = T F F T T → 3 live
        let r = engine.push(&fused(true, 0.8));
        assert!(r.is_live);
        assert_eq!(r.window_len, 5);
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = DecisionWindow::new(3);
        for _ in 0..10 {
            window.push(LivenessSignal::new(true, 1.0, SignalSource::Fused));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.capacity(), 3);
    }

    #[test]
    fn test_partial_window_needs_capacity_majority() {
        // Two live entries in a capacity-5 window are not a majority of 5.
        let mut engine = FusionEngine::new(FusionConfig::default());
        engine.push(&fused(true, 0.9));
        let r = engine.push(&fused(true, 0.9));
        assert!(r.smoothed);
        assert!(!r.is_live);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("blink".parse::<LivenessMethod>().unwrap(), LivenessMethod::Blink);
        assert_eq!("improved".parse::<LivenessMethod>().unwrap(), LivenessMethod::Fused);
        assert_eq!(
            "deep_learning".parse::<LivenessMethod>().unwrap(),
            LivenessMethod::SpoofScore
        );
        assert!("api".parse::<LivenessMethod>().is_err());
        assert!(LivenessMethod::Fused.uses_blink() && LivenessMethod::Fused.uses_spoof());
        assert!(!LivenessMethod::Blink.uses_spoof());
    }
}
