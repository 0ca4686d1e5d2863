//! Per-frame spoof scoring.
//!
//! A [`SpoofScorer`] looks at a cropped face and returns the probability that
//! it is a live face rather than a print, screen or mask. Scorers are plugged
//! in at configuration time; the engine bounds every call with a timeout.

use serde::Serialize;
use thiserror::Error;

use crate::types::Frame;

#[derive(Error, Debug)]
pub enum SpoofError {
    #[error("spoof scorer unavailable: {0}")]
    Unavailable(String),
    #[error("face crop too small for scoring ({width}x{height})")]
    CropTooSmall { width: u32, height: u32 },
    #[error("classifier failed: {0}")]
    Classifier(String),
}

/// Outcome of one scoring attempt, as seen by the fusion engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpoofOutcome {
    Score { value: f32 },
    Unavailable { reason: String },
    Timeout,
}

impl SpoofOutcome {
    /// Normalise a raw scorer result. NaN or out-of-range values are not
    /// trusted as scores.
    pub fn from_result(result: Result<f32, SpoofError>) -> Self {
        match result {
            Ok(value) if value.is_finite() && (0.0..=1.0).contains(&value) => {
                SpoofOutcome::Score { value }
            }
            Ok(value) => SpoofOutcome::Unavailable {
                reason: format!("score out of range: {value}"),
            },
            Err(e) => SpoofOutcome::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    pub fn score(&self) -> Option<f32> {
        match self {
            SpoofOutcome::Score { value } => Some(*value),
            _ => None,
        }
    }
}

pub trait SpoofScorer: Send + Sync {
    /// Liveness probability in `[0, 1]` for a cropped face.
    fn score(&self, face: &Frame) -> Result<f32, SpoofError>;
}

/// A learned live/spoof classifier. Loaded once at startup and injected.
pub trait LivenessClassifier: Send + Sync {
    fn predict(&self, face: &Frame) -> Result<f32, SpoofError>;
}

/// Local binary pattern texture heuristic.
///
/// Recaptured images (prints, screens) lose fine skin texture. The score is
/// the share of LBP codes in the upper half of the code space, which grows
/// with high-frequency detail.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureScorer;

impl TextureScorer {
    pub fn high_frequency_ratio(face: &Frame) -> Result<f32, SpoofError> {
        if face.width < 3 || face.height < 3 {
            return Err(SpoofError::CropTooSmall {
                width: face.width,
                height: face.height,
            });
        }

        let gray = face.to_gray();
        let w = face.width as usize;
        let h = face.height as usize;
        let at = |x: usize, y: usize| gray[y * w + x];

        let mut histogram = [0u32; 256];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let center = at(x, y);
                let neighbors = [
                    at(x - 1, y - 1),
                    at(x, y - 1),
                    at(x + 1, y - 1),
                    at(x + 1, y),
                    at(x + 1, y + 1),
                    at(x, y + 1),
                    at(x - 1, y + 1),
                    at(x - 1, y),
                ];
                let code = neighbors
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (bit, &n)| if n >= center { acc | (1 << bit) } else { acc });
                histogram[code as usize] += 1;
            }
        }

        // Border pixels keep code 0, as in a zero-initialised LBP image.
        let total = (w * h) as u32;
        let interior: u32 = histogram.iter().sum();
        histogram[0] += total - interior;

        let high: u32 = histogram[128..].iter().sum();
        Ok(high as f32 / total as f32)
    }
}

impl SpoofScorer for TextureScorer {
    fn score(&self, face: &Frame) -> Result<f32, SpoofError> {
        Self::high_frequency_ratio(face)
    }
}

/// Photometric summary of a face crop, reported with every liveness verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityMetrics {
    /// Variance of the 3x3 Laplacian response over interior pixels.
    pub sharpness: f32,
    /// Mean luma.
    pub brightness: f32,
    /// Standard deviation of luma.
    pub contrast: f32,
}

impl QualityMetrics {
    /// `None` for an empty or malformed frame. Crops narrower than 3 pixels
    /// report zero sharpness.
    pub fn measure(face: &Frame) -> Option<Self> {
        if face.is_empty() || !face.is_well_formed() {
            return None;
        }

        let gray = face.to_gray();
        let n = gray.len() as f64;
        let mean = gray.iter().map(|&g| g as f64).sum::<f64>() / n;
        let variance = gray.iter().map(|&g| (g as f64 - mean).powi(2)).sum::<f64>() / n;

        let w = face.width as usize;
        let h = face.height as usize;
        let mut sharpness = 0.0;
        if w >= 3 && h >= 3 {
            let at = |x: usize, y: usize| gray[y * w + x] as f64;
            let mut responses = Vec::with_capacity((w - 2) * (h - 2));
            for y in 1..h - 1 {
                for x in 1..w - 1 {
                    responses.push(
                        at(x, y - 1) + at(x - 1, y) + at(x + 1, y) + at(x, y + 1) - 4.0 * at(x, y),
                    );
                }
            }
            let count = responses.len() as f64;
            let lap_mean = responses.iter().sum::<f64>() / count;
            sharpness = responses.iter().map(|r| (r - lap_mean).powi(2)).sum::<f64>() / count;
        }

        Some(Self {
            sharpness: sharpness as f32,
            brightness: mean as f32,
            contrast: variance.sqrt() as f32,
        })
    }
}

/// Classifier probability blended with the texture heuristic.
pub struct BlendedScorer<C> {
    classifier: C,
    classifier_weight: f32,
}

impl<C: LivenessClassifier> BlendedScorer<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            classifier,
            classifier_weight: 0.7,
        }
    }

    pub fn with_classifier_weight(mut self, weight: f32) -> Self {
        self.classifier_weight = weight.clamp(0.0, 1.0);
        self
    }
}

impl<C: LivenessClassifier> SpoofScorer for BlendedScorer<C> {
    fn score(&self, face: &Frame) -> Result<f32, SpoofError> {
        let prediction = self.classifier.predict(face)?;
        let texture = TextureScorer::high_frequency_ratio(face)?;
        let combined =
            prediction * self.classifier_weight + texture * (1.0 - self.classifier_weight);
        tracing::trace!(prediction, texture, combined, "blended spoof score");
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let v = f(x, y);
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::from_rgb(width, height, data).unwrap()
    }

    struct FixedClassifier(f32);

    impl LivenessClassifier for FixedClassifier {
        fn predict(&self, _face: &Frame) -> Result<f32, SpoofError> {
            Ok(self.0)
        }
    }

    struct BrokenClassifier;

    impl LivenessClassifier for BrokenClassifier {
        fn predict(&self, _face: &Frame) -> Result<f32, SpoofError> {
            Err(SpoofError::Classifier("model not loaded".into()))
        }
    }

    #[test]
    fn test_flat_image_scores_high_fraction() {
        // Every neighbor equals the center, so every interior code is 0xFF.
        let face = gray_frame(10, 10, |_, _| 128);
        let ratio = TextureScorer::high_frequency_ratio(&face).unwrap();
        // 8x8 interior of 100 pixels
        assert!((ratio - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_ratio_within_unit_interval() {
        let face = gray_frame(16, 12, |x, y| ((x * 37 + y * 91) % 255) as u8);
        let ratio = TextureScorer.score(&face).unwrap();
        assert!((0.0..=1.0).contains(&ratio));
    }

    #[test]
    fn test_tiny_crop_rejected() {
        let face = gray_frame(2, 2, |_, _| 0);
        assert!(matches!(
            TextureScorer.score(&face),
            Err(SpoofError::CropTooSmall { .. })
        ));
    }

    #[test]
    fn test_quality_of_flat_crop() {
        let q = QualityMetrics::measure(&gray_frame(10, 10, |_, _| 128)).unwrap();
        assert_eq!(q.brightness, 128.0);
        assert_eq!(q.contrast, 0.0);
        assert_eq!(q.sharpness, 0.0);
    }

    #[test]
    fn test_quality_of_checkerboard() {
        let face = gray_frame(10, 10, |x, y| if (x + y) % 2 == 0 { 255 } else { 0 });
        let q = QualityMetrics::measure(&face).unwrap();
        assert!((q.brightness - 127.5).abs() < 1e-3);
        assert!((q.contrast - 127.5).abs() < 1e-3);
        // Interior responses alternate between -1020 and +1020.
        assert!((q.sharpness - 1020.0 * 1020.0).abs() < 1.0);
    }

    #[test]
    fn test_quality_rejects_malformed_frame() {
        let face = Frame {
            width: 4,
            height: 4,
            data: vec![0; 5],
        };
        assert!(QualityMetrics::measure(&face).is_none());
        let thin = QualityMetrics::measure(&gray_frame(2, 5, |_, y| y as u8 * 10)).unwrap();
        assert_eq!(thin.sharpness, 0.0);
        assert!((thin.brightness - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_blended_weights() {
        let face = gray_frame(10, 10, |_, _| 128);
        let scorer = BlendedScorer::new(FixedClassifier(1.0));
        let score = scorer.score(&face).unwrap();
        assert!((score - (0.7 + 0.3 * 0.64)).abs() < 1e-6);
    }

    #[test]
    fn test_blended_propagates_classifier_error() {
        let face = gray_frame(10, 10, |_, _| 128);
        let scorer = BlendedScorer::new(BrokenClassifier);
        assert!(scorer.score(&face).is_err());
    }

    #[test]
    fn test_outcome_rejects_out_of_range() {
        assert_eq!(
            SpoofOutcome::from_result(Ok(0.4)),
            SpoofOutcome::Score { value: 0.4 }
        );
        assert!(matches!(
            SpoofOutcome::from_result(Ok(1.5)),
            SpoofOutcome::Unavailable { .. }
        ));
        assert!(matches!(
            SpoofOutcome::from_result(Ok(f32::NAN)),
            SpoofOutcome::Unavailable { .. }
        ));
        assert!(SpoofOutcome::Timeout.score().is_none());
    }
}
