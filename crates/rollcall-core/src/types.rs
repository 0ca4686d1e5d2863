use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of points in the landmark layout consumed by the blink detector.
pub const LANDMARK_COUNT: usize = 68;

/// Left eye contour indices in the 68-point layout.
pub const LEFT_EYE: std::ops::Range<usize> = 36..42;
/// Right eye contour indices in the 68-point layout.
pub const RIGHT_EYE: std::ops::Range<usize> = 42..48;

#[derive(Error, Debug, PartialEq)]
pub enum LandmarkError {
    #[error("landmark set has {0} points (expected 68)")]
    WrongPointCount(usize),
    #[error("landmark coordinate is NaN/Inf")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Facial landmarks for a single face, in the 68-point layout.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Result<Self, LandmarkError> {
        if points.len() != LANDMARK_COUNT {
            return Err(LandmarkError::WrongPointCount(points.len()));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(LandmarkError::NonFinite);
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.points[LEFT_EYE]
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.points[RIGHT_EYE]
    }
}

/// Axis-aligned face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Packed RGB8 image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    /// Returns `None` if `data` does not hold exactly `width * height * 3` bytes.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `data` holds exactly `width * height * 3` bytes. Frames built
    /// field by field can violate this.
    pub fn is_well_formed(&self) -> bool {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(3))
            .is_some_and(|len| len == self.data.len())
    }

    /// Crop `region` expanded by `margin` (fraction of the region size) on each
    /// side, clamped to the frame bounds. A malformed frame crops to empty.
    pub fn crop(&self, region: &BoundingBox, margin: f32) -> Frame {
        if !self.is_well_formed() {
            return Frame {
                width: 0,
                height: 0,
                data: Vec::new(),
            };
        }

        let mx = region.width * margin;
        let my = region.height * margin;
        let x1 = (region.x - mx).max(0.0).floor() as u32;
        let y1 = (region.y - my).max(0.0).floor() as u32;
        let x2 = ((region.x + region.width + mx).ceil().max(0.0) as u32).min(self.width);
        let y2 = ((region.y + region.height + my).ceil().max(0.0) as u32).min(self.height);

        if x1 >= x2 || y1 >= y2 {
            return Frame {
                width: 0,
                height: 0,
                data: Vec::new(),
            };
        }

        let w = x2 - x1;
        let h = y2 - y1;
        let stride = self.width as usize * 3;
        let mut data = Vec::with_capacity(w as usize * h as usize * 3);
        for row in y1..y2 {
            let start = row as usize * stride + x1 as usize * 3;
            data.extend_from_slice(&self.data[start..start + w as usize * 3]);
        }

        Frame {
            width: w,
            height: h,
            data,
        }
    }

    /// ITU-R BT.601 luma, one byte per pixel.
    pub fn to_gray(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

/// One biometric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Which channel produced a liveness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Blink,
    SpoofScore,
    Fused,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessSignal {
    pub is_live: bool,
    pub confidence: f32,
    pub source: SignalSource,
}

impl LivenessSignal {
    pub fn new(is_live: bool, confidence: f32, source: SignalSource) -> Self {
        Self {
            is_live,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }
}

/// Outcome of a nearest-neighbor identity lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub subject_id: Option<String>,
    pub similarity: f32,
    pub region: Option<BoundingBox>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            subject_id: None,
            similarity,
            region: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Frame::from_rgb(width, height, data).unwrap()
    }

    #[test]
    fn test_landmark_set_requires_68_points() {
        let err = LandmarkSet::new(vec![Point::default(); 5]).unwrap_err();
        assert_eq!(err, LandmarkError::WrongPointCount(5));
        assert!(LandmarkSet::new(vec![Point::default(); LANDMARK_COUNT]).is_ok());
    }

    #[test]
    fn test_landmark_set_rejects_nan() {
        let mut points = vec![Point::default(); LANDMARK_COUNT];
        points[40].y = f32::NAN;
        assert_eq!(LandmarkSet::new(points).unwrap_err(), LandmarkError::NonFinite);
    }

    #[test]
    fn test_from_rgb_checks_length() {
        assert!(Frame::from_rgb(2, 2, vec![0; 11]).is_none());
        assert!(Frame::from_rgb(2, 2, vec![0; 12]).is_some());
    }

    #[test]
    fn test_crop_with_margin_is_clamped() {
        let frame = solid_frame(20, 10);
        let region = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 5.0,
        };
        let crop = frame.crop(&region, 0.1);
        // Left/top margins clamp at 0; right/bottom expand by 1px and 0.5px (ceil → 1).
        assert_eq!(crop.width, 11);
        assert_eq!(crop.height, 6);
        assert_eq!(crop.data.len(), 11 * 6 * 3);
        // First pixel of row 1 is frame pixel (0, 1).
        assert_eq!(&crop.data[11 * 3..11 * 3 + 3], &[0, 1, 0]);
    }

    #[test]
    fn test_malformed_frame_crops_to_empty() {
        let frame = Frame {
            width: 16,
            height: 16,
            data: vec![7; 30],
        };
        assert!(!frame.is_well_formed());
        let region = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 16.0,
            height: 16.0,
        };
        assert!(frame.crop(&region, 0.1).is_empty());
        assert!(solid_frame(3, 2).is_well_formed());
    }

    #[test]
    fn test_crop_outside_frame_is_empty() {
        let frame = solid_frame(4, 4);
        let region = BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 2.0,
            height: 2.0,
        };
        assert!(frame.crop(&region, 0.1).is_empty());
    }

    #[test]
    fn test_bbox_area_ignores_negative_extent() {
        let b = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: -3.0,
            height: 4.0,
        };
        assert_eq!(b.area(), 0.0);
    }

    #[test]
    fn test_signal_confidence_is_clamped() {
        let s = LivenessSignal::new(true, 1.7, SignalSource::Fused);
        assert_eq!(s.confidence, 1.0);
    }
}
