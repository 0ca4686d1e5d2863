//! Collaborators the core consumes but does not implement.

use thiserror::Error;

use crate::types::{BoundingBox, FeatureVector, Frame, LandmarkSet};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("landmark provider unavailable: {0}")]
    Unavailable(String),
    #[error("landmark detection failed: {0}")]
    Detection(String),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face found in region")]
    NoFace,
    #[error("feature extraction failed: {0}")]
    Failed(String),
}

/// A face located in a frame.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: BoundingBox,
    /// `None` when the detector found the face but could not fit landmarks.
    pub landmarks: Option<LandmarkSet>,
}

pub trait LandmarkProvider: Send + Sync {
    fn locate_faces(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ProviderError>;
}

pub trait FeatureExtractor: Send + Sync {
    /// Embedding of a cropped face region.
    fn embed(&self, face: &Frame) -> Result<FeatureVector, ExtractError>;
}

/// The largest face by region area, which is assumed to be nearest the camera.
pub fn largest_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces.into_iter().max_by(|a, b| {
        a.region
            .area()
            .partial_cmp(&b.region.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(width: f32, height: f32) -> DetectedFace {
        DetectedFace {
            region: BoundingBox {
                x: 0.0,
                y: 0.0,
                width,
                height,
            },
            landmarks: None,
        }
    }

    #[test]
    fn test_largest_face_selected() {
        let picked = largest_face(vec![face(10.0, 10.0), face(40.0, 30.0), face(20.0, 20.0)]);
        assert_eq!(picked.unwrap().region.width, 40.0);
    }

    #[test]
    fn test_no_faces() {
        assert!(largest_face(Vec::new()).is_none());
    }
}
