use std::sync::Arc;

use rollcall_core::providers::largest_face;
use rollcall_core::{
    BoundingBox, ExtractError, FeatureExtractor, FeatureVector, Frame, LandmarkProvider,
    ProviderError,
};
use thiserror::Error;

/// Margin added around the detected face box before embedding.
pub const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no face detected")]
    NoFace,
    #[error(transparent)]
    Locator(#[from] ProviderError),
    #[error("feature extraction failed: {0}")]
    Extract(String),
    #[error("feature vector contains NaN/Inf")]
    NonFinite,
}

impl From<ExtractError> for EncodeError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NoFace => EncodeError::NoFace,
            ExtractError::Failed(msg) => EncodeError::Extract(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub vector: FeatureVector,
    /// Region the vector was taken from, when a locator picked one.
    pub region: Option<BoundingBox>,
    pub faces_detected: usize,
}

/// Turns a whole frame into one feature vector.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<EncodedFace, EncodeError>;
}

/// Locate faces, keep the largest, crop it and embed the crop.
#[derive(Clone)]
pub struct RegionEncoder {
    locator: Arc<dyn LandmarkProvider>,
    extractor: Arc<dyn FeatureExtractor>,
    margin: f32,
}

impl RegionEncoder {
    pub fn new(locator: Arc<dyn LandmarkProvider>, extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            locator,
            extractor,
            margin: CROP_MARGIN,
        }
    }
}

impl FrameEncoder for RegionEncoder {
    fn encode(&self, frame: &Frame) -> Result<EncodedFace, EncodeError> {
        let faces = self.locator.locate_faces(frame)?;
        let faces_detected = faces.len();
        let face = largest_face(faces).ok_or(EncodeError::NoFace)?;

        let crop = frame.crop(&face.region, self.margin);
        if crop.is_empty() {
            return Err(EncodeError::NoFace);
        }

        let vector = self.extractor.embed(&crop)?;
        if !vector.is_finite() {
            return Err(EncodeError::NonFinite);
        }
        if faces_detected > 1 {
            tracing::debug!(faces = faces_detected, "multiple faces — using largest region");
        }

        Ok(EncodedFace {
            vector,
            region: Some(face.region),
            faces_detected,
        })
    }
}
