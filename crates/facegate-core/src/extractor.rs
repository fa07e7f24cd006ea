//! Descriptor extraction: encoded image in, at most one face out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Frame;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns one encoded image into a face descriptor and its bounding box.
///
/// Implementations may keep mutable inference state, so callers need
/// exclusive access for the duration of a call.
pub trait DescriptorExtractor {
    /// `Ok(None)` when the image does not contain exactly one face.
    fn extract(&mut self, image: &[u8]) -> Result<Option<Frame>, ExtractorError>;
}

impl<T: DescriptorExtractor + ?Sized> DescriptorExtractor for Box<T> {
    fn extract(&mut self, image: &[u8]) -> Result<Option<Frame>, ExtractorError> {
        (**self).extract(image)
    }
}

/// SCRFD detection followed by ArcFace description.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self { detector, recognizer })
    }

    /// Extract from an already-decoded image.
    pub fn extract_rgb(&mut self, image: &RgbImage) -> Result<Option<Frame>, ExtractorError> {
        let faces = self.detector.detect(image)?;
        let [face] = faces.as_slice() else {
            tracing::debug!(faces = faces.len(), "extract: expected exactly one face");
            return Ok(None);
        };

        let descriptor = self.recognizer.describe(image, face)?;
        Ok(Some(Frame {
            descriptor,
            bbox: face.bounding_box(),
        }))
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Option<Frame>, ExtractorError> {
        let decoded = image::load_from_memory(image)?.to_rgb8();
        self.extract_rgb(&decoded)
    }
}
