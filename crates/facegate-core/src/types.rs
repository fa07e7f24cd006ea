use serde::{Deserialize, Serialize};

/// Number of frames in a verification burst. Part of the wire protocol.
pub const BURST_SIZE: usize = 5;

/// Face descriptor vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors of the same length.
    ///
    /// Mixing descriptors from different models is a caller bug, so the
    /// length check is a debug assertion rather than an error.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        debug_assert_eq!(
            self.values.len(),
            other.values.len(),
            "descriptor length mismatch"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Integer face rectangle in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl BoundingBox {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Distance in pixels between the minimum corners of two boxes.
    pub fn corner_distance(&self, other: &BoundingBox) -> f32 {
        let dx = (other.min_x - self.min_x) as f32;
        let dy = (other.min_y - self.min_y) as f32;
        (dx * dx + dy * dy).sqrt()
    }
}

/// One extracted face from a burst: its descriptor and where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub descriptor: Descriptor,
    pub bbox: BoundingBox,
}

/// Outcome of a burst verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchVerdict {
    Accepted,
    RejectedIdentityMismatch,
    RejectedNotLive,
    RejectedNoMatch,
    FailedNoFace,
}

impl MatchVerdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, MatchVerdict::Accepted)
    }

    /// True for the three biometric rejections, which callers must not
    /// distinguish from one another.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            MatchVerdict::RejectedIdentityMismatch
                | MatchVerdict::RejectedNotLive
                | MatchVerdict::RejectedNoMatch
        )
    }
}
