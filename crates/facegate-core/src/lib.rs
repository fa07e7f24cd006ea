//! facegate-core: burst liveness and identity decisions for face verification.
//!
//! Descriptors come from SCRFD detection and ArcFace recognition running on
//! ONNX Runtime. Everything above extraction (distance, classification,
//! liveness, and the verdict pipeline) is plain Rust with no model dependency.

pub mod alignment;
pub mod classifier;
pub mod detector;
pub mod extractor;
pub mod liveness;
pub mod models;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use classifier::{Classifier, ComparisonSession};
pub use extractor::{DescriptorExtractor, ExtractorError, OnnxExtractor};
pub use liveness::LivenessResult;
pub use models::default_model_dir;
pub use pipeline::{
    BurstReport, MatchPolicy, PipelineError, ReferenceError, ReferenceSource, Verifier,
};
pub use types::{BoundingBox, Descriptor, Frame, MatchVerdict, BURST_SIZE};
