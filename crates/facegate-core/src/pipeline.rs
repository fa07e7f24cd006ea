//! Burst verification pipeline.
//!
//! Runs the checks in a fixed order, stopping at the first failure:
//!
//! 1. extract a face from every frame (`FailedNoFace` if any frame has none);
//! 2. every frame must classify as the same identity as frame 0;
//! 3. the burst must pass the liveness bounds;
//! 4. frame 0 must classify as the stored reference.
//!
//! The reference is resolved lazily in step 4, so a remote fetch only
//! happens for bursts that already passed the local checks. A failure to
//! resolve it is a system error, distinct from a biometric `RejectedNoMatch`.

use crate::classifier::Classifier;
use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::liveness::{self, LivenessResult, DEFAULT_MOTION_UPPER_BOUND, DEFAULT_SHIFT_LOWER_BOUND};
use crate::types::{Descriptor, Frame, MatchVerdict, BURST_SIZE};
use thiserror::Error;

/// Default maximum descriptor distance at which two faces are one identity.
///
/// Shared by the consistency check and the reference match.
pub const DEFAULT_IDENTITY_THRESHOLD: f32 = 0.12;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("burst must contain exactly {BURST_SIZE} frames, got {0}")]
    BurstSize(usize),
    #[error("extraction failed on frame {index}: {source}")]
    Extraction {
        index: usize,
        #[source]
        source: ExtractorError,
    },
    #[error("reference descriptor unavailable: {0}")]
    Reference(#[from] ReferenceError),
}

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reference fetch failed: {0}")]
    Fetch(String),
    #[error("no face found in reference image")]
    NoFace,
    #[error("reference extraction failed: {0}")]
    Extraction(#[from] ExtractorError),
    #[error("reference has {reference} dimensions, live descriptor has {live}")]
    DimensionMismatch { reference: usize, live: usize },
}

/// Supplies the stored reference descriptor once the local checks pass.
///
/// The extractor is lent for sources that hold an image rather than a
/// descriptor and must re-extract it.
pub trait ReferenceSource {
    fn resolve(self, extractor: &mut dyn DescriptorExtractor) -> Result<Descriptor, ReferenceError>;
}

impl ReferenceSource for &Descriptor {
    fn resolve(
        self,
        _extractor: &mut dyn DescriptorExtractor,
    ) -> Result<Descriptor, ReferenceError> {
        Ok(self.clone())
    }
}

impl ReferenceSource for Descriptor {
    fn resolve(
        self,
        _extractor: &mut dyn DescriptorExtractor,
    ) -> Result<Descriptor, ReferenceError> {
        Ok(self)
    }
}

/// Decision thresholds. Tuned empirically for the extractor in use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Maximum descriptor distance for two faces to count as one identity.
    pub identity_threshold: f32,
    /// Mean rectangle motion must stay strictly below this (pixels).
    pub motion_upper_bound: f32,
    /// Mean descriptor shift must stay strictly above this.
    pub shift_lower_bound: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            identity_threshold: DEFAULT_IDENTITY_THRESHOLD,
            motion_upper_bound: DEFAULT_MOTION_UPPER_BOUND,
            shift_lower_bound: DEFAULT_SHIFT_LOWER_BOUND,
        }
    }
}

/// Verdict plus the measurements that led to it, for logging.
#[derive(Debug, Clone)]
pub struct BurstReport {
    pub verdict: MatchVerdict,
    /// Present once the burst reached the liveness step.
    pub liveness: Option<LivenessResult>,
    /// Present once the burst reached the reference comparison.
    pub reference_distance: Option<f32>,
}

impl BurstReport {
    fn early(verdict: MatchVerdict) -> Self {
        Self {
            verdict,
            liveness: None,
            reference_distance: None,
        }
    }
}

/// Owns the classifier and applies a [`MatchPolicy`] to bursts.
#[derive(Debug)]
pub struct Verifier {
    policy: MatchPolicy,
    classifier: Classifier,
}

impl Verifier {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            classifier: Classifier::new(policy.identity_threshold),
            policy,
        }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Run the full pipeline on a burst of encoded images.
    pub fn verify_burst<E, B, R>(
        &mut self,
        extractor: &mut E,
        images: &[B],
        reference: R,
    ) -> Result<BurstReport, PipelineError>
    where
        E: DescriptorExtractor,
        B: AsRef<[u8]>,
        R: ReferenceSource,
    {
        // Step 1: extraction
        let Some(frames) = extract_burst(extractor, images)? else {
            return Ok(BurstReport::early(MatchVerdict::FailedNoFace));
        };

        // Step 2: self-consistency
        if !self.is_same_person(&frames) {
            tracing::debug!("burst: frames do not share one identity");
            return Ok(BurstReport::early(MatchVerdict::RejectedIdentityMismatch));
        }

        // Step 3: liveness
        let live = liveness::estimate(
            &frames,
            self.policy.motion_upper_bound,
            self.policy.shift_lower_bound,
        );
        tracing::debug!(
            rectangle_motion = live.rectangle_motion,
            descriptor_shift = live.descriptor_shift,
            is_live = live.is_live,
            "burst: liveness estimated"
        );
        if !live.is_live {
            return Ok(BurstReport {
                verdict: MatchVerdict::RejectedNotLive,
                liveness: Some(live),
                reference_distance: None,
            });
        }

        // Step 4: stored reference
        let live_descriptor = &frames[0].descriptor;
        let reference = reference.resolve(extractor)?;
        if reference.len() != live_descriptor.len() {
            return Err(ReferenceError::DimensionMismatch {
                reference: reference.len(),
                live: live_descriptor.len(),
            }
            .into());
        }

        let session = self.classifier.session(&reference);
        let verdict = if session.matches(live_descriptor) {
            MatchVerdict::Accepted
        } else {
            MatchVerdict::RejectedNoMatch
        };

        Ok(BurstReport {
            verdict,
            liveness: Some(live),
            reference_distance: Some(reference.distance(live_descriptor)),
        })
    }

    /// Whether every frame classifies as the identity of frame 0.
    ///
    /// Stops at the first frame that does not.
    pub fn is_same_person(&mut self, frames: &[Frame]) -> bool {
        let Some((anchor, rest)) = frames.split_first() else {
            return false;
        };
        let session = self.classifier.session(&anchor.descriptor);
        rest.iter().all(|frame| session.matches(&frame.descriptor))
    }
}

/// Extract one face per image, in order.
///
/// Returns `Ok(None)` as soon as any image has no single face or cannot be
/// decoded; later images are not processed. Inference failures are errors.
/// A burst that is not exactly [`BURST_SIZE`] long is rejected before any
/// extraction.
pub fn extract_burst<E, B>(
    extractor: &mut E,
    images: &[B],
) -> Result<Option<Vec<Frame>>, PipelineError>
where
    E: DescriptorExtractor,
    B: AsRef<[u8]>,
{
    if images.len() != BURST_SIZE {
        return Err(PipelineError::BurstSize(images.len()));
    }

    let mut frames = Vec::with_capacity(BURST_SIZE);
    for (index, image) in images.iter().enumerate() {
        let detected = match extractor.extract(image.as_ref()) {
            Ok(detected) => detected,
            Err(ExtractorError::Decode(err)) => {
                tracing::debug!(
                    frame = index,
                    error = %err,
                    "burst: frame is not a readable image"
                );
                None
            }
            Err(source) => return Err(PipelineError::Extraction { index, source }),
        };
        match detected {
            Some(frame) => frames.push(frame),
            None => {
                tracing::debug!(frame = index, "burst: no face found");
                return Ok(None);
            }
        }
    }
    Ok(Some(frames))
}
