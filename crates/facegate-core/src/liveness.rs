//! Passive liveness estimation from frame-to-frame drift across a burst.
//!
//! A live subject's face wanders a few pixels between frames and its
//! descriptor drifts slightly with expression and head pose. A replayed
//! still image produces near-zero descriptor drift; an erratic replay or a
//! glitching video produces large jumps in face position.
//!
//! Two statistics are computed over consecutive frame pairs:
//!
//! - **rectangle motion**: mean distance between bounding-box minimum corners;
//! - **descriptor shift**: mean descriptor distance.
//!
//! The subject is considered live only if motion stays *below* an upper
//! bound and shift stays *above* a lower bound. The two bounds are applied
//! as a conjunction so each can be tuned and audited on its own.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and static screens held before the camera,
//!   bursts spliced from unrelated clips.
//! - **Does not block:** Smooth video replays of the enrolled subject, masks.

use crate::types::Frame;

/// Default upper bound on mean rectangle motion, in pixels.
pub const DEFAULT_MOTION_UPPER_BOUND: f32 = 10.0;

/// Default lower bound on mean descriptor shift.
pub const DEFAULT_SHIFT_LOWER_BOUND: f32 = 0.07;

/// Result of a burst liveness estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessResult {
    /// Whether both bounds were satisfied.
    pub is_live: bool,
    /// Mean minimum-corner displacement across consecutive frame pairs.
    pub rectangle_motion: f32,
    /// Mean descriptor distance across consecutive frame pairs.
    pub descriptor_shift: f32,
    /// Number of frame pairs analysed.
    pub frame_pairs_analysed: usize,
}

/// Mean minimum-corner displacement between consecutive frames.
///
/// Returns `None` for fewer than two frames.
pub fn rectangle_motion(frames: &[Frame]) -> Option<f32> {
    mean_over_pairs(frames, |prev, curr| prev.bbox.corner_distance(&curr.bbox))
}

/// Mean descriptor distance between consecutive frames.
///
/// Returns `None` for fewer than two frames.
pub fn descriptor_shift(frames: &[Frame]) -> Option<f32> {
    mean_over_pairs(frames, |prev, curr| prev.descriptor.distance(&curr.descriptor))
}

fn mean_over_pairs(frames: &[Frame], metric: impl Fn(&Frame, &Frame) -> f32) -> Option<f32> {
    if frames.len() < 2 {
        return None;
    }
    let total: f32 = frames.windows(2).map(|pair| metric(&pair[0], &pair[1])).sum();
    Some(total / (frames.len() - 1) as f32)
}

/// Estimate liveness for a burst against the given bounds.
///
/// Fewer than two frames cannot show drift and are reported as not live.
pub fn estimate(
    frames: &[Frame],
    motion_upper_bound: f32,
    shift_lower_bound: f32,
) -> LivenessResult {
    let (Some(motion), Some(shift)) = (rectangle_motion(frames), descriptor_shift(frames)) else {
        return LivenessResult {
            is_live: false,
            rectangle_motion: 0.0,
            descriptor_shift: 0.0,
            frame_pairs_analysed: 0,
        };
    };

    LivenessResult {
        is_live: motion < motion_upper_bound && shift > shift_lower_bound,
        rectangle_motion: motion,
        descriptor_shift: shift,
        frame_pairs_analysed: frames.len() - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Descriptor};

    /// Frame with a box at (x, y) and a 2-D descriptor.
    fn frame(x: i32, y: i32, d: [f32; 2]) -> Frame {
        Frame {
            descriptor: Descriptor::new(d.to_vec()),
            bbox: BoundingBox::new(x, y, x + 100, y + 100),
        }
    }

    fn estimate_default(frames: &[Frame]) -> LivenessResult {
        estimate(frames, DEFAULT_MOTION_UPPER_BOUND, DEFAULT_SHIFT_LOWER_BOUND)
    }

    #[test]
    fn test_static_burst_not_live() {
        let frames = vec![frame(50, 50, [0.3, 0.3]); 5];
        let result = estimate_default(&frames);
        assert!(!result.is_live);
        assert_eq!(result.rectangle_motion, 0.0);
        assert_eq!(result.descriptor_shift, 0.0);
        assert_eq!(result.frame_pairs_analysed, 4);
    }

    #[test]
    fn test_natural_drift_is_live() {
        // +1 px per frame, descriptor alternating 0.08 apart
        let frames: Vec<Frame> = (0..5)
            .map(|i| {
                let d = if i % 2 == 0 { [0.0, 0.0] } else { [0.08, 0.0] };
                frame(50 + i, 50, d)
            })
            .collect();
        let result = estimate_default(&frames);
        assert!(result.is_live);
        assert!((result.rectangle_motion - 1.0).abs() < 1e-6);
        assert!((result.descriptor_shift - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_excessive_motion_not_live() {
        let frames: Vec<Frame> = (0..5)
            .map(|i| {
                let d = if i % 2 == 0 { [0.0, 0.0] } else { [0.1, 0.0] };
                frame(50 + i * 30, 50, d)
            })
            .collect();
        let result = estimate_default(&frames);
        assert!(!result.is_live);
        assert!(result.rectangle_motion >= DEFAULT_MOTION_UPPER_BOUND);
    }

    #[test]
    fn test_motion_bound_is_exclusive() {
        // 6-8-10 triangle: every pair moves exactly 10 px
        let frames = vec![
            frame(0, 0, [0.0, 0.0]),
            frame(6, 8, [0.1, 0.0]),
            frame(12, 16, [0.0, 0.0]),
        ];
        let result = estimate_default(&frames);
        assert_eq!(result.rectangle_motion, 10.0);
        assert!(!result.is_live);
    }

    #[test]
    fn test_mean_across_pairs() {
        // Pair 1 moves 4 px, pair 2 moves 0 px → mean 2 px
        let frames = vec![
            frame(0, 0, [0.0, 0.0]),
            frame(0, 4, [0.0, 0.0]),
            frame(0, 4, [0.0, 0.0]),
        ];
        assert_eq!(rectangle_motion(&frames), Some(2.0));
        assert_eq!(descriptor_shift(&frames), Some(0.0));
    }

    #[test]
    fn test_single_frame_has_no_statistics() {
        let frames = vec![frame(0, 0, [0.0, 0.0])];
        assert_eq!(rectangle_motion(&frames), None);
        assert_eq!(descriptor_shift(&frames), None);
        let result = estimate_default(&frames);
        assert!(!result.is_live);
        assert_eq!(result.frame_pairs_analysed, 0);
    }

    #[test]
    fn test_custom_bounds() {
        let frames = vec![frame(0, 0, [0.0, 0.0]), frame(1, 0, [0.02, 0.0])];
        assert!(!estimate_default(&frames).is_live);
        assert!(estimate(&frames, 5.0, 0.01).is_live);
    }
}
