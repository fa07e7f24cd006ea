//! Threshold classifier with one-shot, borrow-scoped sample sessions.
//!
//! The classifier holds mutable sample state, so every comparison goes
//! through a [`ComparisonSession`]: it takes `&mut Classifier`, installs the
//! sample set, and clears it again on drop. Two comparisons can never
//! interleave on the same instance, and no sample outlives the comparison
//! that installed it.

use crate::types::Descriptor;

/// Nearest-sample classifier with a fixed maximum distance.
#[derive(Debug)]
pub struct Classifier {
    threshold: f32,
    samples: Vec<Descriptor>,
}

impl Classifier {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            samples: Vec::new(),
        }
    }

    /// Number of samples currently installed. Zero outside a session.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Open a session with a single sample (index 0).
    pub fn session(&mut self, sample: &Descriptor) -> ComparisonSession<'_> {
        self.session_with(std::slice::from_ref(sample))
    }

    /// Open a session with an arbitrary sample set; indices follow slice order.
    pub fn session_with(&mut self, samples: &[Descriptor]) -> ComparisonSession<'_> {
        self.samples.clear();
        self.samples.extend_from_slice(samples);
        ComparisonSession { classifier: self }
    }
}

/// Exclusive access to a [`Classifier`] with a sample set installed.
pub struct ComparisonSession<'a> {
    classifier: &'a mut Classifier,
}

impl ComparisonSession<'_> {
    /// Index of the closest sample within the threshold, or `None` for an
    /// unknown face. A distance equal to the threshold still matches.
    pub fn classify(&self, candidate: &Descriptor) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, sample) in self.classifier.samples.iter().enumerate() {
            let dist = sample.distance(candidate);
            if dist <= self.classifier.threshold && best.map_or(true, |(_, d)| dist < d) {
                best = Some((i, dist));
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn matches(&self, candidate: &Descriptor) -> bool {
        self.classify(candidate).is_some()
    }
}

impl Drop for ComparisonSession<'_> {
    fn drop(&mut self) {
        self.classifier.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    #[test]
    fn test_match_within_threshold() {
        let mut classifier = Classifier::new(0.12);
        let session = classifier.session(&desc(&[0.0, 0.0]));
        assert_eq!(session.classify(&desc(&[0.1, 0.0])), Some(0));
    }

    #[test]
    fn test_unknown_beyond_threshold() {
        let mut classifier = Classifier::new(0.12);
        let session = classifier.session(&desc(&[0.0, 0.0]));
        assert_eq!(session.classify(&desc(&[0.2, 0.0])), None);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut classifier = Classifier::new(5.0);
        let session = classifier.session(&desc(&[0.0, 0.0]));
        assert!(session.matches(&desc(&[3.0, 4.0])));
    }

    #[test]
    fn test_closest_sample_wins() {
        let mut classifier = Classifier::new(1.0);
        let samples = [desc(&[0.0, 0.0]), desc(&[0.5, 0.0]), desc(&[0.9, 0.0])];
        let session = classifier.session_with(&samples);
        assert_eq!(session.classify(&desc(&[0.6, 0.0])), Some(1));
    }

    #[test]
    fn test_samples_cleared_after_session() {
        let mut classifier = Classifier::new(0.12);
        {
            let session = classifier.session(&desc(&[0.0, 0.0]));
            assert!(session.matches(&desc(&[0.0, 0.0])));
        }
        assert_eq!(classifier.sample_count(), 0);
    }

    #[test]
    fn test_new_session_replaces_samples() {
        let mut classifier = Classifier::new(0.12);
        drop(classifier.session(&desc(&[5.0, 5.0])));
        let session = classifier.session(&desc(&[0.0, 0.0]));
        assert_eq!(session.classify(&desc(&[5.0, 5.0])), None);
        assert_eq!(session.classify(&desc(&[0.0, 0.05])), Some(0));
    }
}
