//! Scripted extractor and payload helpers shared by the daemon's tests.

use facegate_core::{BoundingBox, Descriptor, DescriptorExtractor, ExtractorError, Frame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Keys 0..5 form a live burst of one person.
pub const LIVE_BURST_KEYS: [u8; 5] = [0, 1, 2, 3, 4];
/// Same person as the live burst, standing perfectly still.
pub const STATIC_KEY: u8 = 5;
/// Registration image of the live-burst person.
pub const REFERENCE_KEY: u8 = 10;
/// Someone else entirely.
pub const STRANGER_KEY: u8 = 20;
/// An image with no face in it.
pub const NO_FACE_KEY: u8 = 99;
/// JPEG magic over a body that does not decode.
pub const CORRUPT_KEY: u8 = 77;

/// JPEG magic followed by a lookup key.
pub fn jpeg_stub(key: u8) -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, key]
}

fn frame(values: [f32; 2], x: i32) -> Frame {
    Frame {
        descriptor: Descriptor::new(values.to_vec()),
        bbox: BoundingBox::new(x, 40, x + 100, 140),
    }
}

/// Returns the face registered for byte 3 of the image, if any.
pub struct ScriptedExtractor {
    faces: HashMap<u8, Frame>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedExtractor {
    /// Descriptors alternate 0.1 apart (within the 0.12 identity threshold,
    /// above the 0.07 shift bound) while the face drifts 2px per frame.
    pub fn standard() -> Self {
        let mut faces = HashMap::new();
        for (i, key) in LIVE_BURST_KEYS.iter().enumerate() {
            let values = if i % 2 == 0 { [0.0, 0.0] } else { [0.1, 0.0] };
            faces.insert(*key, frame(values, 50 + 2 * i as i32));
        }
        faces.insert(STATIC_KEY, frame([0.0, 0.0], 50));
        faces.insert(REFERENCE_KEY, frame([0.05, 0.0], 60));
        faces.insert(STRANGER_KEY, frame([1.0, 1.0], 50));
        Self {
            faces,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the extractor moves to the engine.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DescriptorExtractor for ScriptedExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Option<Frame>, ExtractorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.get(3) == Some(&CORRUPT_KEY) {
            let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated jpeg");
            return Err(ExtractorError::Decode(image::ImageError::IoError(err)));
        }
        Ok(image.get(3).and_then(|key| self.faces.get(key).cloned()))
    }
}

/// A live burst of the reference person.
pub fn live_burst() -> Vec<Vec<u8>> {
    LIVE_BURST_KEYS.iter().map(|k| jpeg_stub(*k)).collect()
}
