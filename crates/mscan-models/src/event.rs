//! Motion event records.

use serde::{Deserialize, Serialize};

use crate::timecode::Timecode;

/// A contiguous interval of frames containing motion.
///
/// `start` is inclusive and `end` exclusive in frame-index terms. Events
/// produced by a scan are non-overlapping and sorted, and
/// `start <= peak_frame < end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub start: Timecode,
    pub end: Timecode,
    /// Highest per-frame motion score observed inside the event.
    pub peak_score: f32,
    /// Frame index at which `peak_score` was observed.
    pub peak_frame: u64,
}

impl MotionEvent {
    /// Event length in frames.
    pub fn num_frames(&self) -> u64 {
        self.end.frame().saturating_sub(self.start.frame())
    }

    /// Event duration as a timecode at the stream framerate.
    pub fn duration(&self) -> Timecode {
        Timecode::new(self.num_frames(), self.start.fps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        let event = MotionEvent {
            start: Timecode::new(85, 30.0),
            end: Timecode::new(164, 30.0),
            peak_score: 42.0,
            peak_frame: 120,
        };
        assert_eq!(event.num_frames(), 79);
        assert_eq!(event.duration(), Timecode::new(79, 30.0));
    }
}
