//! Frame-based timecodes.
//!
//! A [`Timecode`] is a frame index paired with the framerate it was measured
//! against. Seconds and `HH:MM:SS.fff` strings are derived views; all
//! arithmetic and comparison happens on the frame index.

use serde::{Deserialize, Serialize};

/// Tolerance used when checking that two timecodes share a framerate.
const FRAMERATE_EPSILON: f64 = 0.001;

/// A position in a fixed-framerate video stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timecode {
    frame: u64,
    fps: f64,
}

impl Timecode {
    /// Create a timecode from a frame index.
    pub fn new(frame: u64, fps: f64) -> Self {
        Self { frame, fps }
    }

    /// Create a timecode from a position in seconds, rounding half away from
    /// zero to the nearest frame.
    pub fn from_seconds(seconds: f64, fps: f64) -> Self {
        Self {
            frame: (seconds * fps).round().max(0.0) as u64,
            fps,
        }
    }

    /// Parse user input: `HH:MM:SS[.fff]`, `<n>s`, or a bare frame count.
    pub fn parse(input: &str, fps: f64) -> Result<Self, TimecodeError> {
        Ok(TimeValue::parse(input)?.to_timecode(fps))
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Position in seconds (`frame / fps`).
    pub fn seconds(&self) -> f64 {
        self.frame as f64 / self.fps
    }

    /// Format as `HH:MM:SS.fff` with the given number of decimal places.
    pub fn format(&self, precision: usize) -> String {
        let mut secs = self.seconds();
        let hrs = (secs / 3600.0) as u64;
        secs -= hrs as f64 * 3600.0;
        let mins = (secs / 60.0) as u64;
        secs -= mins as f64 * 60.0;
        if precision > 0 {
            format!("{:02}:{:02}:{:0width$.precision$}", hrs, mins, secs, width = precision + 3)
        } else {
            format!("{:02}:{:02}:{:02}", hrs, mins, secs.round() as u64)
        }
    }

    pub fn add_frames(&self, frames: u64) -> Self {
        Self::new(self.frame + frames, self.fps)
    }

    pub fn saturating_sub_frames(&self, frames: u64) -> Self {
        Self::new(self.frame.saturating_sub(frames), self.fps)
    }

    /// Signed frame distance `self - other`. Fails if the framerates differ.
    pub fn delta(&self, other: &Timecode) -> Result<i64, TimecodeError> {
        if (self.fps - other.fps).abs() > FRAMERATE_EPSILON {
            return Err(TimecodeError::MixedFramerate {
                lhs: self.fps,
                rhs: other.fps,
            });
        }
        Ok(self.frame as i64 - other.frame as i64)
    }
}

impl PartialEq for Timecode {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame
    }
}

impl Eq for Timecode {}

impl PartialOrd for Timecode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timecode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.frame.cmp(&other.frame)
    }
}

impl std::fmt::Display for Timecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format(3))
    }
}

/// A duration or position written down before the framerate is known.
///
/// Configuration files and command-line flags accept all three timecode
/// forms; the conversion to frames happens once the input video is open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimeValue {
    /// Exact frame count.
    Frames(u64),
    /// Seconds, from `<n>s` or `HH:MM:SS[.fff]` input.
    Seconds(f64),
}

impl TimeValue {
    /// Parse `HH:MM:SS[.fff]`, `<n>s`, or a bare frame count.
    pub fn parse(input: &str) -> Result<Self, TimecodeError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TimecodeError::InvalidFormat(input.to_string()));
        }
        if let Some(secs) = input.strip_suffix('s') {
            let secs: f64 = secs
                .parse()
                .map_err(|_| TimecodeError::InvalidValue("seconds", input.to_string()))?;
            if secs < 0.0 {
                return Err(TimecodeError::InvalidValue("seconds", input.to_string()));
            }
            return Ok(Self::Seconds(secs));
        }
        if input.contains(':') {
            let parts: Vec<&str> = input.split(':').collect();
            if parts.len() != 3 {
                return Err(TimecodeError::InvalidFormat(input.to_string()));
            }
            let hrs: u64 = parts[0]
                .parse()
                .map_err(|_| TimecodeError::InvalidValue("hours", input.to_string()))?;
            let mins: u64 = parts[1]
                .parse()
                .map_err(|_| TimecodeError::InvalidValue("minutes", input.to_string()))?;
            let secs: f64 = parts[2]
                .parse()
                .map_err(|_| TimecodeError::InvalidValue("seconds", input.to_string()))?;
            if mins >= 60 || !(0.0..60.0).contains(&secs) {
                return Err(TimecodeError::InvalidValue("timecode", input.to_string()));
            }
            return Ok(Self::Seconds((hrs * 3600 + mins * 60) as f64 + secs));
        }
        let frames: u64 = input
            .parse()
            .map_err(|_| TimecodeError::InvalidValue("frames", input.to_string()))?;
        Ok(Self::Frames(frames))
    }

    /// Frame count at the given framerate, rounding half away from zero.
    pub fn to_frames(&self, fps: f64) -> u64 {
        match *self {
            Self::Frames(n) => n,
            Self::Seconds(s) => (s * fps).round().max(0.0) as u64,
        }
    }

    pub fn to_timecode(&self, fps: f64) -> Timecode {
        Timecode::new(self.to_frames(fps), fps)
    }

    /// Duration in seconds at the given framerate.
    pub fn to_seconds(&self, fps: f64) -> f64 {
        match *self {
            Self::Frames(n) => n as f64 / fps,
            Self::Seconds(s) => s,
        }
    }
}

impl std::fmt::Display for TimeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Frames(n) => write!(f, "{}", n),
            Self::Seconds(s) => write!(f, "{}s", s),
        }
    }
}

/// Timecode parsing or arithmetic error.
#[derive(Debug, Clone, PartialEq)]
pub enum TimecodeError {
    /// Arithmetic between timecodes with different framerates.
    MixedFramerate { lhs: f64, rhs: f64 },
    /// Invalid numeric value for a component.
    InvalidValue(&'static str, String),
    /// Unrecognized timecode format.
    InvalidFormat(String),
}

impl std::fmt::Display for TimecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MixedFramerate { lhs, rhs } => {
                write!(f, "timecode framerates do not match ({} vs {})", lhs, rhs)
            }
            Self::InvalidValue(component, value) => {
                write!(f, "invalid {} value: {}", component, value)
            }
            Self::InvalidFormat(value) => write!(
                f,
                "invalid time format '{}', use HH:MM:SS[.fff], <n>s, or a frame count",
                value
            ),
        }
    }
}

impl std::error::Error for TimecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames() {
        let tc = Timecode::parse("150", 30.0).unwrap();
        assert_eq!(tc.frame(), 150);
        assert!((tc.seconds() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(Timecode::parse("5s", 30.0).unwrap().frame(), 150);
        assert_eq!(Timecode::parse("0.5s", 30.0).unwrap().frame(), 15);
        assert_eq!(Timecode::parse("1.234s", 30.0).unwrap().frame(), 37);
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(Timecode::parse("00:00:00", 30.0).unwrap().frame(), 0);
        assert_eq!(Timecode::parse("00:01:00", 30.0).unwrap().frame(), 1800);
        assert_eq!(Timecode::parse("01:00:00.5", 30.0).unwrap().frame(), 108015);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Timecode::parse("", 30.0).is_err());
        assert!(Timecode::parse("abc", 30.0).is_err());
        assert!(Timecode::parse("1:2", 30.0).is_err());
        assert!(Timecode::parse("00:61:00", 30.0).is_err());
        assert!(Timecode::parse("-5s", 30.0).is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(Timecode::new(0, 30.0).format(3), "00:00:00.000");
        assert_eq!(Timecode::new(90, 30.0).format(3), "00:00:03.000");
        assert_eq!(Timecode::new(1800, 30.0).format(1), "00:01:00.0");
        assert_eq!(Timecode::new(108000, 30.0).format(0), "01:00:00");
    }

    #[test]
    fn test_round_trip() {
        for frame in [0u64, 1, 14, 15, 29, 30, 100, 1799, 1800, 54321] {
            let tc = Timecode::new(frame, 30.0);
            let parsed = Timecode::parse(&tc.format(3), 30.0).unwrap();
            assert_eq!(parsed, tc, "round trip failed for frame {}", frame);
        }
    }

    #[test]
    fn test_compare_by_frame_index() {
        assert_eq!(Timecode::new(10, 30.0), Timecode::new(10, 25.0));
        assert!(Timecode::new(9, 30.0) < Timecode::new(10, 30.0));
    }

    #[test]
    fn test_delta_requires_matching_framerate() {
        let a = Timecode::new(20, 30.0);
        let b = Timecode::new(5, 30.0);
        assert_eq!(a.delta(&b).unwrap(), 15);
        let c = Timecode::new(5, 25.0);
        assert!(matches!(
            a.delta(&c),
            Err(TimecodeError::MixedFramerate { .. })
        ));
    }

    #[test]
    fn test_time_value_to_frames() {
        assert_eq!(TimeValue::parse("0.5s").unwrap().to_frames(30.0), 15);
        assert_eq!(TimeValue::parse("10").unwrap().to_frames(30.0), 10);
        assert_eq!(TimeValue::parse("00:00:02").unwrap().to_frames(30.0), 60);
    }
}
