//! Scan configuration records and the `key = value` config file loader.
//!
//! Defaults follow the detection parameters documented in the user guide;
//! every recognized key can also be overridden from the command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mscan_models::{Polygon, Rgb, TimeValue};

use crate::error::{ScanError, ScanResult};

/// Default arguments passed to ffmpeg before `-i` in external-encoder mode.
pub const DEFAULT_FFMPEG_INPUT_ARGS: &str = "-v error";
/// Default encoding arguments passed to ffmpeg after `-i`.
pub const DEFAULT_FFMPEG_OUTPUT_ARGS: &str =
    "-map 0 -c:v libx264 -preset fast -crf 21 -c:a aac";
/// Stream-copy arguments used by copy mode.
pub const COPY_FFMPEG_OUTPUT_ARGS: &str = "-map 0 -c:v copy -c:a copy";

/// Background subtraction algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorKind {
    /// Gaussian-mixture model.
    Mog2,
    /// Counting-based subtractor.
    Cnt,
    /// GPU MOG2 variant. Not available in this build; rejected at startup.
    Mog2Gpu,
}

impl FromStr for DetectorKind {
    type Err = ScanError;

    fn from_str(input: &str) -> ScanResult<Self> {
        match input.to_ascii_uppercase().as_str() {
            "MOG2" => Ok(Self::Mog2),
            "CNT" => Ok(Self::Cnt),
            "MOG2_CUDA" | "MOG2_GPU" => Ok(Self::Mog2Gpu),
            other => Err(ScanError::config(format!(
                "unknown background subtractor: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mog2 => write!(f, "MOG2"),
            Self::Cnt => write!(f, "CNT"),
            Self::Mog2Gpu => write!(f, "MOG2_CUDA"),
        }
    }
}

/// Morphological kernel size: `-1` auto, `0` off, or an odd size >= 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelSize {
    Auto,
    Off,
    Size(u32),
}

impl FromStr for KernelSize {
    type Err = ScanError;

    fn from_str(input: &str) -> ScanResult<Self> {
        match input.trim() {
            "-1" | "auto" => Ok(Self::Auto),
            "0" => Ok(Self::Off),
            other => {
                let size: u32 = other.parse().map_err(|_| {
                    ScanError::config(format!("invalid kernel size: {}", other))
                })?;
                if size < 3 || size % 2 == 0 {
                    return Err(ScanError::config(format!(
                        "kernel size must be an odd integer >= 3, 0 to disable, or -1 for auto \
                         (got {})",
                        size
                    )));
                }
                Ok(Self::Size(size))
            }
        }
    }
}

/// Motion detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    /// Minimum score (0-255 scale) for a frame to count as motion.
    pub threshold: f32,
    /// Scores above this are treated as noise (e.g. global lighting changes).
    pub max_threshold: f32,
    /// MOG2 Mahalanobis distance threshold.
    pub variance_threshold: f64,
    /// -1 automatic, 0 frozen model, 1 full reset per frame.
    pub learning_rate: f64,
    pub kernel_size: KernelSize,
    /// Integer subsampling factor; 0 selects automatically by resolution.
    pub downscale_factor: u32,
    /// Decode-side frame skip: process every `frame_skip + 1`-th frame.
    pub frame_skip: u32,
    /// Reject frames whose bounding box covers more than this frame fraction.
    pub max_area: f32,
    pub max_width: f32,
    pub max_height: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Mog2,
            threshold: 0.15,
            max_threshold: 255.0,
            variance_threshold: 16.0,
            learning_rate: -1.0,
            kernel_size: KernelSize::Auto,
            downscale_factor: 0,
            frame_skip: 0,
            max_area: 1.0,
            max_width: 1.0,
            max_height: 1.0,
        }
    }
}

/// Event timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub min_event_length: TimeValue,
    pub time_before_event: TimeValue,
    pub time_post_event: TimeValue,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_event_length: TimeValue::Seconds(0.1),
            time_before_event: TimeValue::Seconds(1.5),
            time_post_event: TimeValue::Seconds(2.0),
        }
    }
}

/// Frame overlay parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub time_code: bool,
    pub frame_metrics: bool,
    pub bounding_box: bool,
    pub bounding_box_color: Rgb,
    /// Box edge thickness relative to the longest frame edge.
    pub bounding_box_thickness: f64,
    /// Smoothing time constant for the box position/size.
    pub bounding_box_smooth_time: TimeValue,
    /// Minimum box side length relative to the longest frame edge.
    pub bounding_box_min_size: f64,
    pub text_margin: i32,
    pub text_border: i32,
    pub text_font_scale: f64,
    pub text_font_thickness: i32,
    pub text_font_color: Rgb,
    pub text_bg_color: Rgb,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            time_code: false,
            frame_metrics: false,
            bounding_box: false,
            bounding_box_color: Rgb::RED,
            bounding_box_thickness: 0.0032,
            bounding_box_smooth_time: TimeValue::Seconds(0.1),
            bounding_box_min_size: 0.032,
            text_margin: 4,
            text_border: 4,
            text_font_scale: 1.0,
            text_font_thickness: 2,
            text_font_color: Rgb::WHITE,
            text_bg_color: Rgb::BLACK,
        }
    }
}

/// How event frames are written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Detect events but write no files.
    ScanOnly,
    /// Re-encode event frames with the OpenCV video writer.
    Opencv,
    /// Cut events from the source with an external ffmpeg, re-encoding.
    Ffmpeg,
    /// Cut events from the source with an external ffmpeg, stream-copying.
    Copy,
}

impl FromStr for OutputMode {
    type Err = ScanError;

    fn from_str(input: &str) -> ScanResult<Self> {
        match input.to_ascii_lowercase().as_str() {
            "scan_only" => Ok(Self::ScanOnly),
            "opencv" => Ok(Self::Opencv),
            "ffmpeg" => Ok(Self::Ffmpeg),
            "copy" => Ok(Self::Copy),
            other => Err(ScanError::config(format!("unknown output mode: {}", other))),
        }
    }
}

/// Thumbnail extraction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThumbnailMode {
    /// Save the frame with the highest score of each event.
    Highscore,
}

impl FromStr for ThumbnailMode {
    type Err = ScanError;

    fn from_str(input: &str) -> ScanResult<Self> {
        match input.to_ascii_lowercase().as_str() {
            "highscore" => Ok(Self::Highscore),
            other => Err(ScanError::config(format!(
                "unknown thumbnail mode: {}",
                other
            ))),
        }
    }
}

/// Output sink parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub mode: OutputMode,
    pub output_dir: PathBuf,
    /// Write everything to a single file instead of one clip per event.
    /// Only valid with one input and `OutputMode::Opencv`.
    pub single_output: Option<PathBuf>,
    /// Four-character code for the OpenCV video writer.
    pub opencv_codec: String,
    pub ffmpeg_input_args: String,
    pub ffmpeg_output_args: String,
    /// Side video of the post-morphology motion mask.
    pub mask_output: Option<PathBuf>,
    pub thumbnails: Option<ThumbnailMode>,
    /// Maximum run time for one external encoder invocation.
    pub encoder_timeout: Option<Duration>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Opencv,
            output_dir: PathBuf::new(),
            single_output: None,
            opencv_codec: "XVID".to_string(),
            ffmpeg_input_args: DEFAULT_FFMPEG_INPUT_ARGS.to_string(),
            ffmpeg_output_args: DEFAULT_FFMPEG_OUTPUT_ARGS.to_string(),
            mask_output: None,
            thumbnails: None,
            encoder_timeout: None,
        }
    }
}

/// Complete configuration for one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    pub inputs: Vec<PathBuf>,
    pub regions: Vec<Polygon>,
    /// Start scanning from this position.
    pub start_time: Option<TimeValue>,
    /// Stop scanning at this position.
    pub end_time: Option<TimeValue>,
    /// Scan this long from `start_time`; ignored when `end_time` is set.
    pub duration: Option<TimeValue>,
    /// Take presentation times from the container instead of `index / fps`.
    pub use_pts: bool,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub overlay: OverlayConfig,
    pub output: OutputConfig,
}

/// A parsed `key = value` configuration file.
///
/// Values stay as strings until they are applied so the CLI can also query
/// presentation-only keys (verbosity, quiet-mode, logging).
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    values: BTreeMap<String, String>,
}

/// Every key the loader accepts. Unknown keys are a hard error so typos do
/// not silently scan with defaults.
const RECOGNIZED_KEYS: &[&str] = &[
    "bg-subtractor",
    "bounding-box",
    "bounding-box-color",
    "bounding-box-min-size",
    "bounding-box-smooth-time",
    "bounding-box-thickness",
    "downscale-factor",
    "ffmpeg-input-args",
    "ffmpeg-output-args",
    "frame-metrics",
    "frame-skip",
    "kernel-size",
    "learning-rate",
    "load-region",
    "max-area",
    "max-height",
    "max-log-files",
    "max-threshold",
    "max-width",
    "min-event-length",
    "opencv-codec",
    "output-dir",
    "output-mode",
    "quiet-mode",
    "save-log",
    "text-bg-color",
    "text-border",
    "text-font-color",
    "text-font-scale",
    "text-font-thickness",
    "text-margin",
    "threshold",
    "thumbnails",
    "time-before-event",
    "time-code",
    "time-post-event",
    "use-pts",
    "variance-threshold",
    "verbosity",
];

impl ConfigFile {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> ScanResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse config file contents.
    pub fn parse(contents: &str) -> ScanResult<Self> {
        let mut values = BTreeMap::new();
        for (line_num, raw) in contents.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ScanError::config(format!(
                    "line {}: expected `key = value`, got '{}'",
                    line_num + 1,
                    line
                ))
            })?;
            let key = key.trim().to_ascii_lowercase();
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                return Err(ScanError::config(format!(
                    "line {}: unknown option '{}'",
                    line_num + 1,
                    key
                )));
            }
            values.insert(key, value.trim().to_string());
        }
        Ok(Self { values })
    }

    /// Raw string value of a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Boolean value of a key (`yes`/`no`, `true`/`false`, `1`/`0`).
    pub fn get_bool(&self, key: &str) -> ScanResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "yes" | "true" | "on" | "1" => Ok(Some(true)),
                "no" | "false" | "off" | "0" => Ok(Some(false)),
                other => Err(ScanError::config(format!(
                    "option '{}' must be yes/no, got '{}'",
                    key, other
                ))),
            },
        }
    }

    /// Apply every scan-relevant key onto `config`. Presentation-only keys
    /// (verbosity, quiet-mode, save-log, max-log-files) are left for the CLI.
    pub fn apply_to(&self, config: &mut ScanConfig) -> ScanResult<()> {
        fn parse_num<T: FromStr>(key: &str, value: &str) -> ScanResult<T> {
            value
                .parse()
                .map_err(|_| ScanError::config(format!("invalid value for '{}': {}", key, value)))
        }
        fn parse_time(key: &str, value: &str) -> ScanResult<TimeValue> {
            TimeValue::parse(value)
                .map_err(|e| ScanError::config(format!("invalid value for '{}': {}", key, e)))
        }
        fn parse_color(key: &str, value: &str) -> ScanResult<Rgb> {
            value
                .parse()
                .map_err(|e| ScanError::config(format!("invalid value for '{}': {}", key, e)))
        }

        for (key, value) in &self.values {
            match key.as_str() {
                "bg-subtractor" => config.detector.kind = value.parse()?,
                "threshold" => config.detector.threshold = parse_num(key, value)?,
                "max-threshold" => config.detector.max_threshold = parse_num(key, value)?,
                "variance-threshold" => {
                    config.detector.variance_threshold = parse_num(key, value)?
                }
                "learning-rate" => config.detector.learning_rate = parse_num(key, value)?,
                "kernel-size" => config.detector.kernel_size = value.parse()?,
                "downscale-factor" => config.detector.downscale_factor = parse_num(key, value)?,
                "frame-skip" => config.detector.frame_skip = parse_num(key, value)?,
                "max-area" => config.detector.max_area = parse_num(key, value)?,
                "max-width" => config.detector.max_width = parse_num(key, value)?,
                "max-height" => config.detector.max_height = parse_num(key, value)?,
                "min-event-length" => config.tracker.min_event_length = parse_time(key, value)?,
                "time-before-event" => config.tracker.time_before_event = parse_time(key, value)?,
                "time-post-event" => config.tracker.time_post_event = parse_time(key, value)?,
                "use-pts" => config.use_pts = self.get_bool(key)?.unwrap_or(false),
                "output-dir" => config.output.output_dir = PathBuf::from(value),
                "output-mode" => config.output.mode = value.parse()?,
                "opencv-codec" => {
                    if value.len() != 4 {
                        return Err(ScanError::config(format!(
                            "opencv-codec must be a four character code, got '{}'",
                            value
                        )));
                    }
                    config.output.opencv_codec = value.to_ascii_uppercase();
                }
                "ffmpeg-input-args" => config.output.ffmpeg_input_args = value.clone(),
                "ffmpeg-output-args" => config.output.ffmpeg_output_args = value.clone(),
                "thumbnails" => config.output.thumbnails = Some(value.parse()?),
                "load-region" => {
                    let path = PathBuf::from(value);
                    config.regions.extend(mscan_models::load_regions(&path)?);
                }
                "bounding-box" => {
                    config.overlay.bounding_box = self.get_bool(key)?.unwrap_or(false)
                }
                "bounding-box-color" => {
                    config.overlay.bounding_box_color = parse_color(key, value)?
                }
                "bounding-box-thickness" => {
                    config.overlay.bounding_box_thickness = parse_num(key, value)?
                }
                "bounding-box-smooth-time" => {
                    config.overlay.bounding_box_smooth_time = parse_time(key, value)?
                }
                "bounding-box-min-size" => {
                    config.overlay.bounding_box_min_size = parse_num(key, value)?
                }
                "time-code" => config.overlay.time_code = self.get_bool(key)?.unwrap_or(false),
                "frame-metrics" => {
                    config.overlay.frame_metrics = self.get_bool(key)?.unwrap_or(false)
                }
                "text-margin" => config.overlay.text_margin = parse_num(key, value)?,
                "text-border" => config.overlay.text_border = parse_num(key, value)?,
                "text-font-scale" => config.overlay.text_font_scale = parse_num(key, value)?,
                "text-font-thickness" => {
                    config.overlay.text_font_thickness = parse_num(key, value)?
                }
                "text-font-color" => config.overlay.text_font_color = parse_color(key, value)?,
                "text-bg-color" => config.overlay.text_bg_color = parse_color(key, value)?,
                // Presentation-only keys, consumed by the CLI.
                "verbosity" | "quiet-mode" | "save-log" | "max-log-files" => {}
                _ => unreachable!("key validated at parse time"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.detector.kind, DetectorKind::Mog2);
        assert!((config.detector.threshold - 0.15).abs() < 1e-6);
        assert_eq!(config.detector.kernel_size, KernelSize::Auto);
        assert_eq!(config.output.mode, OutputMode::Opencv);
        assert_eq!(config.output.opencv_codec, "XVID");
        assert_eq!(
            config.tracker.time_before_event,
            TimeValue::Seconds(1.5)
        );
    }

    #[test]
    fn test_parse_and_apply() {
        let file = ConfigFile::parse(
            "# detection\n\
             threshold = 0.5\n\
             bg-subtractor = CNT\n\
             kernel-size = 5   # inline comment\n\
             min-event-length = 2s\n\
             output-mode = ffmpeg\n\
             bounding-box = yes\n\
             bounding-box-color = 0x00FF00\n",
        )
        .unwrap();
        let mut config = ScanConfig::default();
        file.apply_to(&mut config).unwrap();
        assert!((config.detector.threshold - 0.5).abs() < 1e-6);
        assert_eq!(config.detector.kind, DetectorKind::Cnt);
        assert_eq!(config.detector.kernel_size, KernelSize::Size(5));
        assert_eq!(config.tracker.min_event_length, TimeValue::Seconds(2.0));
        assert_eq!(config.output.mode, OutputMode::Ffmpeg);
        assert!(config.overlay.bounding_box);
        assert_eq!(config.overlay.bounding_box_color, Rgb::new(0, 255, 0));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            ConfigFile::parse("no-such-option = 1"),
            Err(ScanError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_malformed_value_rejected() {
        let file = ConfigFile::parse("threshold = banana").unwrap();
        let mut config = ScanConfig::default();
        assert!(matches!(
            file.apply_to(&mut config),
            Err(ScanError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_kernel_size_validation() {
        assert_eq!("auto".parse::<KernelSize>().unwrap(), KernelSize::Auto);
        assert_eq!("-1".parse::<KernelSize>().unwrap(), KernelSize::Auto);
        assert_eq!("0".parse::<KernelSize>().unwrap(), KernelSize::Off);
        assert_eq!("7".parse::<KernelSize>().unwrap(), KernelSize::Size(7));
        assert!("4".parse::<KernelSize>().is_err());
        assert!("1".parse::<KernelSize>().is_err());
    }

    #[test]
    fn test_presentation_keys_accepted() {
        let file = ConfigFile::parse("verbosity = debug\nquiet-mode = yes").unwrap();
        assert_eq!(file.get("verbosity"), Some("debug"));
        assert_eq!(file.get_bool("quiet-mode").unwrap(), Some(true));
        let mut config = ScanConfig::default();
        file.apply_to(&mut config).unwrap();
    }
}
