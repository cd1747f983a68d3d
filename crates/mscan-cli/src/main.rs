//! mscan command line interface.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mscan_media::config::{ConfigFile, OutputMode, ScanConfig};
use mscan_media::pipeline::{Progress, ScanObserver};
use mscan_media::{MotionScanner, ScanSummary};
use mscan_models::{parse_region, save_regions, TimeValue};

#[derive(Parser, Debug)]
#[command(
    name = "mscan",
    version,
    about = "Find and extract motion events in video files",
    long_about = None
)]
struct Args {
    /// Input video file(s), scanned as one contiguous stream. Patterns with
    /// `*`/`?` are expanded lexically.
    #[arg(short = 'i', long = "input", required = true, num_args = 1.., value_name = "VIDEO")]
    input: Vec<String>,

    /// Configuration file (`key = value` lines).
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for output files.
    #[arg(short = 'd', long = "output-dir", value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Output mode: scan_only, opencv, ffmpeg, or copy.
    #[arg(short = 'm', long = "output-mode", value_name = "MODE")]
    output_mode: Option<String>,

    /// Write all events into this single file (one input only).
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write a side video of the motion mask.
    #[arg(long = "mask-output", alias = "mo", value_name = "FILE")]
    mask_output: Option<PathBuf>,

    /// Only detect events, do not write any files.
    #[arg(long = "scan-only", alias = "so")]
    scan_only: bool,

    /// Start scanning at this time (timecode, seconds, or frames).
    #[arg(long = "start-time", alias = "st", value_name = "TIME")]
    start_time: Option<String>,

    /// Stop scanning at this time.
    #[arg(long = "end-time", alias = "et", value_name = "TIME")]
    end_time: Option<String>,

    /// Scan this long from the start position.
    #[arg(long = "duration", alias = "dt", value_name = "TIME")]
    duration: Option<String>,

    /// Minimum event length.
    #[arg(short = 'l', long = "min-event-length", value_name = "TIME")]
    min_event_length: Option<String>,

    /// Time included before each event.
    #[arg(long = "time-before-event", alias = "tb", value_name = "TIME")]
    time_before_event: Option<String>,

    /// Time included after each event.
    #[arg(long = "time-post-event", alias = "tp", value_name = "TIME")]
    time_post_event: Option<String>,

    /// Detection threshold (0-255 scale).
    #[arg(short = 't', long = "threshold", value_name = "SCORE")]
    threshold: Option<f32>,

    /// Background subtractor: MOG2, CNT, or MOG2_CUDA.
    #[arg(short = 'b', long = "bg-subtractor", value_name = "TYPE")]
    bg_subtractor: Option<String>,

    /// Noise filter kernel size: odd integer >= 3, 0 off, -1 auto.
    #[arg(short = 'k', long = "kernel-size", value_name = "SIZE", allow_hyphen_values = true)]
    kernel_size: Option<String>,

    /// Integer downscale factor (0 = auto).
    #[arg(long = "downscale-factor", alias = "df", value_name = "FACTOR")]
    downscale_factor: Option<u32>,

    /// Process only every (N+1)-th frame.
    #[arg(long = "frame-skip", alias = "fs", value_name = "N")]
    frame_skip: Option<u32>,

    /// Add a detection region: whitespace-separated `x y` pairs.
    #[arg(short = 'a', long = "add-region", value_name = "POINTS")]
    add_region: Vec<String>,

    /// Load detection regions from a file.
    #[arg(short = 'R', long = "load-region", value_name = "FILE")]
    load_region: Option<PathBuf>,

    /// Save the active detection regions to a file.
    #[arg(short = 's', long = "save-region", value_name = "FILE")]
    save_region: Option<PathBuf>,

    /// Draw the motion bounding box on output frames.
    #[arg(long = "bounding-box", alias = "bb")]
    bounding_box: bool,

    /// Draw the frame timecode on output frames.
    #[arg(long = "time-code", alias = "tc")]
    time_code: bool,

    /// Draw frame number and score on output frames.
    #[arg(long = "frame-metrics", alias = "fm")]
    frame_metrics: bool,

    /// Use container presentation timestamps instead of frame counting.
    #[arg(long = "use-pts")]
    use_pts: bool,

    /// Save a thumbnail per event: highscore.
    #[arg(long = "thumbnails", value_name = "MODE")]
    thumbnails: Option<String>,

    /// Suppress all output except the final timecode list.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Log verbosity: debug, info, warning, or error.
    #[arg(short = 'v', long = "verbosity", value_name = "LEVEL")]
    verbosity: Option<String>,

    /// Also write the log to this file.
    #[arg(long = "logfile", value_name = "FILE")]
    logfile: Option<PathBuf>,
}

/// Progress bar observer; indicatif bars are safe to drive from the
/// orchestrator thread.
struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{elapsed_precise}] {bar:40} {pos}/{len} frames ({msg})",
            )
            .unwrap(),
        );
        bar.set_message("0 events");
        Self { bar }
    }
}

impl ScanObserver for ProgressReporter {
    fn on_progress(&self, progress: &Progress) {
        if progress.total_frames > 0 {
            self.bar.set_length(progress.total_frames);
        }
        self.bar.set_position(progress.frames_read);
        self.bar.set_message(format!("{} events", progress.events));
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => {}
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config_file = match &args.config {
        Some(path) => {
            ConfigFile::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => ConfigFile::default(),
    };

    let quiet = args.quiet || config_file.get_bool("quiet-mode")?.unwrap_or(false);
    init_logging(&args, &config_file, quiet)?;

    let config = build_scan_config(&args, &config_file)?;

    if let Some(path) = &args.save_region {
        save_regions(path, &config.regions).context("saving region file")?;
        info!("Saved {} region(s) to {}", config.regions.len(), path.display());
    }

    let mut scanner = MotionScanner::new(config)?;
    let cancel = scanner.cancel_flag();

    let reporter = (!quiet).then(|| Arc::new(ProgressReporter::new(0)));
    if let Some(reporter) = &reporter {
        scanner.add_observer(reporter.clone());
    }

    // Ctrl-C raises the cancel flag; the pipeline drains and finalizes.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        eprintln!("Stopping scan...");
        cancel.store(true, Ordering::Relaxed);
    });

    let summary = tokio::task::spawn_blocking(move || scanner.scan())
        .await
        .context("scan task failed")??;

    if let Some(reporter) = &reporter {
        reporter.bar.finish_and_clear();
    }

    report_results(&summary, quiet);
    Ok(())
}

fn init_logging(args: &Args, config_file: &ConfigFile, quiet: bool) -> Result<()> {
    let level = args
        .verbosity
        .as_deref()
        .or_else(|| config_file.get("verbosity"))
        .unwrap_or(if quiet { "warn" } else { "info" });
    let level = match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warning" | "warn" => "warn",
        "error" => "error",
        other => bail!("unknown verbosity level: {}", other),
    };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_filter(filter());
    match &args.logfile {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(filter());
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
        }
    }
    Ok(())
}

fn build_scan_config(args: &Args, config_file: &ConfigFile) -> Result<ScanConfig> {
    let mut config = ScanConfig::default();
    config_file.apply_to(&mut config)?;

    config.inputs = expand_inputs(&args.input)?;

    let parse_time = |value: &Option<String>, flag: &str| -> Result<Option<TimeValue>> {
        value
            .as_deref()
            .map(|v| TimeValue::parse(v).with_context(|| format!("invalid {} value", flag)))
            .transpose()
    };

    if let Some(value) = parse_time(&args.start_time, "--start-time")? {
        config.start_time = Some(value);
    }
    if let Some(value) = parse_time(&args.end_time, "--end-time")? {
        config.end_time = Some(value);
    }
    if let Some(value) = parse_time(&args.duration, "--duration")? {
        config.duration = Some(value);
    }
    if let Some(value) = parse_time(&args.min_event_length, "-l")? {
        config.tracker.min_event_length = value;
    }
    if let Some(value) = parse_time(&args.time_before_event, "--time-before-event")? {
        config.tracker.time_before_event = value;
    }
    if let Some(value) = parse_time(&args.time_post_event, "--time-post-event")? {
        config.tracker.time_post_event = value;
    }

    if let Some(threshold) = args.threshold {
        config.detector.threshold = threshold;
    }
    if let Some(kind) = &args.bg_subtractor {
        config.detector.kind = kind.parse()?;
    }
    if let Some(kernel) = &args.kernel_size {
        config.detector.kernel_size = kernel.parse()?;
    }
    if let Some(factor) = args.downscale_factor {
        config.detector.downscale_factor = factor;
    }
    if let Some(skip) = args.frame_skip {
        config.detector.frame_skip = skip;
    }

    if let Some(path) = &args.load_region {
        config
            .regions
            .extend(mscan_models::load_regions(path).context("loading region file")?);
    }
    for region in &args.add_region {
        config
            .regions
            .push(parse_region(region).context("parsing --add-region")?);
    }

    if let Some(dir) = &args.output_dir {
        config.output.output_dir = dir.clone();
    }
    if let Some(mode) = &args.output_mode {
        config.output.mode = mode.parse()?;
    }
    if args.scan_only {
        config.output.mode = OutputMode::ScanOnly;
    }
    if let Some(output) = &args.output {
        // Bare names get the native container extension.
        let output = if output.extension().is_none() {
            output.with_extension("avi")
        } else {
            output.clone()
        };
        config.output.single_output = Some(output);
    }
    if let Some(path) = &args.mask_output {
        config.output.mask_output = Some(path.clone());
    }
    if let Some(mode) = &args.thumbnails {
        config.output.thumbnails = Some(mode.parse()?);
    }

    config.overlay.bounding_box |= args.bounding_box;
    config.overlay.time_code |= args.time_code;
    config.overlay.frame_metrics |= args.frame_metrics;
    config.use_pts |= args.use_pts;

    Ok(config)
}

/// Expand `*`/`?` patterns against the containing directory, lexically
/// sorted. Plain paths pass through untouched.
fn expand_inputs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for pattern in patterns {
        if !pattern.contains('*') && !pattern.contains('?') {
            inputs.push(PathBuf::from(pattern));
            continue;
        }
        let path = Path::new(pattern);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_pattern = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut matches: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("reading directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| wildcard_match(&file_pattern, &n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();
        if matches.is_empty() {
            bail!("input file does not exist: {}", pattern);
        }
        matches.sort();
        inputs.extend(matches);
    }
    Ok(inputs)
}

/// Glob-lite: `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(pat: &[char], name: &[char]) -> bool {
        match (pat.first(), name.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&pat[1..], name) || (!name.is_empty() && inner(pat, &name[1..]))
            }
            (Some('?'), Some(_)) => inner(&pat[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => inner(&pat[1..], &name[1..]),
            _ => false,
        }
    }
    let pat: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    inner(&pat, &name)
}

fn report_results(summary: &ScanSummary, quiet: bool) {
    if summary.canceled {
        info!("Scan interrupted; events detected so far are listed below.");
    }
    if summary.events.is_empty() {
        if !quiet {
            println!("No motion events detected in input.");
        }
        return;
    }

    if !quiet {
        println!("Detected {} motion events in input.", summary.events.len());
        println!("-------------------------------------------------------------");
        println!("|   Event #    |  Start Time  |   Duration   |   End Time   |");
        println!("-------------------------------------------------------------");
        for (i, event) in summary.events.iter().enumerate() {
            println!(
                "|  Event {:4}  |  {}  |  {}  |  {}  |",
                i + 1,
                event.start.format(1),
                event.duration().format(1),
                event.end.format(1),
            );
        }
        println!("-------------------------------------------------------------");
        println!("Comma-separated timecode values:");
    }

    let timecodes: Vec<String> = summary
        .events
        .iter()
        .flat_map(|event| [event.start.format(3), event.end.format(3)])
        .collect();
    println!("{}", timecodes.join(","));

    if !quiet && !summary.outputs.is_empty() {
        println!("Motion events written to disk.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.mp4", "video.mp4"));
        assert!(wildcard_match("cam?.avi", "cam1.avi"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("*.mp4", "video.avi"));
        assert!(!wildcard_match("cam?.avi", "cam12.avi"));
    }

    #[test]
    fn test_cli_parses_typical_invocation() {
        let args = Args::try_parse_from([
            "mscan",
            "-i",
            "video.mp4",
            "-t",
            "0.3",
            "--bb",
            "--scan-only",
            "-l",
            "0.5s",
        ])
        .unwrap();
        assert_eq!(args.input, vec!["video.mp4"]);
        assert_eq!(args.threshold, Some(0.3));
        assert!(args.bounding_box);
        assert!(args.scan_only);
        assert_eq!(args.min_event_length.as_deref(), Some("0.5s"));
    }

    #[test]
    fn test_cli_requires_input() {
        assert!(Args::try_parse_from(["mscan"]).is_err());
    }

    #[test]
    fn test_config_merging_cli_wins() {
        let file = ConfigFile::parse("threshold = 0.9\noutput-mode = ffmpeg").unwrap();
        let args = Args::try_parse_from([
            "mscan",
            "-i",
            "file!_does_not_matter.mp4",
            "-t",
            "0.2",
        ])
        .unwrap();
        let config = build_scan_config(&args, &file).unwrap();
        assert!((config.detector.threshold - 0.2).abs() < 1e-6);
        assert_eq!(config.output.mode, OutputMode::Ffmpeg);
    }
}
