//! External encoder command builder and runner.
//!
//! Used by the ffmpeg/copy output modes to cut event clips straight from the
//! source file without decoding frames for writing.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ScanError, ScanResult};

/// How often the runner polls the child for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Builder for one ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed before `-i` (seek position, demuxer options).
    input_args: Vec<String>,
    /// Arguments placed after `-i` (codecs, duration, filters).
    output_args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }

    /// Add an argument before `-i`.
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add whitespace-separated arguments before `-i`.
    pub fn input_args(mut self, args: &str) -> Self {
        self.input_args
            .extend(args.split_whitespace().map(str::to_string));
        self
    }

    /// Add an argument after `-i`.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add whitespace-separated arguments after `-i`.
    pub fn output_args(mut self, args: &str) -> Self {
        self.output_args
            .extend(args.split_whitespace().map(str::to_string));
        self
    }

    /// Seek position, placed before the input for fast keyframe seeking.
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    /// Output duration.
    pub fn duration(self, seconds: f64) -> Self {
        self.output_arg("-t").output_arg(format!("{:.3}", seconds))
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Assemble the full argument list. `-y` and `-nostdin` are always
    /// present so an unattended scan can never stall on a prompt.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-nostdin".to_string()];
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().into_owned());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Runs ffmpeg commands with cancellation and an optional timeout.
pub struct FfmpegRunner {
    cancel: Option<Arc<AtomicBool>>,
    timeout: Option<Duration>,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self {
            cancel: None,
            timeout: None,
        }
    }

    /// Kill the child when this flag is raised.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Kill the child if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the command to completion.
    pub fn run(&self, cmd: &FfmpegCommand) -> ScanResult<()> {
        let binary = check_ffmpeg()?;
        let args = cmd.build_args();
        debug!("running: ffmpeg {}", args.join(" "));

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain stderr on a helper thread so a chatty encode cannot fill the
        // pipe and deadlock the poll loop below.
        let stderr = child.stderr.take();
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_string(&mut buf).ok();
            }
            buf
        });

        let status = self.wait(&mut child)?;
        let stderr = stderr_thread.join().unwrap_or_default();

        match status {
            WaitOutcome::Exited(status) if status.success() => Ok(()),
            WaitOutcome::Exited(status) => {
                warn!(code = ?status.code(), "ffmpeg exited with an error");
                Err(ScanError::encoder_failed(
                    "ffmpeg exited with non-zero status",
                    (!stderr.is_empty()).then_some(stderr),
                    status.code(),
                ))
            }
            WaitOutcome::Canceled => Err(ScanError::Canceled),
            WaitOutcome::TimedOut(after) => Err(ScanError::encoder_failed(
                format!("ffmpeg timed out after {:.0} seconds", after.as_secs_f64()),
                (!stderr.is_empty()).then_some(stderr),
                None,
            )),
        }
    }

    fn wait(&self, child: &mut Child) -> ScanResult<WaitOutcome> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(WaitOutcome::Exited(status));
            }
            if let Some(cancel) = &self.cancel {
                if cancel.load(Ordering::Relaxed) {
                    info!("cancel requested, killing ffmpeg");
                    child.kill().ok();
                    child.wait().ok();
                    return Ok(WaitOutcome::Canceled);
                }
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    warn!("ffmpeg exceeded its time limit, killing it");
                    child.kill().ok();
                    child.wait().ok();
                    return Ok(WaitOutcome::TimedOut(timeout));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    Canceled,
    TimedOut(Duration),
}

/// Locate the ffmpeg binary on PATH.
pub fn check_ffmpeg() -> ScanResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| ScanError::EncoderUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_order() {
        let cmd = FfmpegCommand::new("input.mp4", "out.mp4")
            .input_args("-v error")
            .seek(10.5)
            .duration(30.0)
            .output_args("-map 0 -c:v libx264");
        let args = cmd.build_args();
        assert_eq!(args[0], "-y");
        assert_eq!(args[1], "-nostdin");
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        let ss_pos = args.iter().position(|a| a == "-ss").unwrap();
        let t_pos = args.iter().position(|a| a == "-t").unwrap();
        assert!(ss_pos < i_pos, "-ss must precede -i: {:?}", args);
        assert!(t_pos > i_pos, "-t must follow -i: {:?}", args);
        assert_eq!(args[ss_pos + 1], "10.500");
        assert_eq!(args[t_pos + 1], "30.000");
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_arg_strings_split_on_whitespace() {
        let cmd = FfmpegCommand::new("a.mp4", "b.mp4").output_args("-c:v   copy  -c:a copy");
        let args = cmd.build_args();
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
    }
}
