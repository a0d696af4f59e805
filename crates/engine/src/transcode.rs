use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{format_clock, EventSender, ProgressThrottle};
use crate::job::TranscodeSpec;
use crate::signal::CancelFlag;

/// How many trailing stderr lines to keep for failure diagnostics
const STDERR_TAIL_LINES: usize = 30;

/// Wrapper around the external transcoding engine (ffmpeg). Spawns one
/// child per invocation, reads its machine-readable progress stream, and
/// polls liveness and the cancellation signal on a fixed tick.
pub struct TranscodeEngine {
    ffmpeg_bin: PathBuf,
    poll_interval: Duration,
    kill_timeout: Duration,
}

impl TranscodeEngine {
    pub fn new(cfg: &EngineConfig) -> Self {
        TranscodeEngine {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            poll_interval: Duration::from_millis(cfg.tick_ms),
            kill_timeout: Duration::from_secs(cfg.kill_timeout_secs),
        }
    }

    fn build_args(input: &Path, output: &Path, spec: &TranscodeSpec) -> Vec<String> {
        let mut args = Vec::new();
        args.push("-hide_banner".to_string());
        args.push("-y".to_string());
        args.push("-i".to_string());
        args.push(input.to_string_lossy().into_owned());
        if spec.audio_only {
            args.push("-vn".to_string());
        }
        args.extend(spec.codec_args.iter().cloned());
        // key=value progress blocks on stdout, normal stats off
        args.push("-progress".to_string());
        args.push("pipe:1".to_string());
        args.push("-nostats".to_string());
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Run one transcode to completion.
    ///
    /// Progress is forwarded throttled when `total_secs` is known and as
    /// indeterminate elapsed-time updates otherwise. A set cancellation
    /// signal terminates the child and always supersedes the exit-code
    /// check, so a cancelled run can never report success.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        spec: &TranscodeSpec,
        total_secs: Option<f64>,
        events: &EventSender,
        cancel: &CancelFlag,
    ) -> Result<PathBuf> {
        let args = Self::build_args(input, output, spec);
        debug!("spawning {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::Execution(format!(
                    "failed to spawn transcoding engine at {}: {}",
                    self.ffmpeg_bin.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Execution("failed to capture engine stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::Execution("failed to capture engine stderr".to_string())
        })?;

        // Dedicated reader for the progress stream
        let progress_events = events.clone();
        let progress_handle = tokio::spawn(async move {
            let mut throttle = ProgressThrottle::new();
            let mut last_elapsed = f64::MIN;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // out_time_ms carries microseconds despite the name
                let Some(value) = line.strip_prefix("out_time_ms=") else {
                    continue;
                };
                let Ok(micros) = value.trim().parse::<i64>() else {
                    continue;
                };
                let elapsed = (micros as f64 / 1_000_000.0).max(0.0);
                match total_secs {
                    Some(total) if total > 0.0 => {
                        let percent = (elapsed / total * 100.0).clamp(0.0, 100.0);
                        if throttle.admit(percent) {
                            progress_events.progress(
                                Some(percent),
                                format!("{} / {}", format_clock(elapsed), format_clock(total)),
                            );
                        }
                    }
                    _ => {
                        if elapsed - last_elapsed >= 1.0 {
                            last_elapsed = elapsed;
                            progress_events
                                .progress(None, format!("{} processed", format_clock(elapsed)));
                        }
                    }
                }
            }
        });

        // Keep a bounded stderr tail for diagnostics
        let stderr_handle = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        // Poll liveness and the cancellation signal on a fixed tick
        let status = loop {
            if cancel.is_set() {
                return self.terminate(&mut child).await;
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => sleep(self.poll_interval).await,
                Err(e) => {
                    return Err(EngineError::Execution(format!(
                        "failed to poll engine process: {}",
                        e
                    )));
                }
            }
        };

        let stderr_tail = stderr_handle.await.unwrap_or_default();
        let _ = progress_handle.await;

        // A cancellation that raced process exit still wins: the output
        // cannot be trusted even if the engine exited cleanly.
        if cancel.is_set() {
            return Err(EngineError::Cancelled);
        }

        if !status.success() {
            return Err(EngineError::Execution(format!(
                "engine exited with code {} for {}: {}",
                status.code().unwrap_or(-1),
                input.display(),
                stderr_tail.trim()
            )));
        }

        Ok(output.to_path_buf())
    }

    /// Kill the child and wait for it with a bounded timeout
    async fn terminate(&self, child: &mut Child) -> Result<PathBuf> {
        warn!("cancellation requested; terminating engine process");
        if let Err(e) = child.start_kill() {
            // Most likely the process exited in the meantime
            debug!("terminate request failed: {}", e);
        }
        match timeout(self.kill_timeout, child.wait()).await {
            Ok(_) => Err(EngineError::Cancelled),
            Err(_) => Err(EngineError::Execution(format!(
                "engine process did not exit within {}s after termination",
                self.kill_timeout.as_secs()
            ))),
        }
    }
}
