use std::path::Path;

use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::{EngineError, Result};

/// Parsed ffprobe output for one media file
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    pub format: ProbeFormat,
}

/// Format-level metadata
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub channels: Option<i32>,
    pub sample_rate: Option<String>,
    pub duration: Option<String>,
}

impl ProbeData {
    pub fn has_audio(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio"))
    }

    /// Total duration in seconds, preferring the container-level value and
    /// falling back to the longest stream
    pub fn duration_secs(&self) -> Option<f64> {
        if let Some(secs) = self.format.duration.as_deref().and_then(parse_secs) {
            return Some(secs);
        }
        self.streams
            .iter()
            .filter_map(|s| s.duration.as_deref().and_then(parse_secs))
            .fold(None, |best, secs| match best {
                Some(b) if b >= secs => Some(b),
                _ => Some(secs),
            })
    }
}

fn parse_secs(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|d| *d > 0.0)
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<ProbeData> {
    if !file_path.exists() {
        return Err(EngineError::Execution(format!(
            "file does not exist: {}",
            file_path.display()
        )));
    }

    debug!("probing {}", file_path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .await
        .map_err(|e| {
            EngineError::Execution(format!(
                "failed to execute ffprobe at {}: {}",
                ffprobe_bin.display(),
                e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(EngineError::Execution(format!(
            "ffprobe failed (exit code {}) for {}: {}",
            exit_code,
            file_path.display(),
            stderr.trim()
        )));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    let data: ProbeData = serde_json::from_str(&json_str).map_err(|e| {
        EngineError::Execution(format!(
            "failed to parse ffprobe output for {}: {}",
            file_path.display(),
            e
        ))
    })?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ProbeData {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_duration_prefers_format_value() {
        let data = parse(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "audio", "codec_name": "aac", "duration": "120.5"}
                ],
                "format": {"format_name": "mov,mp4", "duration": "123.456"}
            }"#,
        );
        assert!(data.has_audio());
        assert_eq!(data.duration_secs(), Some(123.456));
    }

    #[test]
    fn test_duration_falls_back_to_longest_stream() {
        let data = parse(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "video", "codec_name": "h264", "duration": "90.0"},
                    {"index": 1, "codec_type": "audio", "codec_name": "aac", "duration": "120.5"}
                ],
                "format": {"format_name": "matroska,webm"}
            }"#,
        );
        assert_eq!(data.duration_secs(), Some(120.5));
    }

    #[test]
    fn test_video_only_source_has_no_audio() {
        let data = parse(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "video", "codec_name": "vp9"}
                ],
                "format": {"format_name": "webm", "duration": "not a number"}
            }"#,
        );
        assert!(!data.has_audio());
        assert_eq!(data.duration_secs(), None);
    }
}
