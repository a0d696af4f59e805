use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conflict::ConflictPolicy;
use crate::error::{EngineError, Result};

/// Unique identifier assigned to a job at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a job does: pull a remote item, or transcode a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Fetch,
    Transcode,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    NoAudio,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped | JobStatus::NoAudio
        )
    }
}

/// Where the media comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Url(String),
    File(PathBuf),
}

impl Source {
    /// Short human-readable form for notifications and logs
    pub fn label(&self) -> String {
        match self {
            Source::Url(url) => url.clone(),
            Source::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// Transcoding parameters. `codec_args` are passed to the engine verbatim;
/// the core does not interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSpec {
    /// Output container extension, without the dot (e.g. "mka", "mp4")
    pub container: String,
    /// Engine arguments for codec selection and tuning
    pub codec_args: Vec<String>,
    /// Drop video streams and keep audio only
    pub audio_only: bool,
    /// Total duration when already known; probed from the source otherwise
    pub duration_secs: Option<f64>,
}

/// Resolved per-job parameters. Owned by the job; written by the consumer
/// only while the job is not running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub source: Source,
    /// Stream selector handed to the acquisition backend, opaque to the core
    pub format_selector: Option<String>,
    pub transcode: Option<TranscodeSpec>,
    /// Overrides the engine-wide conflict policy when set
    pub conflict_policy: Option<ConflictPolicy>,
    /// Output directory; relative or missing values resolve under the
    /// session directory at selection time
    pub output_dir: Option<PathBuf>,
    /// Desired output file name, including extension
    pub output_name: Option<String>,
}

impl JobConfig {
    pub fn for_url(url: impl Into<String>, output_name: impl Into<String>) -> Self {
        JobConfig {
            source: Source::Url(url.into()),
            format_selector: None,
            transcode: None,
            conflict_policy: None,
            output_dir: None,
            output_name: Some(output_name.into()),
        }
    }

    pub fn for_file(path: impl Into<PathBuf>, transcode: TranscodeSpec) -> Self {
        JobConfig {
            source: Source::File(path.into()),
            format_selector: None,
            transcode: Some(transcode),
            conflict_policy: None,
            output_dir: None,
            output_name: None,
        }
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    result_path: Option<PathBuf>,
    message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// One schedulable unit of work. Shared as `Arc<Job>`: the worker is the
/// only writer of status/result, the consumer reads freely, and a handle
/// retained across removal still observes the status written afterwards.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    kind: JobKind,
    created_at: DateTime<Utc>,
    config: Mutex<JobConfig>,
    state: Mutex<JobState>,
}

impl Job {
    /// Validate the configuration against the job kind and create the job
    pub fn new(kind: JobKind, config: JobConfig) -> Result<Job> {
        match kind {
            JobKind::Fetch => {
                if !matches!(config.source, Source::Url(_)) {
                    return Err(EngineError::Configuration(
                        "fetch job requires a URL source".to_string(),
                    ));
                }
                if config.output_name.is_none() {
                    return Err(EngineError::Configuration(
                        "fetch job requires an output name".to_string(),
                    ));
                }
            }
            JobKind::Transcode => {
                if !matches!(config.source, Source::File(_)) {
                    return Err(EngineError::Configuration(
                        "transcode job requires a file source".to_string(),
                    ));
                }
                if config.transcode.is_none() {
                    return Err(EngineError::Configuration(
                        "transcode job requires transcode parameters".to_string(),
                    ));
                }
            }
        }

        Ok(Job {
            id: JobId::new(),
            kind,
            created_at: Utc::now(),
            config: Mutex::new(config),
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                result_path: None,
                message: None,
                started_at: None,
                finished_at: None,
            }),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().unwrap().status
    }

    /// Final on-disk path; set only on `Completed`/`Skipped`
    pub fn result_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().result_path.clone()
    }

    /// Last status message (failure reason, skip reason)
    pub fn message(&self) -> Option<String> {
        self.state.lock().unwrap().message.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().finished_at
    }

    /// Snapshot of the configuration (the worker copies it at selection time)
    pub fn config(&self) -> JobConfig {
        self.config.lock().unwrap().clone()
    }

    /// Mutate the configuration. Rejected while the job is running: the
    /// worker owns a running job and config writes would race its snapshot.
    pub fn update_config(&self, f: impl FnOnce(&mut JobConfig)) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.status == JobStatus::Running {
            return Err(EngineError::Configuration(format!(
                "job {} is running; configuration is read-only until it finishes",
                self.id
            )));
        }
        f(&mut self.config.lock().unwrap());
        Ok(())
    }

    /// Short human-readable form for notifications
    pub fn label(&self) -> String {
        let config = self.config.lock().unwrap();
        config
            .output_name
            .clone()
            .unwrap_or_else(|| config.source.label())
    }

    /// Atomically claim a pending job for execution. Called with the
    /// collection lock held, so no other selection can observe it pending.
    pub(crate) fn try_claim(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != JobStatus::Pending {
            return false;
        }
        state.status = JobStatus::Running;
        state.started_at = Some(Utc::now());
        state.result_path = None;
        state.message = None;
        state.finished_at = None;
        true
    }

    pub(crate) fn transition(
        &self,
        status: JobStatus,
        result_path: Option<PathBuf>,
        message: Option<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.result_path = result_path;
        state.message = message;
        if status.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
    }

    /// Return a terminal job to `Pending`; no-op for pending/running jobs
    pub(crate) fn reset(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.status.is_terminal() {
            return false;
        }
        state.status = JobStatus::Pending;
        state.result_path = None;
        state.message = None;
        state.started_at = None;
        state.finished_at = None;
        true
    }
}
