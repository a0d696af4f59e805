pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod fetch;
pub mod job;
pub mod probe;
pub mod queue;
pub mod signal;
pub mod transcode;

pub use config::EngineConfig;
pub use conflict::{ConflictPolicy, Resolution};
pub use error::{EngineError, Result};
pub use events::{QueueEvent, QueueState};
pub use fetch::{FetchBackend, FetchHook, FetchOutcome, FetchRequest, FetchUpdate};
pub use job::{Job, JobConfig, JobId, JobKind, JobStatus, Source, TranscodeSpec};
pub use queue::QueueManager;
pub use signal::CancelFlag;
