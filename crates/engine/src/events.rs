use humansize::{format_size, DECIMAL};
use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::{JobId, JobStatus};

/// Upper bound on status/failure messages surfaced to the consumer
pub const MAX_MESSAGE_LEN: usize = 300;

/// Queue-level run state surfaced through the notification stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueState {
    Running,
    Paused,
}

/// One notification. The consumer renders these; the core never assumes a
/// particular UI.
#[derive(Debug, Clone, Serialize)]
pub enum QueueEvent {
    /// Per-job lifecycle update
    Job {
        id: JobId,
        status: JobStatus,
        message: String,
        percent: Option<f64>,
    },
    /// Queue started/paused
    Queue { state: QueueState, message: String },
    /// Operation-wide progress for whatever is currently executing
    Progress {
        percent: Option<f64>,
        message: String,
    },
}

/// Sending side of the bounded notification channel. Never blocks: under
/// backpressure events are dropped and the consumer catches up from the
/// next one.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<QueueEvent>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<QueueEvent>) -> Self {
        EventSender { tx }
    }

    pub(crate) fn job(
        &self,
        id: JobId,
        status: JobStatus,
        message: impl Into<String>,
        percent: Option<f64>,
    ) {
        self.send(QueueEvent::Job {
            id,
            status,
            message: message.into(),
            percent,
        });
    }

    pub(crate) fn queue(&self, state: QueueState, message: impl Into<String>) {
        self.send(QueueEvent::Queue {
            state,
            message: message.into(),
        });
    }

    pub(crate) fn progress(&self, percent: Option<f64>, message: impl Into<String>) {
        self.send(QueueEvent::Progress {
            percent,
            message: message.into(),
        });
    }

    fn send(&self, event: QueueEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("dropping queue event: {}", e);
        }
    }
}

/// Percentage band treated as "at the boundary": within 0.1 of 0 or 100
const EDGE_BAND: f64 = 0.1;

/// Bounds progress volume on long operations: a report is forwarded only on
/// a >= 1-point advance since the last forwarded value, or on first entering
/// the boundary band at either end.
#[derive(Debug, Default)]
pub struct ProgressThrottle {
    last: Option<f64>,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, percent: f64) -> bool {
        let near_edge = percent <= EDGE_BAND || percent >= 100.0 - EDGE_BAND;
        let admit = match self.last {
            None => true,
            Some(last) => {
                let last_near_edge = last <= EDGE_BAND || last >= 100.0 - EDGE_BAND;
                percent - last >= 1.0 || (near_edge && !last_near_edge)
            }
        };
        if admit {
            self.last = Some(percent);
        }
        admit
    }
}

/// Truncate a message to the bounded length surfaced to consumers
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}

/// Human-readable transfer rate, e.g. "12.5 MB/s"
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64, DECIMAL))
}

/// Human-readable byte count, e.g. "4.2 MB"
pub fn format_bytes(bytes: u64) -> String {
    format_size(bytes, DECIMAL)
}

/// Elapsed wall time as "1h 2m 3s"
pub fn format_elapsed(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Media time as "hh:mm:ss"
pub fn format_clock(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
