use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{EngineError, Result};
use crate::events::{format_bytes, format_elapsed, format_rate, EventSender};
use crate::signal::CancelFlag;

/// Progress checkpoint forwarded once the backend reports completion; the
/// remainder covers the backend's own finalization work.
pub const FINISHED_PERCENT: f64 = 95.0;

/// One unit of acquisition work handed to a backend
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Stream selector, opaque to the core
    pub format_selector: Option<String>,
    /// Requested destination. Backends may rewrite the name; the concrete
    /// path comes back in the outcome.
    pub dest: PathBuf,
}

/// Status reported by the backend into the progress hook
#[derive(Debug, Clone)]
pub enum FetchUpdate {
    Downloading {
        downloaded: u64,
        total: Option<u64>,
    },
    Finished,
    Error {
        message: String,
    },
}

/// What an acquisition produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The concrete on-disk path, as reported by the backend
    Saved(PathBuf),
    /// The source had nothing usable to produce
    NoAudio,
}

/// Progress hook handed to the backend. An `Err` return tells the backend
/// to abort immediately and propagate the error unchanged.
pub type FetchHook<'a> = &'a mut dyn FnMut(FetchUpdate) -> Result<()>;

/// External acquisition backend. `fetch` blocks until done and must call
/// the hook at every progress checkpoint — those calls are the only
/// cancellation points the core has over this shape.
pub trait FetchBackend: Send + Sync {
    fn fetch(&self, request: &FetchRequest, hook: FetchHook<'_>) -> Result<FetchOutcome>;
}

/// Drive one blocking acquisition on a worker thread.
///
/// The hook installed here checks the shared cancellation signal before
/// anything else, computes percentage and transfer rate from the byte
/// counters, and forwards progress to the notification stream. An unknown
/// total is forwarded as an indeterminate update with elapsed time instead
/// of a percentage.
pub async fn run_fetch(
    backend: Arc<dyn FetchBackend>,
    request: FetchRequest,
    events: EventSender,
    cancel: CancelFlag,
) -> Result<FetchOutcome> {
    tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let mut last_report: Option<(u64, Instant)> = None;

        let mut hook = move |update: FetchUpdate| -> Result<()> {
            if cancel.is_set() {
                return Err(EngineError::Cancelled);
            }
            match update {
                FetchUpdate::Downloading { downloaded, total } => {
                    let now = Instant::now();
                    let rate = last_report.map(|(bytes, at)| {
                        let secs = now.duration_since(at).as_secs_f64();
                        if secs > 0.0 {
                            downloaded.saturating_sub(bytes) as f64 / secs
                        } else {
                            0.0
                        }
                    });
                    last_report = Some((downloaded, now));

                    match total {
                        Some(total) if total > 0 => {
                            let percent =
                                (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
                            let mut message = format!(
                                "{} of {}",
                                format_bytes(downloaded),
                                format_bytes(total)
                            );
                            if let Some(rate) = rate {
                                message.push_str(&format!(" at {}", format_rate(rate)));
                            }
                            events.progress(Some(percent), message);
                        }
                        _ => {
                            events.progress(
                                None,
                                format!(
                                    "{} in {}",
                                    format_bytes(downloaded),
                                    format_elapsed(started.elapsed().as_secs())
                                ),
                            );
                        }
                    }
                    Ok(())
                }
                FetchUpdate::Finished => {
                    events.progress(Some(FINISHED_PERCENT), "download finished, finalizing");
                    Ok(())
                }
                FetchUpdate::Error { message } => Err(EngineError::Execution(message)),
            }
        };

        backend.fetch(&request, &mut hook)
    })
    .await
    .map_err(|e| EngineError::Execution(format!("acquisition backend panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueueEvent;
    use tokio::sync::mpsc;

    struct ScriptedBackend {
        updates: Vec<FetchUpdate>,
        outcome: FetchOutcome,
    }

    impl FetchBackend for ScriptedBackend {
        fn fetch(&self, _request: &FetchRequest, hook: FetchHook<'_>) -> Result<FetchOutcome> {
            for update in &self.updates {
                hook(update.clone())?;
            }
            Ok(self.outcome.clone())
        }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            url: "https://example.com/a".to_string(),
            format_selector: None,
            dest: PathBuf::from("/tmp/a.mka"),
        }
    }

    fn channel() -> (EventSender, mpsc::Receiver<QueueEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (EventSender::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_forwards_percentage_and_finish_checkpoint() {
        let backend = Arc::new(ScriptedBackend {
            updates: vec![
                FetchUpdate::Downloading {
                    downloaded: 25,
                    total: Some(100),
                },
                FetchUpdate::Downloading {
                    downloaded: 100,
                    total: Some(100),
                },
                FetchUpdate::Finished,
            ],
            outcome: FetchOutcome::Saved(PathBuf::from("/tmp/rewritten.mka")),
        });
        let (events, mut rx) = channel();

        let outcome = run_fetch(backend, request(), events, CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Saved(PathBuf::from("/tmp/rewritten.mka"))
        );

        let percents: Vec<Option<f64>> = drain(&mut rx)
            .into_iter()
            .map(|event| match event {
                QueueEvent::Progress { percent, .. } => percent,
                other => panic!("unexpected event: {:?}", other),
            })
            .collect();
        assert_eq!(
            percents,
            vec![Some(25.0), Some(100.0), Some(FINISHED_PERCENT)]
        );
    }

    #[tokio::test]
    async fn test_unknown_total_is_indeterminate() {
        let backend = Arc::new(ScriptedBackend {
            updates: vec![FetchUpdate::Downloading {
                downloaded: 1024,
                total: None,
            }],
            outcome: FetchOutcome::Saved(PathBuf::from("/tmp/a.mka")),
        });
        let (events, mut rx) = channel();

        run_fetch(backend, request(), events, CancelFlag::new())
            .await
            .unwrap();

        match drain(&mut rx).first() {
            Some(QueueEvent::Progress { percent: None, message }) => {
                assert!(message.contains("in"), "elapsed message, got {:?}", message);
            }
            other => panic!("expected indeterminate progress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_wins_at_first_checkpoint() {
        let backend = Arc::new(ScriptedBackend {
            updates: vec![FetchUpdate::Downloading {
                downloaded: 1,
                total: Some(2),
            }],
            outcome: FetchOutcome::Saved(PathBuf::from("/tmp/a.mka")),
        });
        let (events, _rx) = channel();
        let cancel = CancelFlag::new();
        cancel.set();

        let err = run_fetch(backend, request(), events, cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_backend_error_becomes_execution_failure() {
        let backend = Arc::new(ScriptedBackend {
            updates: vec![FetchUpdate::Error {
                message: "403 from origin".to_string(),
            }],
            outcome: FetchOutcome::Saved(PathBuf::from("/tmp/a.mka")),
        });
        let (events, _rx) = channel();

        let err = run_fetch(backend, request(), events, CancelFlag::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Execution(message) => assert!(message.contains("403")),
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_audio_outcome_passes_through() {
        let backend = Arc::new(ScriptedBackend {
            updates: vec![],
            outcome: FetchOutcome::NoAudio,
        });
        let (events, _rx) = channel();

        let outcome = run_fetch(backend, request(), events, CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NoAudio);
    }
}
