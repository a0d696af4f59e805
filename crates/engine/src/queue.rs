use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::EngineConfig;
use crate::conflict::{self, Resolution};
use crate::error::{EngineError, Result};
use crate::events::{truncate_message, EventSender, QueueEvent, QueueState};
use crate::fetch::{run_fetch, FetchBackend, FetchOutcome, FetchRequest};
use crate::job::{Job, JobConfig, JobId, JobKind, JobStatus, Source};
use crate::probe;
use crate::signal::CancelFlag;
use crate::transcode::TranscodeEngine;

/// Why the worker is not selecting jobs. A user pause survives new work and
/// completions; an idle pause lifts as soon as work arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    PausedByUser,
    PausedIdle,
}

struct Inner {
    config: EngineConfig,
    jobs: Mutex<Vec<Arc<Job>>>,
    run_state: Mutex<RunState>,
    stopping: AtomicBool,
    /// Per-operation signal, reset before each execution
    cancel: CancelFlag,
    auto_continue: AtomicBool,
    session_dir: Mutex<Option<PathBuf>>,
    events: EventSender,
    engine: TranscodeEngine,
    backend: Option<Arc<dyn FetchBackend>>,
}

impl Inner {
    fn is_paused(&self) -> bool {
        *self.run_state.lock().unwrap() != RunState::Running
    }

    fn contains(&self, id: JobId) -> bool {
        self.jobs.lock().unwrap().iter().any(|j| j.id() == id)
    }

    /// Select the first pending job in insertion order and flip it to
    /// running, all under the collection lock
    fn claim_next_pending(&self) -> Option<Arc<Job>> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter().find(|job| job.try_claim()).cloned()
    }

    fn auto_pause(&self) {
        let mut state = self.run_state.lock().unwrap();
        if *state == RunState::Running {
            *state = RunState::PausedIdle;
            info!("queue idle, auto-pausing");
            self.events.queue(QueueState::Paused, "queue idle");
        }
    }

    /// Session directory for this batch, established once from `fallback`
    /// when the consumer has not set one
    fn ensure_session_dir(&self, fallback: &Path) -> PathBuf {
        let mut session = self.session_dir.lock().unwrap();
        session
            .get_or_insert_with(|| fallback.to_path_buf())
            .clone()
    }
}

/// Owns the job collection and the single background worker. One instance
/// serializes all executions: at most one job is ever running.
pub struct QueueManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Create a manager plus the receiving end of its notification stream.
    /// `backend` handles remote acquisition jobs; queues without one can
    /// still run transcode jobs.
    pub fn new(
        config: EngineConfig,
        backend: Option<Arc<dyn FetchBackend>>,
    ) -> (QueueManager, mpsc::Receiver<QueueEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let events = EventSender::new(tx);
        let engine = TranscodeEngine::new(&config);
        let auto_continue = config.auto_continue;

        let inner = Arc::new(Inner {
            config,
            jobs: Mutex::new(Vec::new()),
            run_state: Mutex::new(RunState::PausedIdle),
            stopping: AtomicBool::new(false),
            cancel: CancelFlag::new(),
            auto_continue: AtomicBool::new(auto_continue),
            session_dir: Mutex::new(None),
            events,
            engine,
            backend,
        });

        (
            QueueManager {
                inner,
                worker: Mutex::new(None),
            },
            rx,
        )
    }

    /// Validate and append a job; emits the initial pending notification.
    /// New work lifts an idle pause but never a user pause.
    pub fn add_job(&self, kind: JobKind, config: JobConfig) -> Result<Arc<Job>> {
        let job = Arc::new(Job::new(kind, config)?);
        self.inner.jobs.lock().unwrap().push(job.clone());

        info!("Job {}: queued ({})", job.id(), job.label());
        self.inner
            .events
            .job(job.id(), JobStatus::Pending, job.label(), None);
        self.resume_if_idle_paused();
        Ok(job)
    }

    /// Remove a job from the collection. A running job is marked failed and
    /// its in-flight operation is asked to stop; the operation keeps running
    /// against the detached job object until it observes the signal.
    pub fn remove_job(&self, id: JobId) -> bool {
        let (job, was_running) = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let Some(pos) = jobs.iter().position(|j| j.id() == id) else {
                warn!("Job {}: not found, nothing to remove", id);
                return false;
            };
            let job = jobs.remove(pos);
            // Claiming happens under this lock, so the status is stable here
            let was_running = job.status() == JobStatus::Running;
            (job, was_running)
        };

        if was_running {
            job.transition(
                JobStatus::Failed,
                None,
                Some("removed while running".to_string()),
            );
            self.inner.cancel.set();
            info!("Job {}: removed while running, cancellation requested", id);
        } else {
            info!("Job {}: removed", id);
        }
        true
    }

    /// Look up a job by id
    pub fn get_job(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id() == id)
            .cloned()
    }

    /// Snapshot of the collection in insertion order
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.inner.jobs.lock().unwrap().clone()
    }

    /// Return one terminal job to pending
    pub fn reset_job(&self, id: JobId) -> bool {
        let Some(job) = self.get_job(id) else {
            warn!("Job {}: not found, nothing to reset", id);
            return false;
        };
        if !job.reset() {
            return false;
        }
        info!("Job {}: reset to pending", id);
        self.inner
            .events
            .job(id, JobStatus::Pending, job.label(), None);
        self.resume_if_idle_paused();
        true
    }

    /// Return every terminal job to pending; yields the number reset
    pub fn reset_finished_jobs(&self) -> usize {
        let jobs = self.jobs();
        let mut count = 0;
        for job in jobs {
            if job.reset() {
                self.inner
                    .events
                    .job(job.id(), JobStatus::Pending, job.label(), None);
                count += 1;
            }
        }
        if count > 0 {
            info!("reset {} finished job(s) to pending", count);
            self.resume_if_idle_paused();
        }
        count
    }

    /// Clear any pause and make sure the worker is alive. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        *self.inner.run_state.lock().unwrap() = RunState::Running;
        self.inner.stopping.store(false, Ordering::SeqCst);

        let mut worker = self.worker.lock().unwrap();
        let alive = worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !alive {
            let inner = self.inner.clone();
            *worker = Some(tokio::spawn(worker_loop(inner)));
            debug!("queue worker spawned");
        }
        self.inner.events.queue(QueueState::Running, "queue running");
    }

    /// Pause job selection and interrupt the in-flight operation; the
    /// interrupted job returns to pending. Only `start` resumes.
    pub fn pause(&self) {
        *self.inner.run_state.lock().unwrap() = RunState::PausedByUser;
        self.inner.cancel.set();
        info!("queue paused by user");
        self.inner.events.queue(QueueState::Paused, "queue paused");
    }

    /// Stop the worker and wait for it to exit. Interrupts the in-flight
    /// operation like `pause`. Must not be called from the worker itself.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.cancel.set();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("queue worker exited abnormally: {}", e);
            }
        }
        info!("queue worker stopped");
    }

    /// Current queue-level state as surfaced to consumers
    pub fn queue_state(&self) -> QueueState {
        match *self.inner.run_state.lock().unwrap() {
            RunState::Running => QueueState::Running,
            _ => QueueState::Paused,
        }
    }

    /// When off (the default), the worker auto-pauses on an idle queue
    pub fn set_auto_continue(&self, on: bool) {
        self.inner.auto_continue.store(on, Ordering::SeqCst);
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.inner.session_dir.lock().unwrap().clone()
    }

    /// Establish the session directory for this batch. Returns the
    /// directory actually in effect: an earlier one wins until cleared.
    pub fn set_session_dir(&self, dir: impl Into<PathBuf>) -> PathBuf {
        let dir = dir.into();
        self.inner.ensure_session_dir(&dir)
    }

    /// End the current batch session; the next job establishes a new one
    pub fn clear_session_dir(&self) {
        *self.inner.session_dir.lock().unwrap() = None;
    }

    fn resume_if_idle_paused(&self) {
        let worker_alive = self
            .worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if !worker_alive {
            return;
        }
        let mut state = self.inner.run_state.lock().unwrap();
        if *state == RunState::PausedIdle {
            *state = RunState::Running;
            info!("new work arrived, resuming idle queue");
            self.inner.events.queue(QueueState::Running, "queue running");
        }
    }
}

/// The single background worker. Selects pending jobs in insertion order,
/// one at a time; a job failure never terminates the loop.
async fn worker_loop(inner: Arc<Inner>) {
    let tick = Duration::from_millis(inner.config.tick_ms.max(1));
    debug!("worker loop entered");

    while !inner.stopping.load(Ordering::SeqCst) {
        if inner.is_paused() {
            sleep(tick).await;
            continue;
        }

        let Some(job) = inner.claim_next_pending() else {
            if inner.auto_continue.load(Ordering::SeqCst) {
                sleep(tick).await;
            } else {
                inner.auto_pause();
            }
            continue;
        };

        info!("Job {}: starting ({})", job.id(), job.label());
        inner
            .events
            .job(job.id(), JobStatus::Running, job.label(), None);
        inner.cancel.clear();

        let result = execute_job(&inner, &job).await;
        finalize_job(&inner, &job, result);
    }

    debug!("worker loop exited");
}

enum ExecDone {
    Completed { path: PathBuf },
    Skipped { path: PathBuf },
    NoAudio,
}

enum Operation {
    Saved(PathBuf),
    NoAudio,
}

/// Resolve the destination, apply the conflict policy, run the external
/// operation, and settle the backup either way.
async fn execute_job(inner: &Inner, job: &Arc<Job>) -> Result<ExecDone> {
    // Snapshot the configuration at selection time; consumer edits made
    // from here on apply to the next run
    let config = job.config();

    let desired = resolve_destination(inner, &config)?;
    let policy = config
        .conflict_policy
        .unwrap_or(inner.config.conflict_policy);

    let resolution = conflict::resolve(&desired, policy).map_err(|source| {
        EngineError::ConflictResolution {
            path: desired.clone(),
            source,
        }
    })?;

    let (final_path, backup) = match resolution {
        Resolution::Skip => {
            info!(
                "Job {}: destination already exists, skipping ({})",
                job.id(),
                desired.display()
            );
            return Ok(ExecDone::Skipped { path: desired });
        }
        Resolution::Write {
            final_path,
            backup_path,
        } => (final_path, backup_path),
    };

    match run_operation(inner, job, &config, &final_path).await {
        Ok(Operation::Saved(path)) => {
            if let Some(ref backup) = backup {
                if let Err(e) = conflict::discard_backup(backup) {
                    // The output is good; a leftover .bak is not worth
                    // failing the job over
                    warn!(
                        "Job {}: could not remove backup {}: {}",
                        job.id(),
                        backup.display(),
                        e
                    );
                }
            }
            Ok(ExecDone::Completed { path })
        }
        Ok(Operation::NoAudio) => {
            undo_partial_write(job, &final_path, &backup);
            Ok(ExecDone::NoAudio)
        }
        Err(err) => {
            undo_partial_write(job, &final_path, &backup);
            Err(err)
        }
    }
}

/// Failure path of an attempted write: drop any partial output and put the
/// previous content back before the job is marked failed
fn undo_partial_write(job: &Arc<Job>, final_path: &Path, backup: &Option<PathBuf>) {
    match backup {
        Some(backup) => {
            if let Err(e) = conflict::restore_backup(final_path, backup) {
                error!(
                    "Job {}: failed to restore {} from {}: {}",
                    job.id(),
                    final_path.display(),
                    backup.display(),
                    e
                );
            }
        }
        None => {
            if final_path.exists() {
                if let Err(e) = fs::remove_file(final_path) {
                    warn!(
                        "Job {}: could not remove partial output {}: {}",
                        job.id(),
                        final_path.display(),
                        e
                    );
                }
            }
        }
    }
}

fn resolve_destination(inner: &Inner, config: &JobConfig) -> Result<PathBuf> {
    let dir = match &config.output_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => inner
            .ensure_session_dir(&inner.config.download_dir)
            .join(dir),
        None => inner.ensure_session_dir(&inner.config.download_dir),
    };

    fs::create_dir_all(&dir).map_err(|source| EngineError::ConflictResolution {
        path: dir.clone(),
        source,
    })?;

    let name = match (&config.output_name, &config.source, &config.transcode) {
        (Some(name), _, _) => name.clone(),
        (None, Source::File(path), Some(spec)) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "cannot derive an output name from {}",
                        path.display()
                    ))
                })?;
            format!("{}.{}", stem, spec.container)
        }
        _ => {
            return Err(EngineError::Configuration(
                "job has no output name".to_string(),
            ))
        }
    };

    Ok(dir.join(name))
}

async fn run_operation(
    inner: &Inner,
    job: &Arc<Job>,
    config: &JobConfig,
    dest: &Path,
) -> Result<Operation> {
    match job.kind() {
        JobKind::Fetch => {
            let backend = inner.backend.clone().ok_or_else(|| {
                EngineError::Configuration("no acquisition backend configured".to_string())
            })?;
            let url = match &config.source {
                Source::Url(url) => url.clone(),
                Source::File(_) => {
                    return Err(EngineError::Configuration(
                        "fetch job requires a URL source".to_string(),
                    ))
                }
            };
            let request = FetchRequest {
                url,
                format_selector: config.format_selector.clone(),
                dest: dest.to_path_buf(),
            };
            match run_fetch(
                backend,
                request,
                inner.events.clone(),
                inner.cancel.clone(),
            )
            .await?
            {
                FetchOutcome::Saved(path) => Ok(Operation::Saved(path)),
                FetchOutcome::NoAudio => Ok(Operation::NoAudio),
            }
        }
        JobKind::Transcode => {
            let input = match &config.source {
                Source::File(path) => path.clone(),
                Source::Url(_) => {
                    return Err(EngineError::Configuration(
                        "transcode job requires a file source".to_string(),
                    ))
                }
            };
            let spec = config.transcode.clone().ok_or_else(|| {
                EngineError::Configuration("transcode job requires transcode parameters".to_string())
            })?;

            let mut total = spec.duration_secs;
            if spec.audio_only || total.is_none() {
                match probe::probe_file(&inner.config.ffprobe_bin, &input).await {
                    Ok(data) => {
                        if spec.audio_only && !data.has_audio() {
                            info!("Job {}: source has no audio stream", job.id());
                            return Ok(Operation::NoAudio);
                        }
                        if total.is_none() {
                            total = data.duration_secs();
                        }
                    }
                    // An audio-only plan cannot proceed unverified
                    Err(e) if spec.audio_only => return Err(e),
                    Err(e) => {
                        warn!(
                            "Job {}: probe failed, progress will be indeterminate: {}",
                            job.id(),
                            e
                        );
                    }
                }
            }

            let path = inner
                .engine
                .run(&input, dest, &spec, total, &inner.events, &inner.cancel)
                .await?;
            Ok(Operation::Saved(path))
        }
    }
}

/// Write the terminal state back into the job and notify the consumer. The
/// job may have been removed mid-flight; a natural result still lands in
/// the detached object, but a cancellation leaves its removal-set failure
/// untouched.
fn finalize_job(inner: &Inner, job: &Arc<Job>, result: Result<ExecDone>) {
    let id = job.id();
    match result {
        Ok(ExecDone::Completed { path }) => {
            info!("Job {}: completed -> {}", id, path.display());
            job.transition(JobStatus::Completed, Some(path.clone()), None);
            inner
                .events
                .job(id, JobStatus::Completed, path.display().to_string(), Some(100.0));
        }
        Ok(ExecDone::Skipped { path }) => {
            job.transition(
                JobStatus::Skipped,
                Some(path.clone()),
                Some("destination already exists".to_string()),
            );
            inner
                .events
                .job(id, JobStatus::Skipped, "destination already exists", None);
        }
        Ok(ExecDone::NoAudio) => {
            info!("Job {}: nothing usable to produce", id);
            job.transition(
                JobStatus::NoAudio,
                None,
                Some("no usable audio in source".to_string()),
            );
            inner
                .events
                .job(id, JobStatus::NoAudio, "no usable audio in source", None);
        }
        Err(EngineError::Cancelled) => {
            if inner.contains(id) {
                // Interrupted by pause/stop, not failed: back to the queue
                info!("Job {}: interrupted, returning to queue", id);
                job.transition(JobStatus::Pending, None, None);
                inner.events.job(id, JobStatus::Pending, "interrupted", None);
            } else {
                debug!("Job {}: cancelled after removal", id);
            }
        }
        Err(err) => {
            let message = truncate_message(&err.to_string());
            error!("Job {}: failed: {}", id, message);
            job.transition(JobStatus::Failed, None, Some(message.clone()));
            inner.events.job(id, JobStatus::Failed, message, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchHook, FetchUpdate};
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Test backend: records processed URLs, optionally blocks until the
    /// hook reports cancellation, optionally fails after a partial write.
    struct StubBackend {
        order: Mutex<Vec<String>>,
        block_until_cancel: bool,
        fail_after_write: bool,
    }

    impl StubBackend {
        fn ok() -> Self {
            StubBackend {
                order: Mutex::new(Vec::new()),
                block_until_cancel: false,
                fail_after_write: false,
            }
        }

        fn blocking() -> Self {
            StubBackend {
                block_until_cancel: true,
                ..Self::ok()
            }
        }

        fn failing() -> Self {
            StubBackend {
                fail_after_write: true,
                ..Self::ok()
            }
        }

        fn seen(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    impl FetchBackend for StubBackend {
        fn fetch(
            &self,
            request: &FetchRequest,
            hook: FetchHook<'_>,
        ) -> Result<FetchOutcome> {
            self.order.lock().unwrap().push(request.url.clone());

            if self.block_until_cancel {
                loop {
                    std::thread::sleep(Duration::from_millis(10));
                    hook(FetchUpdate::Downloading {
                        downloaded: 0,
                        total: None,
                    })?;
                }
            }

            hook(FetchUpdate::Downloading {
                downloaded: 50,
                total: Some(100),
            })?;
            std::fs::write(&request.dest, b"payload")
                .map_err(|e| EngineError::Execution(e.to_string()))?;

            if self.fail_after_write {
                return Err(EngineError::Execution("backend blew up".to_string()));
            }

            hook(FetchUpdate::Finished)?;
            Ok(FetchOutcome::Saved(request.dest.clone()))
        }
    }

    fn test_config(dir: &TempDir) -> EngineConfig {
        let mut cfg = EngineConfig::default_config();
        cfg.download_dir = dir.path().to_path_buf();
        cfg.tick_ms = 10;
        cfg.auto_continue = true;
        cfg
    }

    fn fetch_config(n: usize) -> JobConfig {
        JobConfig::for_url(format!("https://example.com/{}", n), format!("track{}.mka", n))
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
        let start = Instant::now();
        while !check() {
            if start.elapsed() > deadline {
                panic!("condition not reached within {:?}", deadline);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn queue_states(events: &[QueueEvent]) -> Vec<QueueState> {
        events
            .iter()
            .filter_map(|event| match event {
                QueueEvent::Queue { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_fifo_completion_and_single_runner() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend.clone()));

        let mut handles = Vec::new();
        for n in 0..3 {
            handles.push(queue.add_job(JobKind::Fetch, fetch_config(n)).unwrap());
        }
        queue.start();

        let start = Instant::now();
        loop {
            let running = handles
                .iter()
                .filter(|j| j.status() == JobStatus::Running)
                .count();
            assert!(running <= 1, "more than one running job observed");

            if handles.iter().all(|j| j.status().is_terminal()) {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(10), "jobs did not finish");
            sleep(Duration::from_millis(5)).await;
        }

        for (n, job) in handles.iter().enumerate() {
            assert_eq!(job.status(), JobStatus::Completed);
            let path = job.result_path().unwrap();
            assert_eq!(path, dir.path().join(format!("track{}.mka", n)));
            assert!(path.exists());
        }
        assert_eq!(
            backend.seen(),
            vec![
                "https://example.com/0".to_string(),
                "https://example.com/1".to_string(),
                "https://example.com/2".to_string(),
            ]
        );
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_pause_then_start_emits_exactly_those_states() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let (queue, mut rx) = QueueManager::new(test_config(&dir), Some(backend));

        let a = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        let b = queue.add_job(JobKind::Fetch, fetch_config(1)).unwrap();

        queue.pause();
        queue.start();

        timeout(Duration::from_secs(10), async {
            wait_until(Duration::from_secs(10), || {
                a.status().is_terminal() && b.status().is_terminal()
            })
            .await;
        })
        .await
        .unwrap();

        assert_eq!(a.status(), JobStatus::Completed);
        assert_eq!(b.status(), JobStatus::Completed);
        assert_eq!(
            queue_states(&drain(&mut rx)),
            vec![QueueState::Paused, QueueState::Running]
        );
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_idle_queue_auto_pauses_and_new_work_resumes() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let mut cfg = test_config(&dir);
        cfg.auto_continue = false;
        let (queue, mut rx) = QueueManager::new(cfg, Some(backend));

        let a = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();

        wait_until(Duration::from_secs(10), || a.status().is_terminal()).await;
        wait_until(Duration::from_secs(10), || {
            queue.queue_state() == QueueState::Paused
        })
        .await;

        // New work lifts the idle pause without an explicit start()
        let b = queue.add_job(JobKind::Fetch, fetch_config(1)).unwrap();
        wait_until(Duration::from_secs(10), || b.status().is_terminal()).await;
        assert_eq!(b.status(), JobStatus::Completed);

        let states = queue_states(&drain(&mut rx));
        assert!(states.contains(&QueueState::Paused));
        assert_eq!(states.first(), Some(&QueueState::Running));
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_user_pause_is_not_lifted_by_new_work() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend.clone()));

        queue.start();
        queue.pause();
        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(queue.queue_state(), QueueState::Paused);
        assert!(backend.seen().is_empty());

        queue.start();
        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Completed);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_removal_of_running_job() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::blocking());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();
        wait_until(Duration::from_secs(10), || {
            job.status() == JobStatus::Running
        })
        .await;

        assert!(queue.remove_job(job.id()));
        // Observable through the retained handle before execution ends
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(queue.get_job(job.id()).is_none());

        // The detached execution observes the cancellation and must not
        // resurrect the job as pending
        sleep(Duration::from_millis(200)).await;
        assert_eq!(job.status(), JobStatus::Failed);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_pause_interrupts_and_requeues_running_job() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::blocking());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();
        wait_until(Duration::from_secs(10), || {
            job.status() == JobStatus::Running
        })
        .await;

        queue.pause();
        wait_until(Duration::from_secs(10), || {
            job.status() == JobStatus::Pending
        })
        .await;
        assert!(queue.get_job(job.id()).is_some());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_worker_and_requeues_in_flight_job() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::blocking());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();
        wait_until(Duration::from_secs(10), || {
            job.status() == JobStatus::Running
        })
        .await;

        timeout(Duration::from_secs(10), queue.stop())
            .await
            .expect("stop() must join the worker");
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_skip_policy_short_circuits_execution() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend.clone()));

        let dest = dir.path().join("track0.mka");
        std::fs::write(&dest, b"already here").unwrap();

        let mut config = fetch_config(0);
        config.conflict_policy = Some(conflict::ConflictPolicy::Skip);
        let job = queue.add_job(JobKind::Fetch, config).unwrap();
        queue.start();

        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Skipped);
        assert_eq!(job.result_path(), Some(dest.clone()));
        assert_eq!(std::fs::read(&dest).unwrap(), b"already here");
        // The backend was never invoked
        assert!(backend.seen().is_empty());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_failed_overwrite_restores_previous_content() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::failing());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let dest = dir.path().join("track0.mka");
        std::fs::write(&dest, b"original content").unwrap();

        let mut config = fetch_config(0);
        config.conflict_policy = Some(conflict::ConflictPolicy::Overwrite);
        let job = queue.add_job(JobKind::Fetch, config).unwrap();
        queue.start();

        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.message().unwrap().contains("backend blew up"));

        // Net effect indistinguishable from never having attempted it
        assert_eq!(std::fs::read(&dest).unwrap(), b"original content");
        assert!(!conflict::backup_path(&dest).exists());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_rename_policy_leaves_existing_file_alone() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let dest = dir.path().join("track0.mka");
        std::fs::write(&dest, b"first run").unwrap();

        let mut config = fetch_config(0);
        config.conflict_policy = Some(conflict::ConflictPolicy::Rename);
        let job = queue.add_job(JobKind::Fetch, config).unwrap();
        queue.start();

        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(
            job.result_path(),
            Some(dir.path().join("track0 (1).mka"))
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"first run");
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_job_failure_does_not_kill_the_worker() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::failing());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let bad = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        let bad2 = queue.add_job(JobKind::Fetch, fetch_config(1)).unwrap();
        queue.start();

        wait_until(Duration::from_secs(10), || {
            bad.status().is_terminal() && bad2.status().is_terminal()
        })
        .await;
        // Both processed; the first failure did not abort the loop
        assert_eq!(bad.status(), JobStatus::Failed);
        assert_eq!(bad2.status(), JobStatus::Failed);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_reset_failed_job_runs_again() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::failing());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();
        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);

        assert!(queue.reset_job(job.id()));
        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_without_backend_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let (queue, _rx) = QueueManager::new(test_config(&dir), None);

        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();

        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.message().unwrap().contains("backend"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_session_dir_established_once() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::ok());
        let (queue, _rx) = QueueManager::new(test_config(&dir), Some(backend));

        let first = dir.path().join("batch-a");
        let second = dir.path().join("batch-b");
        assert_eq!(queue.set_session_dir(&first), first);
        // Already established; the earlier directory stays in effect
        assert_eq!(queue.set_session_dir(&second), first);

        queue.clear_session_dir();
        assert_eq!(queue.set_session_dir(&second), second);

        let job = queue.add_job(JobKind::Fetch, fetch_config(0)).unwrap();
        queue.start();
        wait_until(Duration::from_secs(10), || job.status().is_terminal()).await;
        assert_eq!(
            job.result_path(),
            Some(second.join("track0.mka"))
        );
        queue.stop().await;
    }
}
