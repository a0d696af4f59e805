use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use engine::{
    ConflictPolicy, EngineConfig, EngineError, FetchBackend, FetchHook, FetchOutcome,
    FetchRequest, FetchUpdate, JobConfig, JobKind, JobStatus, QueueEvent, QueueManager,
    TranscodeSpec,
};
use log::{info, warn};
use walkdir::WalkDir;

/// Media file extensions picked up when a directory is given as input
const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "mp3", "m4a", "aac", "flac", "opus", "ogg", "wav",
    "mka",
];

/// Media acquisition/transcode job queue
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output directory for this batch session
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// What to do when the destination exists: skip, overwrite or rename
    #[arg(long)]
    policy: Option<String>,

    /// Output container extension for transcode jobs
    #[arg(long, default_value = "mkv")]
    container: String,

    /// Engine arguments for transcode jobs, whitespace-separated
    #[arg(long, default_value = "-c copy")]
    codec_args: String,

    /// Keep audio only, dropping video streams
    #[arg(long)]
    audio_only: bool,

    /// Stream selector handed to the acquisition backend
    #[arg(long)]
    format: Option<String>,

    /// URLs, media files, or directories to process
    #[arg(required = true)]
    inputs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if args.verbose { "debug" } else { "info" },
    ))
    .format_timestamp_secs()
    .init();

    let mut cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = &args.output_dir {
        cfg.download_dir = dir.clone();
    }
    if let Some(policy) = &args.policy {
        cfg.conflict_policy = parse_policy(policy)?;
    }
    // Batch mode: keep the worker scanning until everything is done
    cfg.auto_continue = true;

    info!("mdq starting");
    info!("  output dir: {}", cfg.download_dir.display());
    info!("  conflict policy: {:?}", cfg.conflict_policy);
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());

    let transcode_spec = TranscodeSpec {
        container: args.container.clone(),
        codec_args: args
            .codec_args
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        audio_only: args.audio_only,
        duration_secs: None,
    };

    let backend = Arc::new(HttpFetchBackend::new()?);
    let (queue, mut rx) = QueueManager::new(cfg, Some(backend));

    // Render the notification stream as log lines
    let renderer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            render(event);
        }
    });

    let mut added = 0usize;
    for input in &args.inputs {
        if is_url(input) {
            let mut config = JobConfig::for_url(input.clone(), output_name_from_url(input));
            config.format_selector = args.format.clone();
            queue.add_job(JobKind::Fetch, config)?;
            added += 1;
            continue;
        }

        let path = PathBuf::from(input);
        if path.is_dir() {
            // One job per media file found under the directory
            for file in scan_directory(&path) {
                queue.add_job(
                    JobKind::Transcode,
                    JobConfig::for_file(file, transcode_spec.clone()),
                )?;
                added += 1;
            }
        } else if path.is_file() {
            queue.add_job(
                JobKind::Transcode,
                JobConfig::for_file(path, transcode_spec.clone()),
            )?;
            added += 1;
        } else {
            warn!("input does not exist, ignoring: {}", input);
        }
    }

    if added == 0 {
        bail!("no jobs to run");
    }
    info!("queued {} job(s)", added);

    queue.start();

    loop {
        let jobs = queue.jobs();
        if jobs.iter().all(|j| j.status().is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    queue.stop().await;

    let jobs = queue.jobs();
    let completed = count(&jobs, JobStatus::Completed);
    let failed = count(&jobs, JobStatus::Failed);
    let skipped = count(&jobs, JobStatus::Skipped);
    let no_audio = count(&jobs, JobStatus::NoAudio);
    info!(
        "✅ done: {} completed, {} failed, {} skipped, {} without audio",
        completed, failed, skipped, no_audio
    );

    drop(queue);
    let _ = renderer.await;

    if failed > 0 {
        bail!("{} job(s) failed", failed);
    }
    Ok(())
}

fn count(jobs: &[Arc<engine::Job>], status: JobStatus) -> usize {
    jobs.iter().filter(|j| j.status() == status).count()
}

fn render(event: QueueEvent) {
    match event {
        QueueEvent::Job {
            id,
            status,
            message,
            percent,
        } => match percent {
            Some(p) => info!("[{}] {:?}: {} ({:.0}%)", id, status, message, p),
            None => info!("[{}] {:?}: {}", id, status, message),
        },
        QueueEvent::Queue { state, message } => info!("queue {:?}: {}", state, message),
        QueueEvent::Progress {
            percent: Some(p),
            message,
        } => info!("  {:>5.1}% {}", p, message),
        QueueEvent::Progress {
            percent: None,
            message,
        } => info!("  ..... {}", message),
    }
}

fn parse_policy(value: &str) -> Result<ConflictPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "skip" => Ok(ConflictPolicy::Skip),
        "overwrite" => Ok(ConflictPolicy::Overwrite),
        "rename" => Ok(ConflictPolicy::Rename),
        other => bail!("unknown conflict policy: {} (expected skip, overwrite or rename)", other),
    }
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Last path segment of the URL, without query or fragment
fn output_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .map(str::to_string)
        .unwrap_or_else(|| "download.bin".to_string())
}

/// Collect media files under a directory, sorted for stable job order
fn scan_directory(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("error reading directory entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext {
            Some(ext) if MEDIA_EXTENSIONS.contains(&ext.as_str()) => {
                files.push(path.to_path_buf());
            }
            _ => {}
        }
    }
    files.sort();
    info!("found {} media file(s) under {}", files.len(), root.display());
    files
}

/// Plain HTTP acquisition backend: streams the response body to the
/// requested destination, reporting byte counters into the progress hook.
struct HttpFetchBackend {
    client: reqwest::blocking::Client,
}

impl HttpFetchBackend {
    fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpFetchBackend { client })
    }
}

impl FetchBackend for HttpFetchBackend {
    fn fetch(
        &self,
        request: &FetchRequest,
        hook: FetchHook<'_>,
    ) -> engine::Result<FetchOutcome> {
        let mut response = self
            .client
            .get(&request.url)
            .send()
            .map_err(|e| EngineError::Execution(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Execution(format!(
                "server returned {} for {}",
                response.status(),
                request.url
            )));
        }

        let total = response.content_length();
        let mut file = File::create(&request.dest).map_err(|e| {
            EngineError::Execution(format!(
                "failed to create {}: {}",
                request.dest.display(),
                e
            ))
        })?;

        let mut buf = [0u8; 64 * 1024];
        let mut downloaded = 0u64;
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| EngineError::Execution(format!("read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| EngineError::Execution(format!("write failed: {}", e)))?;
            downloaded += n as u64;
            hook(FetchUpdate::Downloading { downloaded, total })?;
        }

        hook(FetchUpdate::Finished)?;
        Ok(FetchOutcome::Saved(request.dest.clone()))
    }
}
