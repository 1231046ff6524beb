//! Channel listing worker
//!
//! Listing a channel runs the helper to completion, which can take seconds,
//! so it lives on its own thread. Results come back over a channel and the
//! worker wakes the event loop through a `mio::Waker`. Dropping the worker
//! kills a helper that is still running.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use mio::Waker;
use qaryx_proto::VideoEntry;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::kill_and_reap;
use crate::config::ResolverConfig;
use crate::protocol::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingJob {
    pub requester: ConnectionId,
    pub url: String,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingResult {
    pub requester: ConnectionId,
    pub url: String,
    pub videos: Vec<VideoEntry>,
}

/// One `--dump-json` line; only the fields we keep
#[derive(Debug, Deserialize)]
struct DumpedEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    #[serde(default)]
    url: String,
}

impl From<DumpedEntry> for VideoEntry {
    fn from(entry: DumpedEntry) -> Self {
        VideoEntry {
            url: format!("https://www.youtube.com/watch?v={}", entry.id),
            id: entry.id,
            title: entry.title,
            channel: entry.channel.unwrap_or_default(),
            duration: entry.duration.map_or(0, |d| d.max(0.0) as u64),
            thumbnail: entry.thumbnails.into_iter().next_back().map(|t| t.url).unwrap_or_default(),
        }
    }
}

/// Parse helper output, one JSON object per line, keeping at most `max`
pub fn parse_listing(output: &str, max: usize) -> Vec<VideoEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str::<DumpedEntry>(line) {
            Ok(entry) => Some(VideoEntry::from(entry)),
            Err(e) => {
                debug!("Skipping listing line: {}", e);
                None
            }
        })
        .take(max)
        .collect()
}

fn listing_args(url: &str, max: usize, proxy: Option<&str>) -> Vec<String> {
    let mut args = vec!["--no-warnings".to_string(), "--flat-playlist".to_string()];
    if let Some(proxy) = proxy {
        args.push("--proxy".into());
        args.push(proxy.to_string());
    }
    args.push("--playlist-end".into());
    args.push(max.to_string());
    args.push("--dump-json".into());
    args.push(url.to_string());
    args
}

/// Helper currently run by the worker, shared with the owner for shutdown
#[derive(Debug, Default)]
struct Running {
    stopping: bool,
    child: Option<Child>,
}

fn lock(running: &Mutex<Running>) -> MutexGuard<'_, Running> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_listing(executable: &Path, proxy: Option<&str>, job: &ListingJob, running: &Mutex<Running>) -> Vec<VideoEntry> {
    let mut stdout = {
        let mut running = lock(running);
        if running.stopping {
            return Vec::new();
        }
        let spawned = Command::new(executable)
            .args(listing_args(&job.url, job.max, proxy))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to run listing helper for {}: {}", job.url, e);
                return Vec::new();
            }
        };
        let Some(stdout) = child.stdout.take() else {
            kill_and_reap(&mut child);
            return Vec::new();
        };
        running.child = Some(child);
        stdout
    };

    // a kill from the owner ends this read with EOF
    let mut output = Vec::new();
    if let Err(e) = stdout.read_to_end(&mut output) {
        debug!("Listing output for {} cut short: {}", job.url, e);
    }

    let finished = lock(running).child.take();
    if let Some(mut child) = finished {
        match child.wait() {
            Ok(status) if !status.success() => {
                debug!("Listing helper for {} exited with {}", job.url, status)
            }
            Ok(_) => {}
            Err(e) => debug!("wait {}: {}", child.id(), e),
        }
    }
    parse_listing(&String::from_utf8_lossy(&output), job.max)
}

/// Background thread running channel listings one at a time
pub struct ListingWorker {
    jobs: Option<Sender<ListingJob>>,
    results: Receiver<ListingResult>,
    running: Arc<Mutex<Running>>,
    handle: Option<JoinHandle<()>>,
}

impl ListingWorker {
    pub fn spawn(config: &ResolverConfig, waker: Waker) -> std::io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<ListingJob>();
        let (result_tx, result_rx) = mpsc::channel();
        let executable = config.executable.clone();
        let proxy = config.proxy().map(str::to_string);
        let running = Arc::new(Mutex::new(Running::default()));
        let shared = running.clone();

        let handle = thread::Builder::new().name("qaryx-listing".into()).spawn(move || {
            for job in job_rx {
                let videos = run_listing(&executable, proxy.as_deref(), &job, &shared);
                if lock(&shared).stopping {
                    break;
                }
                info!("Listed {} videos for {}", videos.len(), job.url);
                let result = ListingResult { requester: job.requester, url: job.url, videos };
                if result_tx.send(result).is_err() {
                    break;
                }
                if let Err(e) = waker.wake() {
                    warn!("Failed to wake event loop: {}", e);
                }
            }
            debug!("Listing worker stopped");
        })?;

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            running,
            handle: Some(handle),
        })
    }

    /// Queue a listing; false if the worker is gone
    pub fn submit(&self, job: ListingJob) -> bool {
        self.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok())
    }

    /// Completed listings since the last call
    pub fn drain(&self) -> Vec<ListingResult> {
        self.results.try_iter().collect()
    }
}

impl Drop for ListingWorker {
    fn drop(&mut self) {
        self.jobs.take();
        {
            let mut running = lock(&self.running);
            running.stopping = true;
            if let Some(child) = running.child.as_mut() {
                debug!("Killing listing helper {}", child.id());
                if let Err(e) = child.kill() {
                    debug!("kill {}: {}", child.id(), e);
                }
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Listing worker panicked");
            }
        }
    }
}
