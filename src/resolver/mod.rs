//! External Resolver Subsystem
//!
//! One helper process per resolution request. Its stdout is a non-blocking
//! pipe the dispatcher watches; the first non-blank output line of a
//! successful run is the resolved value. Successful values are cached with a
//! TTL. Every request's continuation runs exactly once: synchronously on a
//! cache hit or a refused request, otherwise from the pipe/reap path.
//!
//! A pipe that is done with is parked, still open, until the dispatcher has
//! taken it out of the poll set and calls `release_closed_pipes`. Its
//! descriptor number cannot be handed out again before that.

pub mod cache;
pub mod listing;

pub use cache::ResolveCache;
pub use listing::{ListingJob, ListingResult, ListingWorker};

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use mio::unix::pipe::Receiver;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::error::ResolveError;

/// Completion callback, invoked exactly once per request
pub type Continuation = Box<dyn FnOnce(Result<String, ResolveError>)>;

/// Output past this many bytes is read and discarded
const OUTPUT_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolve#{}", self.0)
    }
}

/// Format selector and transport options passed to the helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveParams {
    pub quality: String,
    pub proxy: Option<String>,
}

impl ResolveParams {
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            quality: config.quality.clone(),
            proxy: config.proxy().map(str::to_string),
        }
    }

    /// Helper command line for `url`
    pub fn args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--no-warnings".to_string(), "--no-playlist".to_string()];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".into());
            args.push(proxy.clone());
        }
        args.push("-f".into());
        args.push(format!(
            "bestvideo[height<={}]+bestaudio/bestvideo+bestaudio/best",
            self.quality
        ));
        args.push("--get-url".into());
        args.push(url.to_string());
        args
    }
}

/// In-flight resolution. `pipe` is `None` once EOF was seen and the child
/// still has to be reaped.
struct ResolveRequest {
    key: String,
    child: Child,
    pipe: Option<Receiver>,
    output: Vec<u8>,
    started: Instant,
    continuation: Continuation,
}

impl ResolveRequest {
    /// Read until the pipe would block. Returns true at EOF or on error.
    fn drain_pipe(&mut self) -> bool {
        let Some(pipe) = self.pipe.as_mut() else {
            return true;
        };
        let mut chunk = [0u8; 1024];

        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => {
                    let room = OUTPUT_LIMIT.saturating_sub(self.output.len());
                    self.output.extend_from_slice(&chunk[..n.min(room)]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Resolver pipe read failed: {}", e);
                    return true;
                }
            }
        }
    }

    fn result(&self, status: ExitStatus) -> Result<String, ResolveError> {
        if !status.success() {
            return Err(ResolveError::ExitStatus(status.to_string()));
        }
        first_line(&self.output).ok_or(ResolveError::EmptyOutput)
    }
}

/// First non-blank line, trimmed
fn first_line(output: &[u8]) -> Option<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Bounded pool of helper processes plus the result cache
pub struct Resolver {
    executable: PathBuf,
    max_pending: usize,
    timeout: Option<Duration>,
    cache: ResolveCache,
    requests: BTreeMap<RequestId, ResolveRequest>,
    closed_pipes: Vec<Receiver>,
    next_id: u64,
}

impl Resolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            max_pending: config.max_pending,
            timeout: config.timeout(),
            cache: ResolveCache::new(config.cache_capacity, config.cache_ttl()),
            requests: BTreeMap::new(),
            closed_pipes: Vec::new(),
            next_id: 0,
        }
    }

    /// Resolve `key`. Cache hits and refusals complete before this returns.
    pub fn resolve(&mut self, key: &str, params: &ResolveParams, continuation: Continuation) {
        if let Some(value) = self.cache.get(key, Instant::now()) {
            debug!("Resolver cache hit for {}", key);
            continuation(Ok(value));
            return;
        }

        if self.requests.len() >= self.max_pending {
            warn!("Too many pending resolves, refusing {}", key);
            continuation(Err(ResolveError::PoolExhausted));
            return;
        }

        match self.spawn(key, params) {
            Ok((child, pipe)) => {
                let id = RequestId(self.next_id);
                self.next_id += 1;
                info!("Resolving {} ({}, pid {})", key, id, child.id());
                self.requests.insert(
                    id,
                    ResolveRequest {
                        key: key.to_string(),
                        child,
                        pipe: Some(pipe),
                        output: Vec::new(),
                        started: Instant::now(),
                        continuation,
                    },
                );
            }
            Err(e) => {
                warn!("Failed to spawn {:?}: {}", self.executable, e);
                continuation(Err(ResolveError::Spawn(e.to_string())));
            }
        }
    }

    fn spawn(&self, key: &str, params: &ResolveParams) -> io::Result<(Child, Receiver)> {
        let mut child = Command::new(&self.executable)
            .args(params.args(key))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            kill_and_reap(&mut child);
            return Err(io::Error::other("child stdout not captured"));
        };
        let pipe = Receiver::from(stdout);
        if let Err(e) = pipe.set_nonblocking(true) {
            kill_and_reap(&mut child);
            return Err(e);
        }
        Ok((child, pipe))
    }

    /// Output pipes still open, for the dispatcher's registration table
    pub fn pending_descriptors(&self) -> Vec<(RequestId, RawFd)> {
        self.requests
            .iter()
            .filter_map(|(id, req)| req.pipe.as_ref().map(|pipe| (*id, pipe.as_raw_fd())))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    pub fn cache(&self) -> &ResolveCache {
        &self.cache
    }

    /// Close pipes parked since the last call. Only safe once they are no
    /// longer registered with the poller.
    pub fn release_closed_pipes(&mut self) -> usize {
        let released = self.closed_pipes.len();
        self.closed_pipes.clear();
        released
    }

    /// Drain a readable pipe; at EOF reap the child and complete the request
    pub fn on_pipe_readable(&mut self, id: RequestId) {
        let Some(req) = self.requests.get_mut(&id) else {
            return;
        };
        if !req.drain_pipe() {
            return;
        }
        self.closed_pipes.extend(req.pipe.take());

        match req.child.try_wait() {
            Ok(Some(status)) => self.complete(id, status),
            Ok(None) => debug!("{} output closed, waiting for exit", id),
            Err(e) => {
                warn!("Failed to reap {}: {}", id, e);
                self.finish(id, Err(ResolveError::ExitStatus(e.to_string())));
            }
        }
    }

    /// Reap children that closed their output and kill overdue ones
    pub fn poll_children(&mut self) {
        let now = Instant::now();
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();

        for id in ids {
            let Some(req) = self.requests.get_mut(&id) else { continue };

            if self.timeout.is_some_and(|limit| now.duration_since(req.started) >= limit) {
                warn!("{} for {} timed out", id, req.key);
                kill_and_reap(&mut req.child);
                self.finish(id, Err(ResolveError::Timeout));
                continue;
            }

            if req.pipe.is_some() {
                continue;
            }
            match req.child.try_wait() {
                Ok(Some(status)) => self.complete(id, status),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to reap {}: {}", id, e);
                    self.finish(id, Err(ResolveError::ExitStatus(e.to_string())));
                }
            }
        }
    }

    /// Kill every child; continuations receive `Cancelled`
    pub fn shutdown(&mut self) {
        for (id, mut req) in std::mem::take(&mut self.requests) {
            debug!("Cancelling {}", id);
            kill_and_reap(&mut req.child);
            self.closed_pipes.extend(req.pipe.take());
            (req.continuation)(Err(ResolveError::Cancelled));
        }
    }

    fn complete(&mut self, id: RequestId, status: ExitStatus) {
        let Some(req) = self.requests.get(&id) else { return };
        let result = req.result(status);
        match &result {
            Ok(value) => {
                info!("Resolved {}", req.key);
                self.cache.insert(&req.key, value, Instant::now());
            }
            Err(e) => warn!("Resolve failed for {}: {}", req.key, e),
        }
        self.finish(id, result);
    }

    fn finish(&mut self, id: RequestId, result: Result<String, ResolveError>) {
        if let Some(mut req) = self.requests.remove(&id) {
            self.closed_pipes.extend(req.pipe.take());
            (req.continuation)(result);
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("kill {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        debug!("wait {}: {}", child.id(), e);
    }
}
