//! Subsystem error types
//!
//! Each subsystem reports an explicit outcome to its caller. None of these
//! are fatal to the process; only a failed listen bind is (see `main`).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Scan-out failures. Init failures degrade the appliance to headless mode;
/// per-frame failures drop the frame and the next tick retries.
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to open display device {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("no connected output with usable modes")]
    NoConnectedOutput,

    #[error("no CRTC can drive connector {0}")]
    NoCrtc(u32),

    #[error("buffer manager allocation failed: {0}")]
    Allocation(String),

    #[error("failed to acquire a swap-chain buffer: {0}")]
    BufferAcquire(String),

    #[error("failed to create framebuffer: {0}")]
    Framebuffer(String),

    #[error("modeset failed: {0}")]
    Modeset(String),

    #[error("page flip failed: {0}")]
    PageFlip(String),

    #[error("GPU context setup failed: {0}")]
    Context(String),

    #[error("display I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a resolve request produced no value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("too many pending resolves")]
    PoolExhausted,

    #[error("failed to spawn resolver: {0}")]
    Spawn(String),

    #[error("resolver exited unsuccessfully ({0})")]
    ExitStatus(String),

    #[error("resolver produced no output")]
    EmptyOutput,

    #[error("resolver timed out")]
    Timeout,

    #[error("resolve cancelled at shutdown")]
    Cancelled,
}
