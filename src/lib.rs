//! Qaryx - control core of a TV media appliance
//!
//! A single-threaded event loop drives KMS scan-out, a WebSocket-compatible
//! remote-control endpoint and an external stream-URL resolver.

pub mod collab;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod error;
pub mod protocol;
pub mod render;
pub mod resolver;
pub mod timer;

pub use config::Config;
pub use dispatch::{Collaborators, Dispatcher};
pub use error::{DisplayError, ResolveError};
