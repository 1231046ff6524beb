//! Qaryx remote-control protocol
//!
//! The leaf of the appliance core: the WebSocket-compatible handshake token,
//! binary frame encoding/decoding, and the JSON message types that travel
//! inside text frames between the appliance and its remote controllers.

pub mod frame;
pub mod handshake;

pub use frame::{decode_frame, encode_text, Frame, FrameError, Opcode};
pub use handshake::{accept_key, extract_key, find_header_end, upgrade_response};

use serde::{Deserialize, Serialize};

// ============================================================================
// Remote → Appliance Commands
// ============================================================================

/// Commands sent by a remote controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Play a URL. YouTube links are resolved to a stream URL first.
    Play {
        url: String,
        /// Content hint: "youtube", "iptv", "direct" or empty
        #[serde(default, rename = "type")]
        kind: String,
    },

    /// Toggle pause
    Pause,

    /// Stop playback
    Stop,

    /// Relative seek in seconds
    Seek {
        #[serde(default)]
        seconds: f64,
    },

    /// Set volume (0-100)
    Volume {
        #[serde(default = "default_volume")]
        level: u8,
    },

    /// Forward a remote key press to the UI
    Key { key: String },

    /// Request an immediate status push
    Status,

    /// List the latest videos of a channel
    ChannelVideos {
        url: String,
        #[serde(default = "default_listing_max")]
        max: usize,
    },
}

fn default_volume() -> u8 {
    80
}

fn default_listing_max() -> usize {
    20
}

impl RemoteCommand {
    /// Decode a command from a text frame payload
    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// True when a play request targets a URL that needs resolving
    pub fn needs_resolve(url: &str, kind: &str) -> bool {
        kind == "youtube" || url.contains("youtube.com") || url.contains("youtu.be")
    }
}

// ============================================================================
// Appliance → Remote Messages
// ============================================================================

/// Playback state reported by the decode engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Error,
}

/// Snapshot of the decode engine, pushed periodically to every client
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub url: String,
    pub position: f64,
    pub duration: f64,
    pub volume: u8,
    pub paused: bool,
}

/// One entry of a channel listing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    pub channel: String,
    pub duration: u64,
    pub thumbnail: String,
}

/// Messages sent from the appliance to remote controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Periodic playback status
    Status(PlaybackStatus),

    /// Something the client asked for failed
    Error { msg: String },

    /// Result of a `channel_videos` command
    ChannelVideos { url: String, videos: Vec<VideoEntry> },
}

impl ServerMessage {
    /// Encode the message as a JSON text payload
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
