//! Collaborator boundary
//!
//! The decode/render engine, the input device and the UI key handling live
//! outside the core. The dispatcher talks to them only through these traits.

use std::ffi::c_void;
use std::os::fd::RawFd;

use qaryx_proto::{PlaybackState, PlaybackStatus};
use tracing::{debug, info};

/// Decode/render engine: a wakeup descriptor, an event drain, per-frame
/// rendering into the current buffer, and playback controls.
pub trait DecodeEngine {
    /// Descriptor that becomes readable when the engine has events
    fn wakeup_fd(&self) -> Option<RawFd> {
        None
    }

    /// Drain pending engine events after a wakeup
    fn drain_events(&mut self) {}

    /// Hand over the GL procedure-address resolver of the render context
    fn attach_gl(&mut self, _resolver: &dyn Fn(&str) -> *const c_void) {}

    /// Produce pixels into the current swap-chain buffer
    fn render(&mut self, _width: u32, _height: u32) {}

    /// Start playback; `profile` selects engine tuning ("live" for IPTV)
    fn load(&mut self, url: &str, profile: Option<&str>);
    fn pause_toggle(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, seconds: f64);
    fn set_volume(&mut self, level: u8);

    fn status(&self) -> PlaybackStatus;
}

/// Input device: a readable descriptor plus a key-event drain
pub trait InputDevice {
    fn raw_fd(&self) -> RawFd;

    /// Key names ("up", "ok", "back", ...) pressed since the last drain
    fn drain_keys(&mut self) -> Vec<String>;
}

/// Consumer of key presses (UI navigation)
pub trait KeyHandler {
    fn on_key(&mut self, key: &str);
}

/// Engine stand-in for builds without a decoder: tracks the requested
/// playback state so status pushes stay meaningful.
#[derive(Debug, Default)]
pub struct IdleEngine {
    status: PlaybackStatus,
}

impl IdleEngine {
    pub fn new(volume: u8) -> Self {
        Self {
            status: PlaybackStatus { volume: volume.min(100), ..Default::default() },
        }
    }
}

impl DecodeEngine for IdleEngine {
    fn load(&mut self, url: &str, profile: Option<&str>) {
        info!("Engine: load {} (profile={})", url, profile.unwrap_or("none"));
        self.status.url = url.to_string();
        self.status.state = PlaybackState::Playing;
        self.status.position = 0.0;
        self.status.duration = 0.0;
        self.status.paused = false;
    }

    fn pause_toggle(&mut self) {
        match self.status.state {
            PlaybackState::Playing => {
                self.status.state = PlaybackState::Paused;
                self.status.paused = true;
            }
            PlaybackState::Paused => {
                self.status.state = PlaybackState::Playing;
                self.status.paused = false;
            }
            _ => {}
        }
    }

    fn stop(&mut self) {
        let volume = self.status.volume;
        self.status = PlaybackStatus { volume, ..Default::default() };
    }

    fn seek(&mut self, seconds: f64) {
        if self.status.state != PlaybackState::Idle {
            self.status.position = (self.status.position + seconds).max(0.0);
        }
    }

    fn set_volume(&mut self, level: u8) {
        self.status.volume = level.min(100);
    }

    fn status(&self) -> PlaybackStatus {
        self.status.clone()
    }
}

/// Key handler used when no UI is attached
#[derive(Debug, Default)]
pub struct LogKeys;

impl KeyHandler for LogKeys {
    fn on_key(&mut self, key: &str) {
        debug!("Key: {}", key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_engine_tracks_requests() {
        let mut engine = IdleEngine::new(120);
        assert_eq!(engine.status().volume, 100);
        assert_eq!(engine.status().state, PlaybackState::Idle);

        engine.load("http://a/b.m3u8", Some("live"));
        engine.seek(-5.0);
        engine.seek(12.5);
        engine.pause_toggle();
        let status = engine.status();
        assert_eq!(status.url, "http://a/b.m3u8");
        assert_eq!(status.state, PlaybackState::Paused);
        assert!(status.paused);
        assert_eq!(status.position, 12.5);

        engine.set_volume(30);
        engine.stop();
        assert_eq!(engine.status(), PlaybackStatus { volume: 30, ..Default::default() });
    }
}
