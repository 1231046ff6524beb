//! Remote command handling
//!
//! Turns decoded text frames into engine calls, resolver submissions and
//! listing jobs. Replies are returned as [`Outgoing`] messages for the
//! dispatcher to send; resolver completions arrive later as [`AppEvent`]s.

use std::sync::mpsc::Sender;

use qaryx_proto::{RemoteCommand, ServerMessage};
use tracing::{debug, info, warn};

use crate::collab::{DecodeEngine, KeyHandler};
use crate::error::ResolveError;
use crate::protocol::ConnectionId;
use crate::resolver::{ListingJob, ListingResult, ListingWorker, ResolveParams, Resolver};

/// Error text clients see when a stream URL could not be resolved
pub const RESOLVE_FAILED: &str = "yt-dlp resolve failed";

/// Completions flowing back into the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Resolved {
        url: String,
        result: Result<String, ResolveError>,
    },
}

/// A message the dispatcher should send
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Broadcast(ServerMessage),
    Unicast(ConnectionId, ServerMessage),
}

/// Everything a command may act on
pub struct Services<'a> {
    pub engine: &'a mut dyn DecodeEngine,
    pub keys: &'a mut dyn KeyHandler,
    pub resolver: &'a mut Resolver,
    pub listing: Option<&'a ListingWorker>,
}

pub struct CommandRouter {
    params: ResolveParams,
    events: Sender<AppEvent>,
}

impl CommandRouter {
    pub fn new(params: ResolveParams, events: Sender<AppEvent>) -> Self {
        Self { params, events }
    }

    /// Handle one message from `from`
    pub fn handle(&self, from: ConnectionId, payload: &[u8], services: &mut Services<'_>) -> Vec<Outgoing> {
        let command = match RemoteCommand::decode(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring message from {}: {}", from, e);
                return Vec::new();
            }
        };
        debug!("Command from {}: {:?}", from, command);

        match command {
            RemoteCommand::Play { url, kind } => {
                self.play(url, &kind, services);
                Vec::new()
            }
            RemoteCommand::Pause => {
                services.engine.pause_toggle();
                Vec::new()
            }
            RemoteCommand::Stop => {
                services.engine.stop();
                Vec::new()
            }
            RemoteCommand::Seek { seconds } => {
                services.engine.seek(seconds);
                Vec::new()
            }
            RemoteCommand::Volume { level } => {
                services.engine.set_volume(level);
                Vec::new()
            }
            RemoteCommand::Key { key } => {
                services.keys.on_key(&key);
                Vec::new()
            }
            RemoteCommand::Status => vec![Outgoing::Broadcast(ServerMessage::Status(services.engine.status()))],
            RemoteCommand::ChannelVideos { url, max } => {
                let submitted = services
                    .listing
                    .is_some_and(|worker| worker.submit(ListingJob { requester: from, url: url.clone(), max }));
                if submitted {
                    Vec::new()
                } else {
                    warn!("Channel listing unavailable for {}", url);
                    vec![Outgoing::Unicast(
                        from,
                        ServerMessage::Error { msg: "channel listing unavailable".into() },
                    )]
                }
            }
        }
    }

    fn play(&self, url: String, kind: &str, services: &mut Services<'_>) {
        if !RemoteCommand::needs_resolve(&url, kind) {
            let profile = (kind == "iptv").then_some("live");
            services.engine.load(&url, profile);
            return;
        }

        info!("Resolving stream for {}", url);
        let events = self.events.clone();
        let key = url.clone();
        services.resolver.resolve(
            &key,
            &self.params,
            Box::new(move |result| {
                if events.send(AppEvent::Resolved { url, result }).is_err() {
                    debug!("Event loop gone, dropping resolve result");
                }
            }),
        );
    }

    /// Apply a completion that arrived through the event channel
    pub fn on_event(&self, event: AppEvent, engine: &mut dyn DecodeEngine) -> Vec<Outgoing> {
        match event {
            AppEvent::Resolved { url, result: Ok(stream) } => {
                debug!("Playing resolved stream for {}", url);
                engine.load(&stream, None);
                Vec::new()
            }
            AppEvent::Resolved { url, result: Err(ResolveError::Cancelled) } => {
                debug!("Resolve for {} cancelled", url);
                Vec::new()
            }
            AppEvent::Resolved { url, result: Err(e) } => {
                warn!("Cannot play {}: {}", url, e);
                vec![Outgoing::Broadcast(ServerMessage::Error { msg: RESOLVE_FAILED.into() })]
            }
        }
    }
}

/// Reply carrying a finished channel listing
pub fn listing_reply(result: ListingResult) -> Outgoing {
    Outgoing::Unicast(
        result.requester,
        ServerMessage::ChannelVideos { url: result.url, videos: result.videos },
    )
}
