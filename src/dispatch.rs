//! Event Dispatcher
//!
//! Owns the single mio `Poll`, the table mapping every registered descriptor
//! to what it is, and all subsystem state. One bounded-wait poll per
//! iteration; handlers run to completion on this thread.
//!
//! mio is edge-triggered, so every handler drains its source until it would
//! block.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use qaryx_proto::ServerMessage;
use tracing::{debug, info, warn};

use crate::collab::{DecodeEngine, InputDevice, KeyHandler};
use crate::commands::{listing_reply, AppEvent, CommandRouter, Outgoing, Services};
use crate::config::Config;
use crate::display::PresentOutcome;
use crate::protocol::{ConnectionId, Endpoint};
use crate::render::DisplaySink;
use crate::resolver::{ListingWorker, RequestId, ResolveParams, Resolver};
use crate::timer::FrameTimer;

/// Frame ticks between display counter logs
const STATS_LOG_TICKS: u64 = 300;

/// What a registered descriptor is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Display,
    Input,
    Listen,
    Client(ConnectionId),
    ResolverPipe(RequestId),
    EngineWakeup,
    Timer,
    ListingReady,
}

/// Token <-> tag table. The dispatcher is its only mutator.
#[derive(Debug, Default)]
pub struct Registrations {
    tags: HashMap<Token, Tag>,
    tokens: HashMap<Tag, (Token, Option<RawFd>)>,
    next_token: usize,
}

impl Registrations {
    fn allocate(&mut self, tag: Tag, fd: Option<RawFd>) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.tags.insert(token, tag);
        self.tokens.insert(tag, (token, fd));
        token
    }

    /// Register `fd` for readability under `tag`
    pub fn register(&mut self, registry: &Registry, fd: RawFd, tag: Tag) -> io::Result<Token> {
        let token = Token(self.next_token);
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        Ok(self.allocate(tag, Some(fd)))
    }

    /// Reserve a token for a source that registers itself (a `Waker`)
    pub fn reserve(&mut self, tag: Tag) -> Token {
        self.allocate(tag, None)
    }

    /// Drop `tag` from the table and the poll set. A descriptor that is
    /// already closed has left the poll set by itself.
    pub fn deregister(&mut self, registry: &Registry, tag: Tag) {
        let Some((token, fd)) = self.tokens.remove(&tag) else {
            return;
        };
        self.tags.remove(&token);
        if let Some(fd) = fd {
            if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                debug!("Deregister {:?} (fd {}): {}", tag, fd, e);
            }
        }
    }

    pub fn tag(&self, token: Token) -> Option<Tag> {
        self.tags.get(&token).copied()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.tokens.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Resolver pipes currently registered
    pub fn resolver_pipes(&self) -> BTreeMap<RequestId, RawFd> {
        self.tokens
            .iter()
            .filter_map(|(tag, (_, fd))| match (tag, fd) {
                (Tag::ResolverPipe(id), Some(fd)) => Some((*id, *fd)),
                _ => None,
            })
            .collect()
    }
}

/// Registration changes that bring the table in line with the resolver
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PipeDiff {
    pub removed: Vec<RequestId>,
    pub added: Vec<(RequestId, RawFd)>,
}

/// Compare last cycle's registered pipes with the resolver's live set.
///
/// A request whose descriptor number changed counts as removed and added.
pub fn diff_pipes(registered: &BTreeMap<RequestId, RawFd>, live: &[(RequestId, RawFd)]) -> PipeDiff {
    let live_map: BTreeMap<RequestId, RawFd> = live.iter().copied().collect();

    let removed = registered
        .iter()
        .filter(|&(id, fd)| live_map.get(id) != Some(fd))
        .map(|(id, _)| *id)
        .collect();
    let added = live_map
        .iter()
        .filter(|&(id, fd)| registered.get(id) != Some(fd))
        .map(|(id, fd)| (*id, *fd))
        .collect();

    PipeDiff { removed, added }
}

/// Collaborators plugged in at the composition root
pub struct Collaborators {
    pub display: Option<Box<dyn DisplaySink>>,
    pub engine: Box<dyn DecodeEngine>,
    pub input: Option<Box<dyn InputDevice>>,
    pub keys: Box<dyn KeyHandler>,
}

pub struct Dispatcher {
    poll: Poll,
    registrations: Registrations,
    endpoint: Endpoint,
    resolver: Resolver,
    listing: Option<ListingWorker>,
    router: CommandRouter,
    app_events: Receiver<AppEvent>,
    timer: FrameTimer,
    display: Option<Box<dyn DisplaySink>>,
    engine: Box<dyn DecodeEngine>,
    input: Option<Box<dyn InputDevice>>,
    keys: Box<dyn KeyHandler>,
    poll_timeout: Duration,
    status_every: u64,
    ticks: u64,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(config: &Config, endpoint: Endpoint, collab: Collaborators, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let poll = Poll::new().context("Failed to create poll instance")?;
        let mut registrations = Registrations::default();
        let registry = poll.registry();

        registrations
            .register(registry, endpoint.listener_fd(), Tag::Listen)
            .context("Failed to register listen socket")?;

        let timer = FrameTimer::new(config.event_loop.frame_interval()).context("Failed to create frame timer")?;
        registrations
            .register(registry, timer.raw_fd(), Tag::Timer)
            .context("Failed to register frame timer")?;

        let display = collab.display;
        if let Some(display) = &display {
            registrations
                .register(registry, display.raw_fd(), Tag::Display)
                .context("Failed to register display")?;
        }
        if let Some(input) = &collab.input {
            registrations
                .register(registry, input.raw_fd(), Tag::Input)
                .context("Failed to register input device")?;
        }
        if let Some(fd) = collab.engine.wakeup_fd() {
            registrations
                .register(registry, fd, Tag::EngineWakeup)
                .context("Failed to register engine wakeup")?;
        }

        let listing_token = registrations.reserve(Tag::ListingReady);
        let listing = Waker::new(registry, listing_token)
            .and_then(|waker| ListingWorker::spawn(&config.resolver, waker));
        let listing = match listing {
            Ok(worker) => Some(worker),
            Err(e) => {
                warn!("Channel listing disabled: {}", e);
                None
            }
        };

        let (events_tx, app_events) = mpsc::channel();
        let router = CommandRouter::new(ResolveParams::from_config(&config.resolver), events_tx);

        let has_display = display.is_some();
        info!(
            "Dispatcher ready: display={} frame={:?} poll={:?}",
            has_display,
            timer.interval(),
            config.event_loop.poll_timeout()
        );

        Ok(Self {
            poll,
            registrations,
            endpoint,
            resolver: Resolver::new(&config.resolver),
            listing,
            router,
            app_events,
            timer,
            display,
            engine: collab.engine,
            input: collab.input,
            keys: collab.keys,
            poll_timeout: config.event_loop.poll_timeout(),
            status_every: u64::from(config.event_loop.status_every_ticks),
            ticks: 0,
            shutdown,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    /// Loop until the shutdown flag is raised, then release everything
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(64);
        while !self.shutdown.load(Ordering::Relaxed) {
            self.run_once(&mut events)?;
        }
        info!("Shutting down");
        self.teardown();
        Ok(())
    }

    /// One poll cycle
    pub fn run_once(&mut self, events: &mut Events) -> Result<()> {
        self.sync_resolver_pipes();

        match self.poll.poll(events, Some(self.poll_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).context("poll failed"),
        }

        let tags: Vec<Tag> = events
            .iter()
            .filter_map(|event| self.registrations.tag(event.token()))
            .collect();
        for tag in tags {
            self.handle(tag);
        }

        self.resolver.poll_children();
        self.drain_app_events();
        self.reap_connections();
        Ok(())
    }

    fn handle(&mut self, tag: Tag) {
        match tag {
            Tag::Display => {
                if let Some(display) = self.display.as_mut() {
                    display.on_readable();
                }
            }
            Tag::Input => self.on_input(),
            Tag::Listen => self.on_accept(),
            Tag::Client(id) => self.on_client(id),
            Tag::ResolverPipe(id) => self.resolver.on_pipe_readable(id),
            Tag::EngineWakeup => self.engine.drain_events(),
            Tag::Timer => self.on_timer(),
            Tag::ListingReady => self.on_listing_ready(),
        }
    }

    /// Bring resolver pipe registrations in line with the live requests.
    /// Finished pipes are still open here; they are deregistered first and
    /// only then closed.
    fn sync_resolver_pipes(&mut self) {
        let diff = diff_pipes(&self.registrations.resolver_pipes(), &self.resolver.pending_descriptors());
        let registry = self.poll.registry();

        for id in diff.removed {
            self.registrations.deregister(registry, Tag::ResolverPipe(id));
        }
        self.resolver.release_closed_pipes();
        for (id, fd) in diff.added {
            if let Err(e) = self.registrations.register(registry, fd, Tag::ResolverPipe(id)) {
                warn!("Failed to watch {} (fd {}): {}", id, fd, e);
            }
        }
    }

    fn on_input(&mut self) {
        let Some(input) = self.input.as_mut() else { return };
        for key in input.drain_keys() {
            self.keys.on_key(&key);
        }
    }

    fn on_accept(&mut self) {
        for id in self.endpoint.accept() {
            let Some(fd) = self.endpoint.connection(id).map(|conn| conn.raw_fd()) else {
                continue;
            };
            if let Err(e) = self.registrations.register(self.poll.registry(), fd, Tag::Client(id)) {
                warn!("Failed to watch client {}: {}", id, e);
                self.endpoint.remove(id);
            }
        }
    }

    fn on_client(&mut self, id: ConnectionId) {
        for message in self.endpoint.on_readable(id) {
            let mut services = Services {
                engine: self.engine.as_mut(),
                keys: self.keys.as_mut(),
                resolver: &mut self.resolver,
                listing: self.listing.as_ref(),
            };
            let outgoing = self.router.handle(id, &message, &mut services);
            self.deliver(outgoing);
        }
    }

    fn on_timer(&mut self) {
        if !self.timer.take_tick() {
            return;
        }
        self.ticks += 1;

        if let Some(display) = self.display.as_mut() {
            let engine = &mut self.engine;
            match display.submit_frame(&mut |width, height| engine.render(width, height)) {
                Ok(PresentOutcome::Dropped) => debug!("Frame dropped, flip still pending"),
                Ok(_) => {}
                Err(e) => warn!("Frame not presented: {}", e),
            }
            if self.ticks % STATS_LOG_TICKS == 0 {
                let stats = display.stats();
                debug!(
                    "Display: presented={} flipped={} dropped={}",
                    stats.presented, stats.flipped, stats.dropped
                );
            }
        }

        if self.status_every > 0 && self.ticks % self.status_every == 0 && !self.endpoint.is_empty() {
            self.broadcast_status();
        }
    }

    fn on_listing_ready(&mut self) {
        let Some(listing) = self.listing.as_ref() else { return };
        let replies: Vec<Outgoing> = listing.drain().into_iter().map(listing_reply).collect();
        self.deliver(replies);
    }

    fn broadcast_status(&mut self) {
        let status = ServerMessage::Status(self.engine.status());
        self.deliver(vec![Outgoing::Broadcast(status)]);
    }

    fn drain_app_events(&mut self) {
        while let Ok(event) = self.app_events.try_recv() {
            let outgoing = self.router.on_event(event, self.engine.as_mut());
            self.deliver(outgoing);
        }
    }

    fn deliver(&mut self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            let (target, message) = match out {
                Outgoing::Broadcast(message) => (None, message),
                Outgoing::Unicast(id, message) => (Some(id), message),
            };
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {:?}: {}", message, e);
                    continue;
                }
            };
            match target {
                None => self.endpoint.broadcast(&text),
                Some(id) => {
                    if !self.endpoint.send(id, &text) {
                        debug!("Reply to {} not delivered", id);
                    }
                }
            }
        }
    }

    fn reap_connections(&mut self) {
        let registry = self.poll.registry();
        for (id, _conn) in self.endpoint.take_closed() {
            self.registrations.deregister(registry, Tag::Client(id));
        }
    }

    fn teardown(&mut self) {
        self.resolver.shutdown();
        // cancelled resolves are not reported to anyone
        while self.app_events.try_recv().is_ok() {}
        self.sync_resolver_pipes();

        let registry = self.poll.registry();
        for (id, _conn) in self.endpoint.take_all() {
            self.registrations.deregister(registry, Tag::Client(id));
        }
        self.listing.take();
        self.display.take();
    }
}
