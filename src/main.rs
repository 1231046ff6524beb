//! Qaryx appliance daemon

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use qaryx::collab::{IdleEngine, LogKeys};
use qaryx::config::Config;
use qaryx::protocol::Endpoint;
use qaryx::render::DisplaySink;
use qaryx::{Collaborators, Dispatcher};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn parse_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(config)
}

#[cfg(feature = "kms")]
fn open_display(config: &Config, engine: &mut IdleEngine) -> Option<Box<dyn DisplaySink>> {
    use qaryx::collab::DecodeEngine;

    if !config.display.enabled {
        info!("Display disabled, running headless");
        return None;
    }
    match qaryx::render::egl::open(&config.display) {
        Ok(bridge) => {
            engine.attach_gl(&|name| bridge.surface().proc_address(name));
            Some(Box::new(bridge))
        }
        Err(e) => {
            warn!("Display init failed, running headless: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "kms"))]
fn open_display(config: &Config, _engine: &mut IdleEngine) -> Option<Box<dyn DisplaySink>> {
    if config.display.enabled {
        warn!("Built without KMS support, running headless");
    }
    None
}

fn run() -> Result<()> {
    let config = Config::load(parse_args()?.as_deref())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGHUP] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("Failed to install handler for signal {}", signal))?;
    }

    let mut engine = IdleEngine::new(config.engine.volume);
    let display = open_display(&config, &mut engine);

    let endpoint = Endpoint::bind(&config.server)?;
    let collab = Collaborators {
        display,
        engine: Box::new(engine),
        input: None,
        keys: Box::new(LogKeys),
    };

    let mut dispatcher = Dispatcher::new(&config, endpoint, collab, shutdown)?;
    dispatcher.run()
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "qaryx=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting qaryx {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run() {
        error!("Fatal: {:#}", e);
        return Err(e);
    }
    info!("Stopped");
    Ok(())
}
