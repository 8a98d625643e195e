#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

use nix::unistd::execve;
use std::{convert::Infallible, io, process::exit};
use tracing_subscriber::EnvFilter;

use memo_rs::{
    cache::{self, Slot, Store},
    command::Command,
    config::Config,
    diag::{Log, Result},
    input::{self, args},
    replay,
    tracer::{self, Outcome},
};

/// Run the command untraced, in place of this process.
fn pass_through(command: &Command) -> Result<Infallible> {
    let argv = command.c_argv()?;
    match execve(&argv[0], &argv, &input::env()?) {
        Ok(never) => match never {},
        Err(e) => Err(e.into()),
    }
}

fn main() -> Result<()> {
    let command = Command::here(args()?)?;
    let config = Config::load()?;

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    if !config.replay && !config.record {
        pass_through(&command)?;
    }
    let store = cache::Dir::new(&config.dir)?;
    if config.replay {
        if let Some(hit) = cache::lookup(&store, &command, &Log)? {
            tracing::info!("replaying {:?}", command.argv());
            // Only returns on failure; the command is then run for real.
            if let Some(e) = replay::replay(&hit.trace, &hit.root, &Log).err() {
                tracing::warn!("replay failed, running the command: {}", e.message());
            }
        }
    }
    if !config.record {
        tracing::info!("recording disabled, running {:?}", command.argv());
        pass_through(&command)?;
    }

    let slot = store.put(&command)?;
    let spy = config.spy()?;
    let outcome = tracer::record(&command, config.mode()?, spy.as_deref(), slot.root(), &Log)?;
    let status = outcome.exit_status();
    match outcome {
        Outcome::Complete(trace) => slot.commit(&trace)?,
        Outcome::Uncacheable { reason, .. } => {
            tracing::info!("not cached: {reason}");
        }
    }
    exit(status)
}
