//! # cellrund: cellrun daemon
//!
//! Composition root that builds a cell from configuration and runs one
//! waypoint program against it.
//!
//! ## Responsibilities
//! - Parse configuration (env vars, config file)
//! - Build the device registry and the cell
//! - Run the program on a [`ProgramRunner`], logging state samples meanwhile
//! - Turn Ctrl-C into a cooperative stop
//! - Print the final run record as JSON
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer: no domain logic belongs here.

mod config;
mod waypoints;

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use cellrun_app::cell::Cell;
use cellrun_app::registry::DeviceRegistry;
use cellrun_app::runner::{ProgramRunner, StateChangeCallback};
use cellrun_domain::program::Program;
use cellrun_domain::run::{ProgramRun, ProgramRunState};

use crate::config::Config;
use crate::waypoints::WaypointExecutor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .with_writer(std::io::stderr)
        .init();

    // Cell
    let mut registry = DeviceRegistry::new();
    cellrun_adapter_virtual::register(&mut registry)?;
    let cell = Cell::from_configurations(&registry, config.cell.devices.clone())?;
    tracing::info!(devices = ?cell.identifiers().collect::<Vec<_>>(), "cell configured");

    // Program
    let path = config
        .program
        .path
        .as_ref()
        .context("no program configured, set [program].path or CELLRUN_PROGRAM")?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read program {}", path.display()))?;

    let runner = Arc::new(
        ProgramRunner::new(cell, Program::waypoints(content), WaypointExecutor)
            .with_arguments(config.program.arguments.clone()),
    );
    let on_state_change: StateChangeCallback = Arc::new(|run: &ProgramRun| {
        tracing::info!(run = %run.id, state = %run.state, "program run state changed");
    });
    runner.start(false, Some(on_state_change))?;

    let mut joined = tokio::task::spawn_blocking({
        let runner = Arc::clone(&runner);
        move || runner.join()
    });
    let mut states = runner.cell().state_stream(config.state_rate());
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut joined => break outcome?,
            Some(state) = states.next() => {
                tracing::debug!(identifier = %state.identifier, readings = ?state.readings, "device state");
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                tracing::info!("interrupt received, stopping program");
                if let Err(err) = runner.stop(false) {
                    tracing::warn!(%err, "could not stop program");
                }
            }
        }
    };
    drop(states);

    if let Err(err) = &outcome {
        tracing::error!(error = %err, "program did not complete");
    }
    let run = runner.program_run();
    println!("{}", serde_json::to_string_pretty(&run)?);

    if run.state != ProgramRunState::Completed {
        anyhow::bail!("program run {} ended {}", run.id, run.state);
    }
    Ok(())
}
