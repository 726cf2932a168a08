use anyhow::Result;
use tracing::{error, info, warn};

mod alerts;
mod cli;
mod config;
mod control;
mod da;
mod engine;
mod highres;
mod io;
mod orchestrator;
mod precip;
mod state;
mod window;

use cli::get_args;
use config::RunConfig;
use window::SimulationWindow;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = get_args();
    let config = RunConfig::load(&args.config)?;
    let window = SimulationWindow::derive_now(&config)?;

    let mode = if config.hindcast.is_some() {
        "hindcast"
    } else {
        "real-time"
    };
    info!(
        "Starting {} run cycle at {} UTC",
        mode,
        window.current.format("%Y-%m-%d_%H:%M")
    );

    // Archive hygiene never blocks the cycle.
    if let Err(e) =
        precip::cleanup_precip(window.current, &config.precip_dir, &config.qpf_store_dir)
    {
        warn!("Problem cleaning the precip archive: {:#}. Continuing with execution", e);
    }

    let notifier = alerts::LogNotifier::new(config.alerts.recipients.clone());
    let prepared = orchestrator::prepare_standard(&config, &window, &notifier)?;
    info!(
        "Simulation starts at {} and ends at {} while state update ends at {}",
        prepared.start.format("%Y%m%d_%H%M"),
        window.run_end.format("%Y%m%d_%H%M"),
        window.state_save_end.format("%Y%m%d_%H%M")
    );

    if args.dry_run {
        info!("Dry run: control document at {:?}", prepared.control_path);
        return Ok(());
    }

    let stamp = window.output_stamp();
    engine::run_engine(
        &config.engine_binary,
        &config.work_dir,
        &prepared.control_path,
        &stamp,
    )?;
    precip::clear_stage(&config.precip_stage_dir);
    info!("Standard-resolution outputs are ready");

    if let Some(highres_config) = &config.highres {
        // The selector reads the raster this run just wrote; its absence
        // is an engine failure, not a quiet skip.
        if let Err(e) = engine::expect_output_raster(&config.work_dir, "maxunitq", &stamp) {
            error!("High-res rerun skipped: {:#}", e);
            return Ok(());
        }
        match orchestrator::prepare_highres(&config, highres_config, &window, &notifier) {
            Ok(Some(prepared_highres)) => {
                info!(
                    "Running high-res simulation with {} grids",
                    highres_config.resolution_tag
                );
                engine::run_engine(
                    &config.engine_binary,
                    &highres_config.work_dir,
                    &prepared_highres.control_path,
                    &stamp,
                )?;
                precip::clear_stage(&config.precip_stage_dir);
                info!("High-resolution outputs are ready");
            }
            Ok(None) => {}
            // A broken high-res configuration must not take down the
            // cycle; the standard outputs already landed.
            Err(e) => error!("High-res preparation failed: {:#}", e),
        }
    }

    Ok(())
}
