use crate::alerts::{Notifier, evaluate_state_alert};
use crate::config::{HighResConfig, RunConfig};
use crate::control::{ControlValues, write_control_document};
use crate::da;
use crate::highres;
use crate::precip;
use crate::state::{StateStore, resolve_start, sync_states};
use crate::window::SimulationWindow;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Everything a caller needs to invoke the engine for one path.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub control_path: PathBuf,
    /// Actual warm-start time; equals the window's search start on a cold
    /// start.
    pub start: NaiveDateTime,
    pub state_found: bool,
}

/// Per-run working directory handle: the previous cycle's contents are
/// removed and the directory recreated before any artifact is written.
pub fn reset_work_dir(dir: &Path) -> Result<()> {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not clear work dir {:?}: {}", dir, e);
        }
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create work dir: {:?}", dir))
}

fn dir_string(dir: &Path) -> String {
    let mut s = dir.display().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Resolve states, apply the alert policy, and render one control
/// document. Shared between the standard and high-resolution paths; the
/// two differ only in their state directory, variable set, template and
/// working directory.
fn prepare_path(
    config: &RunConfig,
    window: &SimulationWindow,
    notifier: &dyn Notifier,
    states_dir: &Path,
    state_variables: &[String],
    template_path: &Path,
    work_dir: &Path,
) -> Result<PreparedRun> {
    let store = StateStore::new(states_dir);
    let resolution = resolve_start(
        &store,
        state_variables,
        window.search_start,
        window.fail_floor,
    );

    if let Some(alert) =
        evaluate_state_alert(&resolution, window.search_start, window.current, &config.system_name())
    {
        if config.alerts.enabled {
            notifier.notify(&alert);
        } else {
            info!("Alert suppressed (alerts disabled): {}", alert.subject);
        }
    }

    reset_work_dir(work_dir)?;

    let values = ControlValues {
        output_path: dir_string(work_dir),
        states_path: dir_string(states_dir),
        time_begin: resolution.start,
        time_warm_end: window.warmup_end,
        time_state: window.state_save_end,
        time_end: window.run_end,
        time_begin_forecast: window.forecast_start,
        forecast_timestep: window.forecast_timestep.clone(),
        system_model: config.system_model.clone(),
    };
    let control_path = write_control_document(
        template_path,
        work_dir,
        &config.subdomain,
        &values,
        window.forecast_mode,
        resolution.found,
    )?;

    Ok(PreparedRun {
        control_path,
        start: resolution.start,
        state_found: resolution.found,
    })
}

/// Prepare the standard-resolution run: stage precipitation, prepare data
/// assimilation when configured, resolve states, and render the control
/// document. A missing reservoir list aborts this path; individual
/// missing observation sources never do.
pub fn prepare_standard(
    config: &RunConfig,
    window: &SimulationWindow,
    notifier: &dyn Notifier,
) -> Result<PreparedRun> {
    precip::stage_precip(&config.precip_dir, &config.precip_stage_dir)?;

    if let Some(assimilation) = &config.assimilation {
        let (selections, consolidated) = da::prepare_assimilation(
            assimilation,
            window.search_start,
            window.run_end,
            &window.cycle_tag(),
        )?;
        info!(
            "Assimilation prepared for {} reservoir(s), consolidated table: {:?}",
            selections.len(),
            consolidated
        );
    }

    prepare_path(
        config,
        window,
        notifier,
        &config.states_dir,
        &config.state_variables,
        &config.template_path(),
        &config.work_dir,
    )
}

/// Prepare the optional high-resolution rerun. Returns Ok(None) when the
/// rerun should be skipped: missing prerequisites, no gauge footprint
/// over threshold, or fewer surviving gauges than the configured minimum.
pub fn prepare_highres(
    config: &RunConfig,
    highres_config: &HighResConfig,
    window: &SimulationWindow,
    notifier: &dyn Notifier,
) -> Result<Option<PreparedRun>> {
    let template_path = config.template_dir.join(&highres_config.template);
    let mut missing = Vec::new();
    if !highres_config.mask_grid.is_file() {
        missing.push(format!("mask grid missing ({:?})", highres_config.mask_grid));
    }
    if !highres_config.gauge_list.is_file() {
        missing.push(format!("gauge list missing ({:?})", highres_config.gauge_list));
    }
    if !template_path.is_file() {
        missing.push(format!("high-res template missing ({:?})", template_path));
    }
    if !missing.is_empty() {
        for issue in &missing {
            warn!("High-res rerun skipped: {}", issue);
        }
        return Ok(None);
    }

    let output_raster = config
        .work_dir
        .join(format!("maxunitq.{}.tif", window.output_stamp()));
    let selection = highres::prepare_highres_control(
        &output_raster,
        &highres_config.mask_grid,
        &highres_config.gauge_list,
        &template_path,
        highres_config.threshold,
        &format!("{}_{}", config.subdomain, highres_config.resolution_tag),
    )?;

    let required = highres_config.min_gauges.max(1);
    if selection.count() < required {
        info!(
            "High-res rerun skipped (selected {} gauge(s), needs at least {})",
            selection.count(),
            required
        );
        return Ok(None);
    }

    info!(
        "Preparing the high-resolution run ({} gauges)",
        selection.count()
    );
    // The shared ingest folder is cleared after each engine run, so the
    // high-res pass stages its own copy.
    precip::stage_precip(&config.precip_dir, &config.precip_stage_dir)?;
    sync_states(
        &StateStore::new(&config.states_dir),
        &StateStore::new(&highres_config.states_dir),
        &highres_config.state_variables,
    )?;

    let prepared = prepare_path(
        config,
        window,
        notifier,
        &highres_config.states_dir,
        &highres_config.state_variables,
        &template_path,
        &highres_config.work_dir,
    )?;
    Ok(Some(prepared))
}
