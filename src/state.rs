use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The resolver steps back half the native 60-minute update interval.
const SEARCH_STEP_MINUTES: i64 = 30;

/// True when a file exists and has non-zero size. Content is opaque; this
/// is the only validity check applied to state rasters.
pub fn is_non_zero_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Read-only view over a directory of per-variable, per-timestamp state
/// rasters written by the simulation engine.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a state raster must live at: `{variable}_{YYYYMMDD_HHMM}.tif`.
    /// The convention is load-bearing; discovery and cleanup both parse it.
    pub fn raster_path(&self, variable: &str, time: NaiveDateTime) -> PathBuf {
        self.dir
            .join(format!("{}_{}.tif", variable, time.format("%Y%m%d_%H%M")))
    }

    pub fn has_state(&self, variable: &str, time: NaiveDateTime) -> bool {
        is_non_zero_file(&self.raster_path(variable, time))
    }
}

/// Outcome of the warm-start search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateResolution {
    /// Whether a timestamp with the complete variable set was found.
    pub found: bool,
    /// The start time to run from: the resolved timestamp on success, the
    /// desired timestamp on failure (cold start).
    pub start: NaiveDateTime,
}

impl StateResolution {
    pub fn at_desired(&self, desired: NaiveDateTime) -> bool {
        self.found && self.start == desired
    }
}

/// Find the most recent timestamp at which every variable has a valid
/// raster. Linear backtracking from `desired` down to `floor` in 30-minute
/// steps; read-only probing, no side effects.
pub fn resolve_start(
    store: &StateStore,
    variables: &[String],
    desired: NaiveDateTime,
    floor: NaiveDateTime,
) -> StateResolution {
    info!("Looking for states in {:?}", store.dir());

    let mut candidate = desired;
    while candidate > floor {
        let mut missing = false;
        for variable in variables {
            let path = store.raster_path(variable, candidate);
            if !is_non_zero_file(&path) {
                info!("Missing start state: {:?}", path);
                missing = true;
            }
        }
        if !missing {
            info!(
                "Found all states for time: {}",
                candidate.format("%Y%m%d_%H%M")
            );
            return StateResolution {
                found: true,
                start: candidate,
            };
        }
        candidate -= Duration::minutes(SEARCH_STEP_MINUTES);
    }

    StateResolution {
        found: false,
        start: desired,
    }
}

/// Copy the subset of state rasters the high-resolution rerun needs into
/// its disjoint state directory. A file is copied when absent or older
/// than the source; copy failures are logged and skipped.
pub fn sync_states(
    source: &StateStore,
    target: &StateStore,
    variables: &[String],
) -> Result<usize> {
    if variables.is_empty() {
        return Ok(0);
    }
    fs::create_dir_all(target.dir())
        .with_context(|| format!("Failed to create state dir: {:?}", target.dir()))?;

    let mut copied = 0;
    let entries = fs::read_dir(source.dir())
        .with_context(|| format!("Failed to read state dir: {:?}", source.dir()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let wanted = variables
            .iter()
            .any(|v| name.starts_with(&format!("{}_", v)) && name.ends_with(".tif"));
        if !wanted {
            continue;
        }
        let src = entry.path();
        let dest = target.dir().join(&name);
        if src == dest {
            continue;
        }
        let stale = match (fs::metadata(&src), fs::metadata(&dest)) {
            (Ok(s), Ok(d)) => match (s.modified(), d.modified()) {
                (Ok(sm), Ok(dm)) => sm > dm,
                _ => true,
            },
            (Ok(_), Err(_)) => true,
            _ => false,
        };
        if stale {
            match fs::copy(&src, &dest) {
                Ok(_) => copied += 1,
                Err(e) => warn!("Unable to copy state {:?} -> {:?}: {}", src, dest, e),
            }
        }
    }

    if copied > 0 {
        info!("Synced {} state file(s) into {:?}", copied, target.dir());
    }
    Ok(copied)
}
