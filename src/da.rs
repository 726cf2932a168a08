use crate::config::AssimilationConfig;
use crate::io::series::{self, SeriesRow};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use csv::WriterBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reservoir series files follow `{id}{SERIES_SUFFIX}` in both the manual
/// and the climatology directory.
const SERIES_SUFFIX: &str = "_Vertimiento_Serie.csv";

const CONSOLIDATED_PREFIX: &str = "da.observations.";

/// Which of the two competing sources was selected for a reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Manual,
    Climatology,
}

/// Per-reservoir outcome of source arbitration.
#[derive(Debug, Clone)]
pub struct SourceSelection {
    pub reservoir: String,
    pub source: Source,
    pub path: PathBuf,
}

/// Read the reservoir list: one identifier per line, `#` comments and
/// blank lines skipped. A missing list file is fatal; without it the
/// assimilation step cannot proceed at all.
pub fn read_reservoir_list(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Reservoir list file not found: {:?}", path))?;
    let reservoirs: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    info!("Loaded {} reservoirs from list", reservoirs.len());
    Ok(reservoirs)
}

fn series_path(dir: &Path, reservoir: &str) -> PathBuf {
    dir.join(format!("{}{}", reservoir, SERIES_SUFFIX))
}

/// Parse the manual series for a reservoir and check that its coverage
/// encloses the simulation window. Any parse failure means the source is
/// unusable; the caller falls back to climatology.
fn manual_series_if_covering(
    reservoir: &str,
    manual_dir: &Path,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Option<(PathBuf, Vec<SeriesRow>)> {
    let path = series_path(manual_dir, reservoir);
    if !path.is_file() {
        return None;
    }
    let rows = match series::read_series(&path) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Error reading {:?}: {:#}", path, e);
            return None;
        }
    };
    let (min, max) = series::coverage(&rows)?;
    if min <= start && max >= end {
        Some((path, rows))
    } else {
        None
    }
}

/// Arbitrate sources for every reservoir: manual when it parses and fully
/// encloses the window, climatology otherwise. Climatology files exist by
/// convention and are not re-validated against coverage. Exactly one
/// source per reservoir, never a merge.
pub fn select_sources(
    reservoirs: &[String],
    manual_dir: &Path,
    climatology_dir: &Path,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<SourceSelection> {
    let mut selections = Vec::with_capacity(reservoirs.len());
    let mut manual_count = 0;

    for reservoir in reservoirs {
        let selection = match manual_series_if_covering(reservoir, manual_dir, start, end) {
            Some((path, _)) => {
                manual_count += 1;
                SourceSelection {
                    reservoir: reservoir.clone(),
                    source: Source::Manual,
                    path,
                }
            }
            None => SourceSelection {
                reservoir: reservoir.clone(),
                source: Source::Climatology,
                path: series_path(climatology_dir, reservoir),
            },
        };
        selections.push(selection);
    }

    info!(
        "Source selection complete: {} manual, {} climatology",
        manual_count,
        selections.len() - manual_count
    );
    selections
}

/// Write the consolidated observation table: headerless rows of
/// `(reservoir, MM/DD/YYYY HH:MM, value)`, reservoirs in input order,
/// each clipped to `[start, end]` inclusive with source row order kept.
/// Prior consolidated tables for the run family are deleted first; this
/// is a full replace, never an append. Returns None when no selected
/// series has any row inside the window.
pub fn consolidate(
    selections: &[SourceSelection],
    start: NaiveDateTime,
    end: NaiveDateTime,
    output_dir: &Path,
    cycle_tag: &str,
) -> Result<Option<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output dir: {:?}", output_dir))?;
    remove_prior_tables(output_dir);

    let mut records: Vec<(String, NaiveDateTime, f64)> = Vec::new();
    for selection in selections {
        if !selection.path.is_file() {
            warn!(
                "File not found for {}: {:?}",
                selection.reservoir, selection.path
            );
            continue;
        }
        let rows = match series::read_series(&selection.path) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Error processing {}: {:#}", selection.reservoir, e);
                continue;
            }
        };
        for row in rows {
            if row.time >= start && row.time <= end {
                records.push((selection.reservoir.clone(), row.time, row.value));
            }
        }
    }

    if records.is_empty() {
        warn!("No observation rows to consolidate");
        return Ok(None);
    }

    let path = output_dir.join(format!("{}{}.csv", CONSOLIDATED_PREFIX, cycle_tag));
    let mut wtr = WriterBuilder::new()
        .has_headers(false)
        .from_path(&path)
        .with_context(|| format!("Failed to create consolidated table: {:?}", path))?;
    let count = records.len();
    for (reservoir, time, value) in records {
        wtr.write_record(&[
            reservoir,
            time.format("%m/%d/%Y %H:%M").to_string(),
            value.to_string(),
        ])?;
    }
    wtr.flush()?;
    info!("Consolidated {} observation rows into {:?}", count, path);
    Ok(Some(path))
}

fn remove_prior_tables(output_dir: &Path) {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(CONSOLIDATED_PREFIX) && name.ends_with(".csv") {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("Could not remove {:?}: {}", entry.path(), e);
            }
        }
    }
}

/// Run the full assimilation preparation: read the reservoir list,
/// arbitrate sources, and write the consolidated table.
pub fn prepare_assimilation(
    config: &AssimilationConfig,
    start: NaiveDateTime,
    end: NaiveDateTime,
    cycle_tag: &str,
) -> Result<(Vec<SourceSelection>, Option<PathBuf>)> {
    let reservoirs = read_reservoir_list(&config.list_path)?;
    let selections = select_sources(
        &reservoirs,
        &config.manual_dir,
        &config.climatology_dir,
        start,
        end,
    );
    let consolidated = consolidate(
        &selections,
        start,
        end,
        &config.consolidated_dir,
        cycle_tag,
    )?;
    Ok((selections, consolidated))
}
