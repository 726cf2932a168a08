use anyhow::{Context, Result, bail};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;
use tracing::{info, warn};

/// Raster bases the engine writes into its working directory.
const OUTPUT_BASES: &[&str] = &["maxq", "maxunitq", "qpeaccum", "qpfaccum", "maxsm"];

/// The engine returned but the expected output raster never appeared.
/// Distinct from a non-zero exit so callers can report it as such.
#[derive(Debug)]
pub struct MissingEngineOutput {
    pub path: PathBuf,
}

impl fmt::Display for MissingEngineOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine produced no output raster at {:?}", self.path)
    }
}

impl std::error::Error for MissingEngineOutput {}

/// Invoke the simulation engine and block until it exits. Stdout goes to
/// a per-cycle log in the working directory. The call must complete
/// before any output raster is read; the selector depends on the freshly
/// written raster.
pub fn run_engine(binary: &Path, work_dir: &Path, control_path: &Path, stamp: &str) -> Result<()> {
    let log_path = work_dir.join(format!("engine.{}.log", stamp));
    let log = fs::File::create(&log_path)
        .with_context(|| format!("Failed to create engine log: {:?}", log_path))?;

    info!("Invoking engine {:?} with {:?}", binary, control_path);
    let status = Command::new(binary)
        .arg(control_path)
        .stdout(log)
        .status()
        .with_context(|| format!("Failed to launch engine: {:?}", binary))?;
    if !status.success() {
        bail!("simulation engine exited with {}", status);
    }

    rename_outputs(work_dir, stamp);
    Ok(())
}

/// Rename engine outputs to carry the cycle's canonical stamp:
/// `{base}.*.tif` becomes `{base}.{stamp}.tif` (newest wins on
/// collision) and `ts.*.csv` gains the stamp before its extension.
/// Rename failures are transient I/O: logged and skipped.
pub fn rename_outputs(work_dir: &Path, stamp: &str) {
    let Ok(entries) = fs::read_dir(work_dir) else {
        return;
    };
    let names: Vec<String> = entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();

    for base in OUTPUT_BASES {
        let prefix = format!("{}.", base);
        let target_name = format!("{}.{}.tif", base, stamp);
        let candidates: Vec<&String> = names
            .iter()
            .filter(|n| n.starts_with(&prefix) && n.ends_with(".tif") && **n != target_name)
            .collect();
        let Some(latest) = candidates
            .into_iter()
            .max_by_key(|n| modified_time(&work_dir.join(n.as_str())))
        else {
            continue;
        };

        let src = work_dir.join(latest);
        let dest = work_dir.join(&target_name);
        if dest.exists() {
            if let Err(e) = fs::remove_file(&dest) {
                warn!("Could not replace {:?}: {}", dest, e);
                continue;
            }
        }
        if let Err(e) = fs::rename(&src, &dest) {
            warn!("Could not rename {:?} -> {:?}: {}", src, dest, e);
        }
    }

    for name in &names {
        if !name.starts_with("ts.") || !name.ends_with(".csv") || name.ends_with(&format!(".{}.csv", stamp)) {
            continue;
        }
        let stem = &name[..name.len() - ".csv".len()];
        let dest = work_dir.join(format!("{}.{}.csv", stem, stamp));
        let src = work_dir.join(name);
        if dest.exists() {
            if let Err(e) = fs::remove_file(&dest) {
                warn!("Could not replace {:?}: {}", dest, e);
                continue;
            }
        }
        if let Err(e) = fs::rename(&src, &dest) {
            warn!("Could not rename {:?} -> {:?}: {}", src, dest, e);
        }
    }
}

fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Check that an expected output raster exists after invocation. Absence
/// is reported as `MissingEngineOutput`.
pub fn expect_output_raster(work_dir: &Path, base: &str, stamp: &str) -> Result<PathBuf> {
    let path = work_dir.join(format!("{}.{}.tif", base, stamp));
    if crate::state::is_non_zero_file(&path) {
        Ok(path)
    } else {
        Err(MissingEngineOutput { path }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"out").unwrap();
        path
    }

    #[test]
    fn renames_rasters_and_timeseries_to_cycle_stamp() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "maxunitq.tmp.tif");
        touch(dir.path(), "maxq.tmp.tif");
        touch(dir.path(), "ts.gauge_3.csv");
        touch(dir.path(), "unrelated.txt");

        rename_outputs(dir.path(), "20230609.140000");

        assert!(dir.path().join("maxunitq.20230609.140000.tif").exists());
        assert!(dir.path().join("maxq.20230609.140000.tif").exists());
        assert!(dir.path().join("ts.gauge_3.20230609.140000.csv").exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert!(!dir.path().join("maxunitq.tmp.tif").exists());
    }

    #[test]
    fn rename_is_stable_when_rerun() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "maxq.tmp.tif");
        rename_outputs(dir.path(), "20230609.140000");
        rename_outputs(dir.path(), "20230609.140000");
        assert!(dir.path().join("maxq.20230609.140000.tif").exists());
    }

    #[test]
    fn missing_output_is_a_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = expect_output_raster(dir.path(), "maxunitq", "20230609.140000").unwrap_err();
        assert!(err.downcast_ref::<MissingEngineOutput>().is_some());

        touch(dir.path(), "maxunitq.20230609.140000.tif");
        let path = expect_output_raster(dir.path(), "maxunitq", "20230609.140000").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn engine_failure_surfaces_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let control = touch(dir.path(), "control.txt");
        let err = run_engine(Path::new("false"), dir.path(), &control, "stamp").unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[test]
    fn engine_success_runs_rename_pass() {
        let dir = tempfile::tempdir().unwrap();
        let control = touch(dir.path(), "control.txt");
        touch(dir.path(), "maxunitq.tmp.tif");
        run_engine(Path::new("true"), dir.path(), &control, "20230609.140000").unwrap();
        assert!(dir.path().join("maxunitq.20230609.140000.tif").exists());
        assert!(dir.path().join("engine.20230609.140000.log").exists());
    }
}
