use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// How many of the newest archive files are held back from staging; they
/// may still be mid-download when the cycle starts.
const STAGE_HOLDBACK: usize = 4;

/// Extract the 12-digit `YYYYMMDDHHMM` stamp carried as a dot-delimited
/// filename segment (e.g. `imerg.qpe.202306062030.30minAccum.tif`). This
/// convention is load-bearing: staging and cleanup both parse it.
pub fn filename_stamp(name: &str) -> Option<NaiveDateTime> {
    name.split('.')
        .filter(|segment| segment.len() == 12 && segment.bytes().all(|b| b.is_ascii_digit()))
        .find_map(|segment| NaiveDateTime::parse_from_str(segment, "%Y%m%d%H%M").ok())
}

fn list_tifs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read precip dir: {:?}", dir))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".tif") {
            names.push(name);
        }
    }
    Ok(names)
}

/// Stage precipitation rasters from the archive folder into the engine
/// ingest folder. Files are ordered by embedded stamp and the newest
/// `STAGE_HOLDBACK` are left behind; staged forecast (`qpf`) segments are
/// renamed to `qpe` so the engine ingests one uniform series.
pub fn stage_precip(precip_dir: &Path, stage_dir: &Path) -> Result<usize> {
    fs::create_dir_all(stage_dir)
        .with_context(|| format!("Failed to create stage dir: {:?}", stage_dir))?;

    let mut names = list_tifs(precip_dir)?;
    // Stamps are zero-padded, so the lexicographic sort is chronological;
    // unstamped names sort first and are staged unconditionally.
    names.sort_by_key(|name| {
        filename_stamp(name)
            .map(|t| t.format("%Y%m%d%H%M").to_string())
            .unwrap_or_default()
    });

    let keep = if names.len() > STAGE_HOLDBACK {
        names.len() - STAGE_HOLDBACK
    } else {
        names.len()
    };

    let mut staged = 0;
    for name in &names[..keep] {
        let dest_name = name.replace("qpf", "qpe");
        let src = precip_dir.join(name);
        let dest = stage_dir.join(&dest_name);
        match fs::copy(&src, &dest) {
            Ok(_) => staged += 1,
            Err(e) => warn!("Could not stage {:?}: {}", src, e),
        }
    }
    info!("Staged {} precip file(s) into {:?}", staged, stage_dir);
    Ok(staged)
}

/// Remove all staged precip files after a run so the next cycle starts
/// from a clean ingest folder. Failures are logged and skipped.
pub fn clear_stage(stage_dir: &Path) {
    let Ok(entries) = fs::read_dir(stage_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if let Err(e) = fs::remove_file(entry.path()) {
            warn!("Could not remove staged file {:?}: {}", entry.path(), e);
        }
    }
}

/// Clean the precipitation archive for the current cycle:
/// - observed (`qpe`) rasters older than 9.5 h are deleted;
/// - forecast (`qpf`) rasters older than the cycle time move to the QPF
///   store (they are superseded by observations);
/// - observed rasters newer than the 4 h latency horizon are deleted as
///   likely duplicates;
/// - stored QPF rasters older than 4 h are purged.
///
/// Every per-file failure is transient I/O: logged, skipped, never
/// escalated.
pub fn cleanup_precip(current: NaiveDateTime, precip_dir: &Path, qpf_store: &Path) -> Result<()> {
    fs::create_dir_all(qpf_store)
        .with_context(|| format!("Failed to create QPF store: {:?}", qpf_store))?;

    let qpe_cutoff = current - Duration::minutes(9 * 60 + 30);
    let latency_horizon = current - Duration::hours(4);

    for name in list_tifs(precip_dir)? {
        let Some(stamp) = filename_stamp(&name) else {
            continue;
        };
        let path = precip_dir.join(&name);
        if name.contains("qpe") {
            if stamp < qpe_cutoff || stamp > latency_horizon {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Error removing QPE file {:?}: {}", path, e);
                }
            }
        } else if name.contains("qpf") && stamp < current {
            let stored = qpf_store.join(&name);
            if let Err(e) = fs::copy(&path, &stored).and_then(|_| fs::remove_file(&path)) {
                warn!("Error storing QPF file {:?}: {}", path, e);
            }
        }
    }

    for name in list_tifs(qpf_store)? {
        let Some(stamp) = filename_stamp(&name) else {
            continue;
        };
        if stamp < latency_horizon {
            let path = qpf_store.join(&name);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Error removing stored QPF file {:?}: {}", path, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"tif").unwrap();
        path
    }

    #[test]
    fn extracts_dot_delimited_stamp() {
        assert_eq!(
            filename_stamp("imerg.qpe.202306062030.30minAccum.tif"),
            Some(ts("2023-06-06 20:30"))
        );
        assert_eq!(filename_stamp("maxunitq.20230606.203000.tif"), None);
        assert_eq!(filename_stamp("notif.txt"), None);
    }

    #[test]
    fn staging_holds_back_newest_four_and_renames_qpf() {
        let precip = tempfile::tempdir().unwrap();
        let stage = tempfile::tempdir().unwrap();
        for hour in 0..6 {
            touch(
                precip.path(),
                &format!("imerg.qpe.20230606{:02}00.30minAccum.tif", hour),
            );
        }
        touch(precip.path(), "imerg.qpf.202306052300.30minAccum.tif");

        // 7 files: the newest 4 stay behind.
        let staged = stage_precip(precip.path(), stage.path()).unwrap();
        assert_eq!(staged, 3);
        // The qpf file is oldest, so it staged, renamed to qpe.
        assert!(stage.path().join("imerg.qpe.202306052300.30minAccum.tif").exists());
        assert!(stage.path().join("imerg.qpe.202306060000.30minAccum.tif").exists());
        assert!(stage.path().join("imerg.qpe.202306060100.30minAccum.tif").exists());
        assert!(!stage.path().join("imerg.qpe.202306060200.30minAccum.tif").exists());
    }

    #[test]
    fn staging_copies_everything_when_few_files() {
        let precip = tempfile::tempdir().unwrap();
        let stage = tempfile::tempdir().unwrap();
        touch(precip.path(), "imerg.qpe.202306060000.30minAccum.tif");
        touch(precip.path(), "imerg.qpe.202306060100.30minAccum.tif");
        let staged = stage_precip(precip.path(), stage.path()).unwrap();
        assert_eq!(staged, 2);
    }

    #[test]
    fn cleanup_applies_age_policies() {
        let precip = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let current = ts("2023-06-09 14:00");

        // Older than 9.5 h: deleted.
        let old_qpe = touch(precip.path(), "imerg.qpe.202306090400.30minAccum.tif");
        // Inside the window: kept.
        let good_qpe = touch(precip.path(), "imerg.qpe.202306090800.30minAccum.tif");
        // Newer than the 4 h latency horizon: deleted as duplicate.
        let dup_qpe = touch(precip.path(), "imerg.qpe.202306091300.30minAccum.tif");
        // QPF older than current: moved to the store.
        let old_qpf = touch(precip.path(), "imerg.qpf.202306091200.30minAccum.tif");
        // Future QPF: kept in place.
        let new_qpf = touch(precip.path(), "imerg.qpf.202306091500.30minAccum.tif");
        // Stored QPF past the latency horizon: purged.
        let stale_store = touch(store.path(), "imerg.qpf.202306090300.30minAccum.tif");

        cleanup_precip(current, precip.path(), store.path()).unwrap();

        assert!(!old_qpe.exists());
        assert!(good_qpe.exists());
        assert!(!dup_qpe.exists());
        assert!(!old_qpf.exists());
        assert!(store.path().join("imerg.qpf.202306091200.30minAccum.tif").exists());
        assert!(new_qpf.exists());
        assert!(!stale_store.exists());
    }

    #[test]
    fn clear_stage_empties_the_folder() {
        let stage = tempfile::tempdir().unwrap();
        touch(stage.path(), "imerg.qpe.202306090800.30minAccum.tif");
        clear_stage(stage.path());
        assert_eq!(fs::read_dir(stage.path()).unwrap().count(), 0);
    }
}
