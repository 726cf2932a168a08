use crate::io::raster::{RasterGrid, read_raster};
use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Literal delimiter lines bounding the rewritable gauge/basin region of a
/// control template. Both must be present; the region between them is
/// replaced wholesale.
pub const BLOCK_START: &str = "#---Start Gauge-Basin Block";
pub const BLOCK_END: &str = "#---End Gauge-Basin Block";

/// Gauges selected for the high-resolution rerun: ascending, deduplicated
/// global identifiers. Empty means no rerun, which is a valid outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighResSelection {
    pub gauge_ids: Vec<u32>,
}

impl HighResSelection {
    pub fn count(&self) -> usize {
        self.gauge_ids.len()
    }
}

/// Collect the gauge identifiers whose mask cells fall inside the
/// footprint of any output cell at or above the threshold.
///
/// Nodata cells never qualify regardless of value, the comparison is
/// `>=`, and negative mask values are sentinels and excluded. The result
/// is ascending and duplicate-free.
pub fn select_gauges(output: &RasterGrid, mask: &RasterGrid, threshold: f64) -> Vec<u32> {
    let mut gauge_ids: BTreeSet<u32> = BTreeSet::new();

    for (col, row, value) in output.valid_cells() {
        if !value.is_finite() || value < threshold {
            continue;
        }
        let (min_x, min_y, max_x, max_y) = output.transform.cell_bounds(col, row);
        collect_footprint_gauges(mask, min_x, min_y, max_x, max_y, &mut gauge_ids);
    }

    gauge_ids.into_iter().collect()
}

/// Intersect one coarse-cell footprint with the finer mask grid and
/// record every distinct non-negative integer value observed.
fn collect_footprint_gauges(
    mask: &RasterGrid,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
    gauge_ids: &mut BTreeSet<u32>,
) {
    // Corner order flips with the sign of the y resolution.
    let (ax, ay) = mask.transform.geo_to_pixel(min_x, min_y);
    let (bx, by) = mask.transform.geo_to_pixel(max_x, max_y);

    let col_lo = ax.min(bx).floor().max(0.0) as usize;
    let col_hi = (ax.max(bx).ceil() as usize).min(mask.width);
    let row_lo = ay.min(by).floor().max(0.0) as usize;
    let row_hi = (ay.max(by).ceil() as usize).min(mask.height);

    for row in row_lo..row_hi {
        for col in col_lo..col_hi {
            if let Some(value) = mask.value(col, row) {
                let rounded = value.round();
                if rounded >= 0.0 {
                    gauge_ids.insert(rounded as u32);
                }
            }
        }
    }
}

/// Parse the gauge lookup table: one descriptor per `[Gauge <id>]` line.
pub fn load_gauge_lookup(path: &Path) -> Result<BTreeMap<u32, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Gauge list file not found: {:?}", path))?;

    let mut lookup = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("[Gauge") else {
            continue;
        };
        let Some(close) = rest.find(']') else {
            continue;
        };
        if let Ok(gauge_id) = rest[..close].trim().parse::<u32>() {
            lookup.insert(gauge_id, line.to_string());
        }
    }
    Ok(lookup)
}

fn reindex_gauge_line(raw: &str, new_index: usize) -> String {
    match raw.find(']') {
        Some(close) => format!("[Gauge {}]{}", new_index, &raw[close + 1..]),
        None => raw.to_string(),
    }
}

/// Render the topology block for the surviving gauges. Survivors are
/// reindexed to contiguous local indices `0..N-1` in ascending global-id
/// order (the engine requires contiguous indices), grouped under one
/// basin aggregate, with the global identifiers kept in a comment for
/// traceability. Identifiers absent from the lookup are dropped with a
/// warning; the returned list holds the survivors.
pub fn render_topology_block(
    gauge_ids: &[u32],
    lookup: &BTreeMap<u32, String>,
    name_prefix: &str,
) -> (String, Vec<u32>) {
    let mut survivors = Vec::new();
    let mut gauge_lines = Vec::new();
    let mut missing = Vec::new();

    for &gauge_id in gauge_ids {
        match lookup.get(&gauge_id) {
            Some(raw) => {
                gauge_lines.push(reindex_gauge_line(raw, survivors.len()));
                survivors.push(gauge_id);
            }
            None => missing.push(gauge_id),
        }
    }
    if !missing.is_empty() {
        warn!(
            "Skipped {} gauge(s) absent from the gauge list: {:?}",
            missing.len(),
            missing
        );
    }

    let mut lines = vec![BLOCK_START.to_string(), String::new()];
    if !gauge_lines.is_empty() {
        lines.extend(gauge_lines.iter().cloned());
        lines.push(String::new());
        lines.push("[Basin 0]".to_string());
        let names = survivors
            .iter()
            .map(|gid| format!("gauge={}_{}", name_prefix, gid))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("# {}", names));
        let indices = (0..survivors.len())
            .map(|idx| format!("gauge={}", idx))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(indices);
        lines.push(String::new());
    }
    lines.push(BLOCK_END.to_string());

    (lines.join("\n"), survivors)
}

/// Replace the delimited topology region of a template with a freshly
/// rendered block. Missing markers mean the template is malformed, which
/// is fatal for this path.
pub fn replace_topology_block(template: &str, block: &str) -> Result<String> {
    let start = template
        .find(BLOCK_START)
        .with_context(|| format!("Marker {:?} not found in template", BLOCK_START))?;
    let end = template
        .find(BLOCK_END)
        .with_context(|| format!("Marker {:?} not found in template", BLOCK_END))?;
    if end < start {
        bail!("Topology block markers are out of order");
    }

    let mut updated = String::with_capacity(template.len() + block.len());
    updated.push_str(&template[..start]);
    updated.push_str(block);
    updated.push_str(&template[end + BLOCK_END.len()..]);
    Ok(updated)
}

/// Scan the standard run's output raster and rewrite the high-resolution
/// template's topology block with the gauges whose footprint exceeded the
/// threshold. A missing output raster is a graceful skip (empty
/// selection); malformed templates and unreadable lookup tables are
/// errors.
pub fn prepare_highres_control(
    output_raster: &Path,
    mask_grid: &Path,
    gauge_list: &Path,
    template_path: &Path,
    threshold: f64,
    name_prefix: &str,
) -> Result<HighResSelection> {
    if !output_raster.is_file() {
        info!("High-res rerun skipped: output raster not found: {:?}", output_raster);
        return Ok(HighResSelection { gauge_ids: vec![] });
    }

    let output = read_raster(output_raster)?;
    let mask = read_raster(mask_grid)?;
    let candidates = select_gauges(&output, &mask, threshold);

    let lookup = load_gauge_lookup(gauge_list)?;
    let (block, survivors) = render_topology_block(&candidates, &lookup, name_prefix);

    let template = fs::read_to_string(template_path)
        .with_context(|| format!("Failed to read high-res template: {:?}", template_path))?;
    let updated = replace_topology_block(&template, &block)?;
    fs::write(template_path, updated)
        .with_context(|| format!("Failed to update high-res template: {:?}", template_path))?;

    info!("High-res template updated with {} gauge(s)", survivors.len());
    Ok(HighResSelection {
        gauge_ids: survivors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raster::GeoTransform;

    fn north_up(origin_x: f64, origin_y: f64, res: f64) -> GeoTransform {
        GeoTransform([origin_x, res, 0.0, origin_y, 0.0, -res])
    }

    /// Coarse 3x1 output over x [0, 9); fine 9x3 mask on the same extent.
    fn coarse_output(values: Vec<f64>) -> RasterGrid {
        RasterGrid {
            data: values,
            width: 3,
            height: 1,
            nodata: Some(-9999.0),
            transform: north_up(0.0, 3.0, 3.0),
        }
    }

    fn fine_mask(data: Vec<f64>) -> RasterGrid {
        RasterGrid {
            data,
            width: 9,
            height: 3,
            nodata: Some(-1.0),
            transform: north_up(0.0, 3.0, 1.0),
        }
    }

    fn lookup(entries: &[(u32, &str)]) -> BTreeMap<u32, String> {
        entries
            .iter()
            .map(|(id, name)| (*id, format!("[Gauge {}] {}", id, name)))
            .collect()
    }

    #[test]
    fn single_qualifying_cell_collects_its_footprint() {
        // Cells [0.5, 2.0, 0.9], threshold 1.0: only the middle cell
        // qualifies; its footprint carries mask values {3, 7, 3}.
        let output = coarse_output(vec![0.5, 2.0, 0.9]);
        let mut mask_data = vec![-1.0; 27];
        mask_data[3] = 3.0; // row 0, col 3
        mask_data[9 + 4] = 7.0; // row 1, col 4
        mask_data[18 + 5] = 3.0; // row 2, col 5
        mask_data[0] = 99.0; // outside the qualifying footprint
        let mask = fine_mask(mask_data);

        assert_eq!(select_gauges(&output, &mask, 1.0), vec![3, 7]);
    }

    #[test]
    fn no_cell_over_threshold_selects_nothing() {
        let output = coarse_output(vec![0.5, 0.2, 0.9]);
        let mask = fine_mask(vec![5.0; 27]);
        assert!(select_gauges(&output, &mask, 1.0).is_empty());
    }

    #[test]
    fn threshold_comparison_is_inclusive() {
        let output = coarse_output(vec![1.0, 0.0, 0.0]);
        let mut mask_data = vec![-1.0; 27];
        mask_data[0] = 4.0;
        let mask = fine_mask(mask_data);
        assert_eq!(select_gauges(&output, &mask, 1.0), vec![4]);
    }

    #[test]
    fn nodata_cells_never_qualify() {
        let output = coarse_output(vec![-9999.0, f64::NAN, -9999.0]);
        let mask = fine_mask(vec![5.0; 27]);
        assert!(select_gauges(&output, &mask, -10000.0).is_empty());
    }

    #[test]
    fn negative_mask_values_are_excluded() {
        let output = coarse_output(vec![2.0, 0.0, 0.0]);
        let mut mask_data = vec![-1.0; 27];
        mask_data[0] = -5.0; // sentinel, not nodata
        mask_data[1] = 6.0;
        let mut mask = fine_mask(mask_data);
        mask.nodata = Some(-9999.0);
        assert_eq!(select_gauges(&output, &mask, 1.0), vec![6]);
    }

    #[test]
    fn selection_is_ascending_and_deduplicated() {
        let output = coarse_output(vec![2.0, 2.0, 2.0]);
        let mut mask_data = vec![-1.0; 27];
        mask_data[0] = 9.0;
        mask_data[4] = 2.0;
        mask_data[8] = 9.0;
        mask_data[13] = 2.0;
        let mask = fine_mask(mask_data);
        assert_eq!(select_gauges(&output, &mask, 1.0), vec![2, 9]);
    }

    #[test]
    fn gauge_lookup_parses_bracketed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gauges.txt");
        std::fs::write(
            &path,
            "# comment\n[Gauge 3] name=alpha cell=10\nnoise\n[Gauge 7] name=beta cell=22\n",
        )
        .unwrap();
        let lookup = load_gauge_lookup(&path).unwrap();
        assert_eq!(lookup.len(), 2);
        assert!(lookup[&3].contains("alpha"));
        assert!(lookup[&7].contains("beta"));
    }

    #[test]
    fn block_reindexes_to_contiguous_local_indices() {
        let lookup = lookup(&[(3, "name=alpha"), (7, "name=beta")]);
        let (block, survivors) = render_topology_block(&[3, 7], &lookup, "Regional_25m");
        assert_eq!(survivors, vec![3, 7]);
        assert!(block.contains("[Gauge 0] name=alpha"));
        assert!(block.contains("[Gauge 1] name=beta"));
        assert!(block.contains("[Basin 0]"));
        assert!(block.contains("# gauge=Regional_25m_3 gauge=Regional_25m_7"));
        assert!(block.contains("\ngauge=0 gauge=1\n"));
        assert!(block.starts_with(BLOCK_START));
        assert!(block.ends_with(BLOCK_END));
    }

    #[test]
    fn unknown_gauges_are_dropped_from_the_block() {
        let lookup = lookup(&[(7, "name=beta")]);
        let (block, survivors) = render_topology_block(&[3, 7, 12], &lookup, "P");
        assert_eq!(survivors, vec![7]);
        assert!(block.contains("[Gauge 0] name=beta"));
        assert!(!block.contains("[Gauge 1]"));
    }

    #[test]
    fn empty_selection_renders_empty_block() {
        let (block, survivors) = render_topology_block(&[], &BTreeMap::new(), "P");
        assert!(survivors.is_empty());
        assert!(!block.contains("[Basin 0]"));
        assert!(block.starts_with(BLOCK_START));
        assert!(block.ends_with(BLOCK_END));
    }

    #[test]
    fn replaces_exactly_the_delimited_region() {
        let template = format!(
            "header\n{}\nold gauge lines\n{}\nfooter\n",
            BLOCK_START, BLOCK_END
        );
        let updated = replace_topology_block(&template, "NEWBLOCK").unwrap();
        assert_eq!(updated, "header\nNEWBLOCK\nfooter\n");
    }

    #[test]
    fn missing_marker_is_fatal() {
        assert!(replace_topology_block("no markers here", "X").is_err());
        let only_start = format!("{}\nbody\n", BLOCK_START);
        assert!(replace_topology_block(&only_start, "X").is_err());
    }

    #[test]
    fn missing_output_raster_is_a_graceful_skip() {
        let dir = tempfile::tempdir().unwrap();
        let selection = prepare_highres_control(
            &dir.path().join("absent.tif"),
            &dir.path().join("mask.tif"),
            &dir.path().join("gauges.txt"),
            &dir.path().join("template.txt"),
            1.0,
            "P",
        )
        .unwrap();
        assert_eq!(selection.count(), 0);
    }
}
