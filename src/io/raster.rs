use anyhow::Result;
use std::path::Path;

/// Affine geotransform in GDAL parameter order:
/// [x_origin, x_res, x_rot, y_origin, y_rot, y_res]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    pub fn pixel_to_geo(&self, px: f64, py: f64) -> (f64, f64) {
        let x = self.0[0] + px * self.0[1];
        let y = self.0[3] + py * self.0[5];
        (x, y)
    }

    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let px = (x - self.0[0]) / self.0[1];
        let py = (y - self.0[3]) / self.0[5];
        (px, py)
    }

    /// Geographic bounding box of a single cell as (min_x, min_y, max_x, max_y).
    pub fn cell_bounds(&self, col: usize, row: usize) -> (f64, f64, f64, f64) {
        let (x0, y0) = self.pixel_to_geo(col as f64, row as f64);
        let (x1, y1) = self.pixel_to_geo((col + 1) as f64, (row + 1) as f64);
        (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }
}

/// Single-band raster held in memory. Values equal to the nodata sentinel
/// are treated as missing by `value`.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
    pub nodata: Option<f64>,
    pub transform: GeoTransform,
}

impl RasterGrid {
    /// Value at (col, row), or None when out of range or masked as nodata.
    pub fn value(&self, col: usize, row: usize) -> Option<f64> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let val = self.data[row * self.width + col];
        if let Some(nd) = self.nodata {
            if (val - nd).abs() < 1e-10 {
                return None;
            }
        }
        Some(val)
    }

    /// Iterate valid (col, row, value) triples in row-major order.
    pub fn valid_cells(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.height).flat_map(move |row| {
            (0..self.width).filter_map(move |col| {
                self.value(col, row).map(|v| (col, row, v))
            })
        })
    }
}

/// Read band 1 of a geo-referenced raster file.
#[cfg(feature = "raster-io")]
pub fn read_raster(path: &Path) -> Result<RasterGrid> {
    use anyhow::Context;
    use gdal::Dataset;

    let dataset =
        Dataset::open(path).with_context(|| format!("Failed to open raster: {:?}", path))?;
    let (width, height) = dataset.raster_size();
    let transform = GeoTransform(dataset.geo_transform()?);
    let band = dataset.rasterband(1)?;
    let nodata = band.no_data_value();
    let buffer = band.read_as::<f64>((0, 0), (width, height), (width, height), None)?;

    Ok(RasterGrid {
        data: buffer.data().to_vec(),
        width,
        height,
        nodata,
        transform,
    })
}

#[cfg(not(feature = "raster-io"))]
pub fn read_raster(path: &Path) -> Result<RasterGrid> {
    anyhow::bail!(
        "built without the raster-io feature, cannot read {:?}",
        path
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn north_up(origin_x: f64, origin_y: f64, res: f64) -> GeoTransform {
        GeoTransform([origin_x, res, 0.0, origin_y, 0.0, -res])
    }

    #[test]
    fn cell_bounds_are_ordered() {
        let gt = north_up(100.0, 50.0, 1.0);
        let (min_x, min_y, max_x, max_y) = gt.cell_bounds(2, 3);
        assert_eq!((min_x, max_x), (102.0, 103.0));
        assert_eq!((min_y, max_y), (46.0, 47.0));
    }

    #[test]
    fn geo_pixel_round_trip() {
        let gt = north_up(-101.0, 39.5, 0.01);
        let (x, y) = gt.pixel_to_geo(10.0, 20.0);
        let (px, py) = gt.geo_to_pixel(x, y);
        assert!((px - 10.0).abs() < 1e-9);
        assert!((py - 20.0).abs() < 1e-9);
    }

    #[test]
    fn nodata_cells_are_masked() {
        let grid = RasterGrid {
            data: vec![1.0, -9999.0, 3.0, 4.0],
            width: 2,
            height: 2,
            nodata: Some(-9999.0),
            transform: north_up(0.0, 2.0, 1.0),
        };
        assert_eq!(grid.value(0, 0), Some(1.0));
        assert_eq!(grid.value(1, 0), None);
        assert_eq!(grid.value(5, 0), None);
        assert_eq!(grid.valid_cells().count(), 3);
    }
}
