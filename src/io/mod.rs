pub mod raster;
pub mod series;
