//! Vegetation index engine for burnwatch.
//!
//! Converts two-band raw tiles (red, near-infrared) into single-band NDVI
//! rasters that keep the source georeferencing.

pub mod ndvi;
pub mod raster;

pub use ndvi::{
    BatchReport, IndexOptions, batch_compute, compute_index, compute_index_file, index_file_name,
    normalize_band, smooth,
};
pub use raster::{GeoTags, Raster, list_rasters, read_raster, write_index_raster};
