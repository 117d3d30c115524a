//! Raster, AOI and summary I/O

pub mod aoi;
pub mod raster;
pub mod summary;

pub use aoi::{read_aoi, AreaOfInterest};
pub use raster::{
    raster_bounds, read_band_as, read_raster, read_raster_band, write_raster, OutputBatch, WriteOptions,
};
pub use summary::{format_area_table, read_area_summary, write_area_summary};
