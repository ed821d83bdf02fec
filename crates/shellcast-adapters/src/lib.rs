//! Adapters to external formats and tools: GRIB2 scanning, GeoTIFF rasters,
//! GeoJSON unit layers and the GRIB/GDAL/R command-line programs.

pub mod geotiff;
pub mod grib;
pub mod layers;
pub mod preprocess;
pub mod tools;

pub use geotiff::{GeoRaster, RasterError};
pub use grib::{scan_bands, BandInfo, GribError};
pub use layers::{load_layers, LayerError, LayerSpec};
pub use preprocess::{GeospatialPreprocessor, PrepLayout, ScriptPreprocessor};
pub use tools::{
    CommandRasterTools, RasterTools, ResampleSpec, SubsetBounds, ToolError, ToolPaths, ToolRunner,
};

pub const CRATE_NAME: &str = "shellcast-adapters";
