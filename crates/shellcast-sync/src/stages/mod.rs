//! Processing stages between the raw grid cache and the merged risk table.

use std::path::PathBuf;

use shellcast_adapters::{GribError, LayerError, RasterError, ToolError};
use shellcast_core::NameError;
use shellcast_storage::StorageError;
use thiserror::Error;

pub mod aggregate;
pub mod bands;
pub mod merge;
pub mod sampler;
pub mod subset;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("scanning {}: {source}", .path.display())]
    Grib {
        path: PathBuf,
        #[source]
        source: GribError,
    },
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("observation horizon {label} for {group} is not 24h, 48h or 72h")]
    UnexpectedHorizon { label: String, group: String },
    #[error("no risk rows to reconcile")]
    EmptyMerge,
    #[error("writing {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
