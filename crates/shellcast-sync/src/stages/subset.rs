use std::path::{Path, PathBuf};

use shellcast_adapters::{RasterTools, ResampleSpec, SubsetBounds};
use shellcast_core::{ThresholdRaster, SUBSET_PREFIX};
use shellcast_storage::workdirs::clear_dir;
use tracing::info;

use super::StageError;

/// Cut every raw grid file down to `bounds`, writing `sbs_<name>` into
/// `out_dir`. The first failing file aborts the stage.
pub async fn subset(
    tools: &dyn RasterTools,
    raw_files: &[PathBuf],
    bounds: &SubsetBounds,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, StageError> {
    clear_dir(out_dir).await?;
    let mut outputs = Vec::with_capacity(raw_files.len());
    for input in raw_files {
        let Some(name) = input.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let output = out_dir.join(format!("{SUBSET_PREFIX}_{name}"));
        tools.subset(input, bounds, &output).await?;
        info!(input = name, output = %output.display(), "subset grid file");
        outputs.push(output);
    }
    Ok(outputs)
}

/// Warp each threshold raster onto the target resolution, keeping its name.
pub async fn resample(
    tools: &dyn RasterTools,
    rasters: &[ThresholdRaster],
    spec: &ResampleSpec,
    out_dir: &Path,
) -> Result<Vec<ThresholdRaster>, StageError> {
    clear_dir(out_dir).await?;
    let mut outputs = Vec::with_capacity(rasters.len());
    for raster in rasters {
        let Some(name) = raster.path.file_name() else {
            continue;
        };
        let output = out_dir.join(name);
        tools.resample(&raster.path, spec, &output).await?;
        info!(output = %output.display(), x_res = spec.x_res, y_res = spec.y_res, "resampled raster");
        outputs.push(ThresholdRaster {
            source: Some(raster.path.clone()),
            path: output,
            ..raster.clone()
        });
    }
    Ok(outputs)
}
