use shellcast_adapters::GeoRaster;
use shellcast_core::{ObservationRow, SpatialUnit, ThresholdRaster, UnitGeometry};
use tracing::{debug, info};

use super::StageError;

/// Sample every threshold raster onto the units that share its threshold.
///
/// Points read the containing pixel, areas the mean of all touched pixels.
/// Units landing on nodata or outside the raster produce no row.
pub fn sample_layer(
    rasters: &[ThresholdRaster],
    units: &[SpatialUnit],
    hour_offset: i32,
) -> Result<Vec<ObservationRow>, StageError> {
    let mut rows = Vec::new();
    for raster in rasters {
        let parsed = ThresholdRaster::from_path(&raster.path)?;
        let horizon = parsed.horizon.shifted(hour_offset);
        let grid = GeoRaster::read(&raster.path)?;

        let mut sampled = 0usize;
        let mut skipped = 0usize;
        for unit in units.iter().filter(|u| u.matches(parsed.threshold)) {
            let value = match &unit.geometry {
                UnitGeometry::Point(point) => grid.sample(point),
                UnitGeometry::Area(area) => grid.zonal_mean(area),
            };
            match value {
                Some(value) => {
                    sampled += 1;
                    rows.push(ObservationRow {
                        unit_id: unit.id.clone(),
                        group_key: unit.cmu_name.clone(),
                        horizon,
                        value,
                    });
                }
                None => {
                    skipped += 1;
                    debug!(unit = %unit.id, raster = %raster.path.display(), "no valid pixel");
                }
            }
        }
        info!(
            raster = %raster.path.display(),
            horizon = %horizon.label(),
            threshold = %parsed.threshold,
            sampled,
            skipped,
            "sampled raster"
        );
    }
    Ok(rows)
}
