use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use shellcast_adapters::{scan_bands, RasterTools};
use shellcast_core::{GridFileName, Threshold, ThresholdRaster};
use shellcast_storage::workdirs::clear_dir;
use tokio::fs;
use tracing::{debug, info, warn};

use super::StageError;

/// Export one single-band GeoTIFF per (subset file, requested threshold).
///
/// Bands are matched on their upper probability limit converted to inches
/// and rounded to one decimal. A file without matching bands contributes
/// nothing.
pub async fn extract_bands(
    tools: &dyn RasterTools,
    subset_files: &[PathBuf],
    thresholds: &BTreeSet<Threshold>,
    tiff_prefix: &str,
    out_dir: &Path,
) -> Result<Vec<ThresholdRaster>, StageError> {
    clear_dir(out_dir).await?;
    let mut rasters = Vec::new();

    for input in subset_files {
        let name = input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let horizon = GridFileName::parse(name)?.horizon;
        let bytes = fs::read(input)
            .await
            .map_err(|source| shellcast_storage::StorageError::Io {
                action: "reading",
                path: input.clone(),
                source,
            })?;
        let bands = scan_bands(&bytes).map_err(|source| StageError::Grib {
            path: input.clone(),
            source,
        })?;

        let mut exported = BTreeSet::new();
        for band in bands {
            let Some(threshold) = band.upper_limit_mm.and_then(Threshold::from_millimetres) else {
                debug!(file = name, band = band.index, "band carries no upper limit");
                continue;
            };
            if !thresholds.contains(&threshold) {
                continue;
            }
            if !exported.insert(threshold) {
                warn!(file = name, band = band.index, %threshold, "duplicate threshold band skipped");
                continue;
            }
            let output = out_dir.join(ThresholdRaster::file_name(tiff_prefix, name, threshold));
            tools.export_band(input, band.index, &output).await?;
            info!(file = name, band = band.index, %threshold, output = %output.display(), "exported threshold band");
            rasters.push(ThresholdRaster {
                source: Some(input.clone()),
                threshold,
                horizon,
                path: output,
            });
        }
        if exported.is_empty() {
            warn!(file = name, "no bands matched the requested thresholds");
        }
    }

    Ok(rasters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shellcast_adapters::grib::testing::probability_message;
    use shellcast_adapters::{ResampleSpec, SubsetBounds, ToolError};
    use shellcast_core::HorizonCode;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingTools {
        exports: Mutex<Vec<(usize, PathBuf)>>,
    }

    #[async_trait]
    impl RasterTools for RecordingTools {
        async fn subset(&self, _: &Path, _: &SubsetBounds, _: &Path) -> Result<(), ToolError> {
            Ok(())
        }

        async fn export_band(&self, _input: &Path, band: usize, output: &Path) -> Result<(), ToolError> {
            std::fs::write(output, b"tif").expect("write");
            self.exports.lock().expect("lock").push((band, output.to_path_buf()));
            Ok(())
        }

        async fn resample(&self, _: &Path, _: &ResampleSpec, _: &Path) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn inches(v: f64) -> Threshold {
        Threshold::from_inches(v).expect("threshold")
    }

    #[tokio::test]
    async fn only_requested_thresholds_are_exported() {
        let dir = tempdir().expect("tempdir");
        let grid = dir.path().join("sbs_pqpf_p24i_conus_2024101606f054.grb");
        // 1.0 in, 2.0 in, 3.0 in and one band without a limit.
        std::fs::write(
            &grid,
            probability_message(9, &[Some((1, 254)), Some((1, 508)), None, Some((1, 762))]),
        )
        .expect("write grib");

        let tools = RecordingTools::default();
        let out = dir.path().join("tiffs");
        let wanted: BTreeSet<_> = [inches(2.0), inches(3.0)].into_iter().collect();
        let rasters = extract_bands(&tools, &[grid], &wanted, "tp", &out)
            .await
            .expect("extract");

        let exports = tools.exports.lock().expect("lock").clone();
        assert_eq!(exports.iter().map(|(b, _)| *b).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(rasters.len(), 2);
        assert_eq!(rasters[0].threshold, inches(2.0));
        assert_eq!(rasters[0].horizon, HorizonCode::new(54));
        assert_eq!(
            rasters[1].path.file_name().and_then(|n| n.to_str()),
            Some("tp_2024101606f054_3p0.tif")
        );
    }

    #[tokio::test]
    async fn files_without_matches_yield_nothing() {
        let dir = tempdir().expect("tempdir");
        let grid = dir.path().join("sbs_pqpf_p24i_conus_2024101606f030.grb");
        std::fs::write(&grid, probability_message(9, &[Some((1, 254))])).expect("write grib");

        let tools = RecordingTools::default();
        let wanted: BTreeSet<_> = [inches(4.0)].into_iter().collect();
        let rasters = extract_bands(&tools, &[grid], &wanted, "tp", &dir.path().join("tiffs"))
            .await
            .expect("extract");
        assert!(rasters.is_empty());
    }

    #[tokio::test]
    async fn corrupt_grids_fail_the_stage() {
        let dir = tempdir().expect("tempdir");
        let grid = dir.path().join("sbs_pqpf_p24i_conus_2024101606f030.grb");
        std::fs::write(&grid, b"not a grib").expect("write");

        let tools = RecordingTools::default();
        let wanted: BTreeSet<_> = [inches(1.0)].into_iter().collect();
        let err = extract_bands(&tools, &[grid], &wanted, "tp", &dir.path().join("tiffs"))
            .await
            .expect_err("corrupt");
        assert!(matches!(err, StageError::Grib { .. }));
    }
}
