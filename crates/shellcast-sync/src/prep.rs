//! Region preparation: boundary tidying, lease centroids and GeoJSON exports
//! for the unit layers a run reads.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use shellcast_adapters::GeospatialPreprocessor;
use tokio::fs;
use tracing::info;

use crate::config::RegionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepReport {
    pub lease_centroids: PathBuf,
    pub exported: Vec<PathBuf>,
}

pub async fn prepare_region(
    code: &str,
    region: &RegionConfig,
    preprocessor: &dyn GeospatialPreprocessor,
) -> Result<PrepReport> {
    let Some(prep) = &region.prep else {
        bail!("region {code} has no prep section");
    };
    let layout = prep.layout();

    info!(region = code, "[Tidy state bounds]");
    preprocessor
        .tidy_state_bounds(&layout, &prep.state_name, &prep.state_abbrev, &prep.state_shapefile)
        .await
        .context("tidying state bounds")?;
    info!(region = code, "[Tidy CMU bounds]");
    preprocessor
        .tidy_cmu_bounds(&layout)
        .await
        .context("tidying CMU bounds")?;
    info!(region = code, "[Tidy SGA bounds]");
    preprocessor
        .tidy_sga_bounds(&layout)
        .await
        .context("tidying SGA bounds")?;
    info!(region = code, "[Tidy lease data]");
    let lease_centroids = preprocessor
        .tidy_lease_data(&layout, &prep.lease_shapefile)
        .await
        .context("tidying lease data")?;

    let mut exported = Vec::with_capacity(prep.exports.len());
    for export in &prep.exports {
        let Some(layer) = region.layers.iter().find(|l| l.name == export.layer) else {
            bail!("region {code} exports to unknown layer {}", export.layer);
        };
        if let Some(parent) = layer.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        preprocessor
            .export_layer(&export.source, &layer.path, prep.target_srs.as_deref())
            .await
            .with_context(|| format!("exporting {} to {}", export.source.display(), layer.path.display()))?;
        info!(layer = %layer.name, path = %layer.path.display(), "exported unit layer");
        exported.push(layer.path.clone());
    }

    Ok(PrepReport {
        lease_centroids,
        exported,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use async_trait::async_trait;
    use shellcast_adapters::{PrepLayout, ToolError};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().expect("lock").push(call.into());
        }
    }

    #[async_trait]
    impl GeospatialPreprocessor for Recorder {
        async fn tidy_state_bounds(&self, _: &PrepLayout, name: &str, abbrev: &str, _: &str) -> Result<(), ToolError> {
            self.record(format!("state:{name}:{abbrev}"));
            Ok(())
        }

        async fn tidy_cmu_bounds(&self, _: &PrepLayout) -> Result<(), ToolError> {
            self.record("cmu");
            Ok(())
        }

        async fn tidy_sga_bounds(&self, _: &PrepLayout) -> Result<(), ToolError> {
            self.record("sga");
            Ok(())
        }

        async fn tidy_lease_data(&self, layout: &PrepLayout, shapefile: &str) -> Result<PathBuf, ToolError> {
            self.record(format!("leases:{shapefile}"));
            Ok(layout.lease_centroids_csv())
        }

        async fn export_layer(&self, input: &Path, output: &Path, srs: Option<&str>) -> Result<(), ToolError> {
            self.record(format!(
                "export:{}:{}:{}",
                input.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
                output.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
                srs.unwrap_or("-")
            ));
            Ok(())
        }
    }

    fn config(root: &Path) -> PipelineConfig {
        let yaml = format!(
            r#"
data_root: {root}/data
regions:
  nc:
    lon_we: [-84.5, -75.3]
    lat_sn: [33.8, 36.6]
    threshold: 1.0
    layers:
      - name: leases
        path: {root}/layers/leases.geojson
        kind: lease
        id_property: lease_id
    prep:
      state_name: North Carolina
      state_abbrev: NC
      lease_shapefile: NCDMF_Lease_20220310.shp
      assets_dir: {root}/assets
      target_srs: EPSG:4326
      exports:
        - source: {root}/assets/lease_centroids.shp
          layer: leases
"#,
            root = root.display()
        );
        PipelineConfig::from_yaml(&yaml).expect("config")
    }

    #[tokio::test]
    async fn prep_runs_every_transform_then_exports_layers() {
        let dir = tempdir().expect("tempdir");
        let config = config(dir.path());
        let region = config.region("nc").expect("region");
        let recorder = Recorder::default();

        let report = prepare_region("nc", region, &recorder).await.expect("prep");
        assert!(report
            .lease_centroids
            .ends_with("dmf_data/lease_centroids/lease_centroids_db_wgs84.csv"));
        assert_eq!(report.exported, vec![dir.path().join("layers/leases.geojson")]);
        assert!(dir.path().join("layers").is_dir());
        assert_eq!(
            recorder.calls.lock().expect("lock").clone(),
            vec![
                "state:North Carolina:NC".to_string(),
                "cmu".to_string(),
                "sga".to_string(),
                "leases:NCDMF_Lease_20220310.shp".to_string(),
                "export:lease_centroids.shp:leases.geojson:EPSG:4326".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn regions_without_prep_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut config = config(dir.path());
        let region = config.regions.get_mut("nc").expect("region");
        region.prep = None;
        let err = prepare_region("nc", region, &Recorder::default())
            .await
            .expect_err("no prep");
        assert!(err.to_string().contains("no prep section"));
    }
}
