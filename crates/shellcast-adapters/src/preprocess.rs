use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::tools::{ToolError, ToolPaths, ToolRunner};

/// Inputs and outputs of the boundary tidy steps for one state.
#[derive(Debug, Clone)]
pub struct PrepLayout {
    pub spatial_inputs: PathBuf,
    pub spatial_outputs: PathBuf,
    pub tabular_inputs: PathBuf,
}

impl PrepLayout {
    pub fn state_bounds_raw(&self) -> PathBuf {
        self.spatial_inputs.join("state_bounds_data/state_bounds_raw")
    }

    pub fn state_bounds(&self) -> PathBuf {
        self.spatial_inputs.join("state_bounds_data/state_bounds")
    }

    pub fn cmu_bounds_raw(&self) -> PathBuf {
        self.spatial_inputs.join("dmf_data/cmu_bounds_raw")
    }

    pub fn cmu_bounds(&self) -> PathBuf {
        self.spatial_inputs.join("dmf_data/cmu_bounds")
    }

    pub fn sga_bounds_raw(&self) -> PathBuf {
        self.spatial_inputs.join("dmf_data/sga_bounds_raw")
    }

    pub fn sga_bounds(&self) -> PathBuf {
        self.spatial_inputs.join("dmf_data/sga_bounds")
    }

    pub fn rainfall_thresholds(&self) -> PathBuf {
        self.tabular_inputs.join("dmf_rainfall_thresholds")
    }

    pub fn lease_bounds_raw(&self) -> PathBuf {
        self.spatial_outputs.join("dmf_data/lease_bounds_raw")
    }

    pub fn lease_outputs(&self) -> PathBuf {
        self.spatial_outputs.join("dmf_data")
    }

    pub fn lease_centroids_csv(&self) -> PathBuf {
        self.lease_outputs()
            .join("lease_centroids/lease_centroids_db_wgs84.csv")
    }
}

/// Boundary and threshold preparation feeding the unit layers.
#[async_trait]
pub trait GeospatialPreprocessor: Send + Sync {
    async fn tidy_state_bounds(
        &self,
        layout: &PrepLayout,
        state_name: &str,
        state_abbrev: &str,
        shapefile: &str,
    ) -> Result<(), ToolError>;

    async fn tidy_cmu_bounds(&self, layout: &PrepLayout) -> Result<(), ToolError>;

    async fn tidy_sga_bounds(&self, layout: &PrepLayout) -> Result<(), ToolError>;

    /// Returns the lease centroid CSV consumed by the lease upsert.
    async fn tidy_lease_data(&self, layout: &PrepLayout, lease_shapefile: &str) -> Result<PathBuf, ToolError>;

    /// Convert any OGR-readable layer to GeoJSON, optionally reprojecting.
    async fn export_layer(&self, input: &Path, output: &Path, target_srs: Option<&str>) -> Result<(), ToolError>;
}

/// Runs the R tidy scripts through `Rscript` and conversions through `ogr2ogr`.
#[derive(Debug, Clone)]
pub struct ScriptPreprocessor {
    runner: ToolRunner,
    paths: ToolPaths,
    script_dir: PathBuf,
}

impl ScriptPreprocessor {
    pub fn new(runner: ToolRunner, paths: ToolPaths, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            paths,
            script_dir: script_dir.into(),
        }
    }

    async fn call_r(&self, function: &str, args: &[String]) -> Result<(), ToolError> {
        let script = self.script_dir.join(format!("{function}.R"));
        let expr = r_call_expression(&script, function, args);
        info!(function, "running R preprocessing step");
        self.runner
            .run(&self.paths.rscript, ["-e", expr.as_str()])
            .await
            .map(drop)
    }
}

/// `source('<script>'); fn('a', 'b')` with every argument quoted.
fn r_call_expression(script: &Path, function: &str, args: &[String]) -> String {
    let quoted: Vec<String> = args.iter().map(|a| r_string(a)).collect();
    format!(
        "source({}); {}({})",
        r_string(&script.display().to_string()),
        function,
        quoted.join(", ")
    )
}

fn r_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn dir_arg(path: &Path) -> String {
    format!("{}/", path.display())
}

#[async_trait]
impl GeospatialPreprocessor for ScriptPreprocessor {
    async fn tidy_state_bounds(
        &self,
        layout: &PrepLayout,
        state_name: &str,
        state_abbrev: &str,
        shapefile: &str,
    ) -> Result<(), ToolError> {
        self.call_r(
            "dmf_tidy_state_bounds",
            &[
                dir_arg(&layout.state_bounds_raw()),
                dir_arg(&layout.state_bounds()),
                state_name.to_string(),
                state_abbrev.to_string(),
                shapefile.to_string(),
            ],
        )
        .await
    }

    async fn tidy_cmu_bounds(&self, layout: &PrepLayout) -> Result<(), ToolError> {
        self.call_r(
            "dmf_tidy_cmu_bounds",
            &[
                dir_arg(&layout.cmu_bounds_raw()),
                dir_arg(&layout.rainfall_thresholds()),
                dir_arg(&layout.cmu_bounds()),
                dir_arg(&layout.rainfall_thresholds()),
            ],
        )
        .await
    }

    async fn tidy_sga_bounds(&self, layout: &PrepLayout) -> Result<(), ToolError> {
        self.call_r(
            "dmf_tidy_sga_bounds",
            &[dir_arg(&layout.sga_bounds_raw()), dir_arg(&layout.sga_bounds())],
        )
        .await
    }

    async fn tidy_lease_data(&self, layout: &PrepLayout, lease_shapefile: &str) -> Result<PathBuf, ToolError> {
        self.call_r(
            "dmf_tidy_lease_data",
            &[
                dir_arg(&layout.lease_bounds_raw()),
                dir_arg(&layout.cmu_bounds()),
                dir_arg(&layout.sga_bounds()),
                dir_arg(&layout.rainfall_thresholds()),
                dir_arg(&layout.lease_outputs()),
                lease_shapefile.to_string(),
            ],
        )
        .await?;
        Ok(layout.lease_centroids_csv())
    }

    async fn export_layer(&self, input: &Path, output: &Path, target_srs: Option<&str>) -> Result<(), ToolError> {
        let mut args: Vec<String> = vec!["-f".into(), "GeoJSON".into(), "-overwrite".into()];
        if let Some(srs) = target_srs {
            args.push("-t_srs".into());
            args.push(srs.to_string());
        }
        args.push(output.display().to_string());
        args.push(input.display().to_string());
        info!(input = %input.display(), output = %output.display(), "exporting layer");
        self.runner.run(&self.paths.ogr2ogr, &args).await.map(drop)
    }
}
