use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} did not finish within {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs to completion with a wall-clock limit.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run<I, S>(&self, program: &Path, args: I) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let name = program.display().to_string();
        debug!(program = %name, ?args, "running external tool");

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: name.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                program: name.clone(),
                source,
            })?,
            Err(_) => {
                error!(program = %name, timeout_secs = self.timeout.as_secs(), "external tool timed out");
                return Err(ToolError::Timeout {
                    program: name,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            error!(program = %name, code = ?output.status.code(), %stderr, "external tool failed");
            return Err(ToolError::NonZeroExit {
                program: name,
                code: output.status.code(),
                stderr,
            });
        }
        Ok(ToolOutput { stdout, stderr })
    }
}

/// Longitude (west, east) and latitude (south, north) window for subsetting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubsetBounds {
    pub lon_we: [f64; 2],
    pub lat_sn: [f64; 2],
}

impl SubsetBounds {
    pub fn lon_arg(&self) -> String {
        format!("{}:{}", self.lon_we[0], self.lon_we[1])
    }

    pub fn lat_arg(&self) -> String {
        format!("{}:{}", self.lat_sn[0], self.lat_sn[1])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleSpec {
    pub x_res: f64,
    pub y_res: f64,
    #[serde(default = "default_resample_method")]
    pub method: String,
    #[serde(default = "default_dst_nodata")]
    pub dst_nodata: f64,
}

fn default_resample_method() -> String {
    "bilinear".to_string()
}

fn default_dst_nodata() -> f64 {
    -999.0
}

impl Default for ResampleSpec {
    fn default() -> Self {
        Self {
            x_res: 2539.703 / 100.0,
            y_res: 2539.702 / 100.0,
            method: default_resample_method(),
            dst_nodata: default_dst_nodata(),
        }
    }
}

/// Raster transforms delegated to the GRIB/GDAL command-line tools.
#[async_trait]
pub trait RasterTools: Send + Sync {
    async fn subset(&self, input: &Path, bounds: &SubsetBounds, output: &Path) -> Result<(), ToolError>;

    /// `band` is the 1-based field ordinal.
    async fn export_band(&self, input: &Path, band: usize, output: &Path) -> Result<(), ToolError>;

    async fn resample(&self, input: &Path, spec: &ResampleSpec, output: &Path) -> Result<(), ToolError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub wgrib2: PathBuf,
    pub gdal_translate: PathBuf,
    pub gdalwarp: PathBuf,
    pub rscript: PathBuf,
    pub ogr2ogr: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            wgrib2: PathBuf::from("wgrib2"),
            gdal_translate: PathBuf::from("gdal_translate"),
            gdalwarp: PathBuf::from("gdalwarp"),
            rscript: PathBuf::from("Rscript"),
            ogr2ogr: PathBuf::from("ogr2ogr"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRasterTools {
    runner: ToolRunner,
    paths: ToolPaths,
}

impl CommandRasterTools {
    pub fn new(runner: ToolRunner, paths: ToolPaths) -> Self {
        Self { runner, paths }
    }
}

#[async_trait]
impl RasterTools for CommandRasterTools {
    async fn subset(&self, input: &Path, bounds: &SubsetBounds, output: &Path) -> Result<(), ToolError> {
        let lon = bounds.lon_arg();
        let lat = bounds.lat_arg();
        let args: [&OsStr; 5] = [
            input.as_os_str(),
            OsStr::new("-small_grib"),
            OsStr::new(&lon),
            OsStr::new(&lat),
            output.as_os_str(),
        ];
        self.runner.run(&self.paths.wgrib2, args).await.map(drop)
    }

    async fn export_band(&self, input: &Path, band: usize, output: &Path) -> Result<(), ToolError> {
        let band = band.to_string();
        let args: [&OsStr; 6] = [
            OsStr::new("-b"),
            OsStr::new(&band),
            OsStr::new("-of"),
            OsStr::new("GTiff"),
            input.as_os_str(),
            output.as_os_str(),
        ];
        self.runner.run(&self.paths.gdal_translate, args).await.map(drop)
    }

    async fn resample(&self, input: &Path, spec: &ResampleSpec, output: &Path) -> Result<(), ToolError> {
        let x_res = spec.x_res.to_string();
        let y_res = spec.y_res.to_string();
        let nodata = spec.dst_nodata.to_string();
        let args: [&OsStr; 10] = [
            OsStr::new("-tr"),
            OsStr::new(&x_res),
            OsStr::new(&y_res),
            OsStr::new("-r"),
            OsStr::new(&spec.method),
            OsStr::new("-dstnodata"),
            OsStr::new(&nodata),
            OsStr::new("-overwrite"),
            input.as_os_str(),
            output.as_os_str(),
        ];
        self.runner.run(&self.paths.gdalwarp, args).await.map(drop)
    }
}
