//! Core domain model for the ShellCast PQPF risk pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use geo::{MultiPolygon, Point};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shellcast-core";

pub const GRIB_EXTENSION: &str = "grb";
pub const TIFF_EXTENSION: &str = "tif";
pub const SUBSET_PREFIX: &str = "sbs";

const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("grid file name {0} does not match {{prefix}}_{{YYYYMMDD}}{{HH}}{{fNNN}}.grb")]
    GridFile(String),
    #[error("raster file name {0} does not encode a horizon and threshold")]
    ThresholdRaster(String),
    #[error("invalid horizon code {0}")]
    Horizon(String),
    #[error("invalid rainfall threshold {0}")]
    Threshold(String),
}

/// Rainfall threshold in inches, discretized to tenths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Threshold {
    tenths: u32,
}

impl Threshold {
    pub fn from_inches(inches: f64) -> Option<Self> {
        if !inches.is_finite() || inches < 0.0 {
            return None;
        }
        Some(Self {
            tenths: (inches * 10.0).round() as u32,
        })
    }

    /// GRIB precipitation limits are expressed in kg m-2, i.e. millimetres.
    pub fn from_millimetres(mm: f64) -> Option<Self> {
        Self::from_inches(mm / MM_PER_INCH)
    }

    pub fn inches(self) -> f64 {
        f64::from(self.tenths) / 10.0
    }

    /// File-name token, `1.0 -> 1p0`.
    pub fn encode(self) -> String {
        format!("{}p{}", self.tenths / 10, self.tenths % 10)
    }

    pub fn decode(token: &str) -> Option<Self> {
        let (whole, frac) = token.split_once('p')?;
        let whole: u32 = whole.parse().ok()?;
        if frac.len() != 1 {
            return None;
        }
        let frac: u32 = frac.parse().ok()?;
        Some(Self {
            tenths: whole * 10 + frac,
        })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tenths / 10, self.tenths % 10)
    }
}

impl TryFrom<f64> for Threshold {
    type Error = NameError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::from_inches(value).ok_or_else(|| NameError::Threshold(value.to_string()))
    }
}

impl From<Threshold> for f64 {
    fn from(value: Threshold) -> Self {
        value.inches()
    }
}

fn stem_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([0-9]{8})([0-9]{2})(f[0-9]+)$").expect("static regex"))
}

/// Split a grid stem (`2024101606f030`) into date, run hour and horizon.
fn parse_stem(stem: &str) -> Option<(NaiveDate, u8, HorizonCode)> {
    let caps = stem_pattern().captures(stem)?;
    let date = NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y%m%d").ok()?;
    let run_hour = caps.get(2)?.as_str().parse().ok()?;
    let horizon = caps.get(3)?.as_str().parse().ok()?;
    Some((date, run_hour, horizon))
}

/// Raw forecast-hour code as it appears in grid file names (`f030`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HorizonCode {
    hours: u32,
}

impl HorizonCode {
    pub fn new(hours: u32) -> Self {
        Self { hours }
    }

    pub fn hours(self) -> u32 {
        self.hours
    }

    /// Calendar-relative horizon after applying the model-run hour offset.
    pub fn shifted(self, hour_offset: i32) -> ForecastHorizon {
        ForecastHorizon::new(self.hours as i32 + hour_offset)
    }
}

impl fmt::Display for HorizonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{:03}", self.hours)
    }
}

impl FromStr for HorizonCode {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('f')
            .filter(|d| !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| NameError::Horizon(s.to_string()))?;
        digits
            .parse()
            .map(Self::new)
            .map_err(|_| NameError::Horizon(s.to_string()))
    }
}

impl TryFrom<String> for HorizonCode {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HorizonCode> for String {
    fn from(value: HorizonCode) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForecastHorizon {
    hours: i32,
}

impl ForecastHorizon {
    pub fn new(hours: i32) -> Self {
        Self { hours }
    }

    pub fn hours(self) -> i32 {
        self.hours
    }

    pub fn label(self) -> String {
        format!("{}h", self.hours)
    }

    pub fn day(self) -> Option<ForecastDay> {
        match self.hours {
            24 => Some(ForecastDay::One),
            48 => Some(ForecastDay::Two),
            72 => Some(ForecastDay::Three),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ForecastDay {
    One,
    Two,
    Three,
}

impl ForecastDay {
    pub const ALL: [ForecastDay; 3] = [ForecastDay::One, ForecastDay::Two, ForecastDay::Three];

    pub fn column(self) -> &'static str {
        match self {
            ForecastDay::One => "prob_1d_perc",
            ForecastDay::Two => "prob_2d_perc",
            ForecastDay::Three => "prob_3d_perc",
        }
    }

    pub fn horizon(self) -> ForecastHorizon {
        match self {
            ForecastDay::One => ForecastHorizon::new(24),
            ForecastDay::Two => ForecastHorizon::new(48),
            ForecastDay::Three => ForecastHorizon::new(72),
        }
    }
}

/// Eight-digit date token of a grid file: the first eight characters of the
/// last `_`-separated segment.
pub fn date_token(file_name: &str) -> Option<NaiveDate> {
    let tail = file_name.rsplit('_').next()?;
    let token = tail.get(..8)?;
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(token, "%Y%m%d").ok()
}

/// Trailing `_` segment of a file stem, e.g. `2024101606f030` for
/// `sbs_pqpf_p24i_conus_2024101606f030.grb`.
pub fn grid_stem(file_name: &str) -> &str {
    let stem = file_name.split('.').next().unwrap_or(file_name);
    stem.rsplit('_').next().unwrap_or(stem)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridFileName {
    pub prefix: String,
    pub date: NaiveDate,
    pub run_hour: u8,
    pub horizon: HorizonCode,
}

impl GridFileName {
    pub fn new(prefix: impl Into<String>, date: NaiveDate, run_hour: u8, horizon: HorizonCode) -> Self {
        Self {
            prefix: prefix.into(),
            date,
            run_hour,
            horizon,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}{:02}{}.{}",
            self.prefix,
            self.date.format("%Y%m%d"),
            self.run_hour,
            self.horizon,
            GRIB_EXTENSION
        )
    }

    pub fn parse(name: &str) -> Result<Self, NameError> {
        let err = || NameError::GridFile(name.to_string());
        let stem = name
            .strip_suffix(&format!(".{GRIB_EXTENSION}"))
            .ok_or_else(err)?;
        let (prefix, tail) = stem.rsplit_once('_').ok_or_else(err)?;
        let (date, run_hour, horizon) = parse_stem(tail).ok_or_else(err)?;
        Ok(Self::new(prefix, date, run_hour, horizon))
    }
}

impl fmt::Display for GridFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridFileState {
    Missing,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridFile {
    pub name: GridFileName,
    pub local_path: PathBuf,
    pub state: GridFileState,
}

/// Outcome of the freshness gate for a homogeneous cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "date", rename_all = "snake_case")]
pub enum Freshness {
    Fresh(NaiveDate),
    Stale(NaiveDate),
}

impl Freshness {
    pub fn data_date(self) -> NaiveDate {
        match self {
            Freshness::Fresh(date) | Freshness::Stale(date) => date,
        }
    }

    pub fn allows_persist(self) -> bool {
        matches!(self, Freshness::Fresh(_))
    }
}

/// Single-band raster exported for one (grid file, threshold) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdRaster {
    pub source: Option<PathBuf>,
    pub threshold: Threshold,
    pub horizon: HorizonCode,
    pub path: PathBuf,
}

impl ThresholdRaster {
    pub fn file_name(prefix: &str, grid_file_name: &str, threshold: Threshold) -> String {
        format!(
            "{prefix}_{}_{}.{TIFF_EXTENSION}",
            grid_stem(grid_file_name),
            threshold.encode()
        )
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, NameError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NameError::ThresholdRaster(path.display().to_string()))?;
        let err = || NameError::ThresholdRaster(name.to_string());
        // {prefix}_{stem}_{threshold}.tif; the prefix may itself contain `_`.
        let base = name
            .strip_suffix(&format!(".{TIFF_EXTENSION}"))
            .ok_or_else(err)?;
        let (rest, token) = base.rsplit_once('_').ok_or_else(err)?;
        let (_, stem) = rest.rsplit_once('_').ok_or_else(err)?;
        let (_, _, horizon) = parse_stem(stem).ok_or_else(err)?;
        let threshold = Threshold::decode(token).ok_or_else(err)?;
        Ok(Self {
            source: None,
            threshold,
            horizon,
            path: path.to_path_buf(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Lease,
    Cmu,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitGeometry {
    Point(Point<f64>),
    Area(MultiPolygon<f64>),
}

/// A lease point or CMU polygon/centroid scored against threshold rasters.
/// Whether it is a lease or a CMU is a property of the layer it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialUnit {
    pub id: String,
    pub cmu_name: String,
    /// `None` when the layer carries no threshold column; such units match
    /// every raster.
    pub threshold: Option<Threshold>,
    pub geometry: UnitGeometry,
}

impl SpatialUnit {
    pub fn matches(&self, threshold: Threshold) -> bool {
        self.threshold.map_or(true, |own| own == threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationRow {
    pub unit_id: String,
    pub group_key: String,
    pub horizon: ForecastHorizon,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RiskCategory {
    VeryLow = 1,
    Low = 2,
    Moderate = 3,
    High = 4,
    VeryHigh = 5,
}

const RISK_CUTOFFS: [(f64, RiskCategory); 4] = [
    (0.90, RiskCategory::VeryHigh),
    (0.75, RiskCategory::High),
    (0.50, RiskCategory::Moderate),
    (0.25, RiskCategory::Low),
];

impl RiskCategory {
    /// Cutoffs are inclusive lower bounds. Anything below the lowest cutoff,
    /// NaN included, is `VeryLow`.
    pub fn from_probability(probability: f64) -> Self {
        RISK_CUTOFFS
            .iter()
            .find(|(cutoff, _)| probability >= *cutoff)
            .map(|(_, category)| *category)
            .unwrap_or(RiskCategory::VeryLow)
    }
}

impl From<RiskCategory> for u8 {
    fn from(value: RiskCategory) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for RiskCategory {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RiskCategory::VeryLow),
            2 => Ok(RiskCategory::Low),
            3 => Ok(RiskCategory::Moderate),
            4 => Ok(RiskCategory::High),
            5 => Ok(RiskCategory::VeryHigh),
            other => Err(format!("risk category out of range: {other}")),
        }
    }
}

/// One CMU's day-relative risk categories; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRecord {
    pub cmu_name: String,
    pub prob_1d_perc: Option<RiskCategory>,
    pub prob_2d_perc: Option<RiskCategory>,
    pub prob_3d_perc: Option<RiskCategory>,
}

impl RiskRecord {
    pub fn new(cmu_name: impl Into<String>) -> Self {
        Self {
            cmu_name: cmu_name.into(),
            prob_1d_perc: None,
            prob_2d_perc: None,
            prob_3d_perc: None,
        }
    }

    pub fn get(&self, day: ForecastDay) -> Option<RiskCategory> {
        match day {
            ForecastDay::One => self.prob_1d_perc,
            ForecastDay::Two => self.prob_2d_perc,
            ForecastDay::Three => self.prob_3d_perc,
        }
    }

    pub fn set(&mut self, day: ForecastDay, category: RiskCategory) {
        let slot = match day {
            ForecastDay::One => &mut self.prob_1d_perc,
            ForecastDay::Two => &mut self.prob_2d_perc,
            ForecastDay::Three => &mut self.prob_3d_perc,
        };
        *slot = Some(category);
    }
}

/// Process-wide facts fixed at orchestrator start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub run_date: NaiveDate,
}

impl PipelineRun {
    pub fn start(region: impl Into<String>, run_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            region: region.into(),
            started_at: Utc::now(),
            run_date,
        }
    }
}
