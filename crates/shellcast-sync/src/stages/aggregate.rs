use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use shellcast_core::{ObservationRow, RiskCategory, RiskRecord};
use tracing::info;

use super::merge::write_records_csv;
use super::StageError;

/// Mean probability of one CMU at one horizon, kept for the audit CSV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMean {
    pub cmu_name: String,
    pub horizon: String,
    pub mean: f64,
    pub mean_percent: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub records: Vec<RiskRecord>,
    pub means: Vec<GroupMean>,
}

/// Group observations by CMU and horizon, average them and classify each mean.
pub fn aggregate(observations: &[ObservationRow]) -> Result<Aggregation, StageError> {
    let mut sums: BTreeMap<(&str, _), (f64, usize)> = BTreeMap::new();
    for row in observations {
        let slot = sums.entry((row.group_key.as_str(), row.horizon)).or_default();
        slot.0 += row.value;
        slot.1 += 1;
    }

    let mut records: BTreeMap<&str, RiskRecord> = BTreeMap::new();
    let mut means = Vec::with_capacity(sums.len());
    for ((cmu_name, horizon), (sum, count)) in sums {
        let Some(day) = horizon.day() else {
            return Err(StageError::UnexpectedHorizon {
                label: horizon.label(),
                group: cmu_name.to_string(),
            });
        };
        let mean = sum / count as f64;
        records
            .entry(cmu_name)
            .or_insert_with(|| RiskRecord::new(cmu_name))
            .set(day, RiskCategory::from_probability(mean));
        means.push(GroupMean {
            cmu_name: cmu_name.to_string(),
            horizon: horizon.label(),
            mean,
            mean_percent: (mean * 100.0).round() as i64,
            count,
        });
    }

    Ok(Aggregation {
        records: records.into_values().collect(),
        means,
    })
}

/// Write `aggs_<layer>.csv` and `pqpf_<layer>_<date>.csv` under `dir`,
/// returning the categorized table's path.
pub fn write_layer_outputs(
    dir: &Path,
    layer: &str,
    data_date: NaiveDate,
    aggregation: &Aggregation,
) -> Result<PathBuf, StageError> {
    let audit = dir.join(format!("aggs_{layer}.csv"));
    let csv_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: csv::Error| StageError::Csv { path, source }
    };
    let mut writer = csv::Writer::from_path(&audit).map_err(csv_err(&audit))?;
    for mean in &aggregation.means {
        writer.serialize(mean).map_err(csv_err(&audit))?;
    }
    writer
        .flush()
        .map_err(csv::Error::from)
        .map_err(csv_err(&audit))?;

    let table = dir.join(format!("pqpf_{layer}_{}.csv", data_date.format("%Y-%m-%d")));
    write_records_csv(&table, &aggregation.records).map_err(csv_err(&table))?;
    info!(
        layer,
        audit = %audit.display(),
        table = %table.display(),
        cmus = aggregation.records.len(),
        "wrote layer aggregates"
    );
    Ok(table)
}
