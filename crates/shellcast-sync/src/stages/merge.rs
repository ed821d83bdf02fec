use std::collections::BTreeMap;
use std::path::Path;

use shellcast_core::RiskRecord;

/// Union of two layers' records: every primary row, plus fallback rows for
/// CMUs the primary does not cover. Sorted by CMU name.
pub fn merge(primary: Vec<RiskRecord>, fallback: Vec<RiskRecord>) -> Vec<RiskRecord> {
    let mut by_name: BTreeMap<String, RiskRecord> = BTreeMap::new();
    for record in primary {
        by_name.entry(record.cmu_name.clone()).or_insert(record);
    }
    for record in fallback {
        by_name.entry(record.cmu_name.clone()).or_insert(record);
    }
    by_name.into_values().collect()
}

/// Fold layers in priority order; earlier layers win.
pub fn merge_all(layers: Vec<Vec<RiskRecord>>) -> Vec<RiskRecord> {
    layers.into_iter().fold(Vec::new(), merge)
}

pub fn write_records_csv(path: &Path, records: &[RiskRecord]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    if records.is_empty() {
        writer.write_record(["cmu_name", "prob_1d_perc", "prob_2d_perc", "prob_3d_perc"])?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_records_csv(path: &Path) -> Result<Vec<RiskRecord>, csv::Error> {
    csv::Reader::from_path(path)?.deserialize().collect()
}
