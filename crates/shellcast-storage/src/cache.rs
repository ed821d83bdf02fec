use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::NaiveDate;
use shellcast_core::{date_token, Freshness, GRIB_EXTENSION};
use tokio::fs;
use tracing::{info, warn};

use crate::StorageError;

/// The raw `.grb` download cache.
#[derive(Debug, Clone)]
pub struct GridCache {
    dir: PathBuf,
}

impl GridCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub async fn grid_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        crate::list_files(&self.dir, Some(GRIB_EXTENSION)).await
    }

    pub async fn contains(&self, file_name: &str) -> Result<bool, StorageError> {
        let path = self.path_for(file_name);
        fs::try_exists(&path)
            .await
            .map_err(StorageError::io("checking", &path))
    }

    /// Delete everything that is not a `.grb` file dated `date`.
    pub async fn purge_outdated(&self, date: NaiveDate) -> Result<Vec<PathBuf>, StorageError> {
        let mut removed = Vec::new();
        for path in crate::list_files(&self.dir, None).await? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let is_grid = path.extension().and_then(|e| e.to_str()) == Some(GRIB_EXTENSION);
            if is_grid && date_token(name) == Some(date) {
                continue;
            }
            fs::remove_file(&path)
                .await
                .map_err(StorageError::io("removing", &path))?;
            info!(file = name, "removed outdated cache entry");
            removed.push(path);
        }
        Ok(removed)
    }

    /// Every cached grid file must carry the same date token.
    pub async fn check_freshness(&self, run_date: NaiveDate) -> Result<Freshness, StorageError> {
        let mut dates = BTreeSet::new();
        for path in self.grid_files().await? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            match date_token(name) {
                Some(date) => {
                    dates.insert(date);
                }
                None => warn!(file = name, "grid file without a date token ignored"),
            }
        }

        let mut iter = dates.iter().copied();
        match (iter.next(), iter.next()) {
            (None, _) => Err(StorageError::EmptyCache {
                dir: self.dir.clone(),
            }),
            (Some(date), None) if date == run_date => Ok(Freshness::Fresh(date)),
            (Some(date), None) => Ok(Freshness::Stale(date)),
            (Some(_), Some(_)) => Err(StorageError::InconsistentDates {
                dates: dates.into_iter().collect(),
            }),
        }
    }
}
