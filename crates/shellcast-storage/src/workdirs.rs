use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::StorageError;

/// Per-run working directories under one data root.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    root: PathBuf,
}

impl WorkDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn subsets(&self) -> PathBuf {
        self.root.join("subsets")
    }

    pub fn tiffs(&self) -> PathBuf {
        self.root.join("tiffs")
    }

    pub fn resample(&self) -> PathBuf {
        self.root.join("resample")
    }

    pub fn intermediate(&self) -> PathBuf {
        self.root.join("intermediate")
    }

    pub fn outputs(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub async fn prepare(&self) -> Result<(), StorageError> {
        for dir in [
            self.raw(),
            self.subsets(),
            self.tiffs(),
            self.resample(),
            self.intermediate(),
            self.outputs(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(StorageError::io("creating directory", &dir))?;
        }
        Ok(())
    }
}

/// Remove every file in `dir`, creating it when absent.
pub async fn clear_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir)
        .await
        .map_err(StorageError::io("creating directory", dir))?;
    for path in crate::list_files(dir, None).await? {
        fs::remove_file(&path)
            .await
            .map_err(StorageError::io("removing", &path))?;
    }
    debug!(dir = %dir.display(), "cleared working directory");
    Ok(())
}
