//! Working-directory layout, raw grid cache and grid acquisition for ShellCast.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod acquisition;
pub mod cache;
pub mod workdirs;

pub use acquisition::{
    DirectoryGridSource, FtpGridSource, GridAcquisition, GridSession, GridSource,
    GridTemplate,
};
pub use cache::GridCache;
pub use workdirs::WorkDirs;

pub const CRATE_NAME: &str = "shellcast-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("grid transfer failed for {file}: {message}")]
    Transfer { file: String, message: String },
    #[error("grid source session failed: {0}")]
    Session(String),
    #[error("raw cache holds grid files for more than one date: {dates:?}")]
    InconsistentDates { dates: Vec<NaiveDate> },
    #[error("raw cache {} holds no dated grid files", .dir.display())]
    EmptyCache { dir: PathBuf },
}

impl StorageError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StorageError::Io {
            action,
            path,
            source,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and a rename, replacing
/// any existing file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(StorageError::io("creating directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(StorageError::io("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(StorageError::io("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(StorageError::io("flushing temp file", &temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io("renaming temp file into", path)(err));
    }
    Ok(())
}

/// Regular files in `dir` carrying `extension`, sorted by name. A missing
/// directory lists as empty.
pub async fn list_files(dir: &Path, extension: Option<&str>) -> Result<Vec<PathBuf>, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageError::io("reading directory", dir)(err)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(StorageError::io("reading directory", dir))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(StorageError::io("inspecting", &path))?;
        if !file_type.is_file() {
            continue;
        }
        let keep = match extension {
            Some(ext) => path.extension().and_then(|e| e.to_str()) == Some(ext),
            None => true,
        };
        if keep {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
