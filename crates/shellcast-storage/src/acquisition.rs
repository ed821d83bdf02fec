use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use shellcast_core::{GridFile, GridFileName, GridFileState, HorizonCode};
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tokio::fs;
use tracing::{info, info_span, Instrument};

use crate::cache::GridCache;
use crate::{sha256_hex, write_atomic, StorageError};

/// Remote catalogue of dated grid files.
#[async_trait]
pub trait GridSource: Send + Sync {
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Box<dyn GridSession>, StorageError>;
}

/// One connected session; files are fetched by name.
#[async_trait]
pub trait GridSession: Send {
    async fn fetch(&mut self, file_name: &str) -> Result<Vec<u8>, StorageError>;

    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct FtpGridSource {
    pub host: String,
    pub port: u16,
    pub cwd: String,
    pub timeout: Duration,
}

impl FtpGridSource {
    pub fn new(host: impl Into<String>, cwd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port: 21,
            cwd: cwd.into(),
            timeout,
        }
    }
}

#[async_trait]
impl GridSource for FtpGridSource {
    fn describe(&self) -> String {
        format!("ftp://{}:{}/{}", self.host, self.port, self.cwd)
    }

    async fn open(&self) -> Result<Box<dyn GridSession>, StorageError> {
        let host = self.host.clone();
        let port = self.port;
        let cwd = self.cwd.clone();
        let timeout = self.timeout;

        let stream = run_blocking(timeout, "connect", move || {
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|err| format!("resolving {host}: {err}"))?
                .next()
                .ok_or_else(|| format!("no address for {host}"))?;
            let mut stream = FtpStream::connect_timeout(addr, timeout).map_err(|e| e.to_string())?;
            stream
                .get_ref()
                .set_read_timeout(Some(timeout))
                .map_err(|e| e.to_string())?;
            stream
                .get_ref()
                .set_write_timeout(Some(timeout))
                .map_err(|e| e.to_string())?;
            stream
                .login("anonymous", "anonymous")
                .map_err(|e| e.to_string())?;
            stream.cwd(&cwd).map_err(|e| e.to_string())?;
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| e.to_string())?;
            Ok(stream)
        })
        .await
        .map_err(StorageError::Session)?;

        Ok(Box::new(FtpGridSession {
            stream: Some(stream),
            timeout,
        }))
    }
}

struct FtpGridSession {
    stream: Option<FtpStream>,
    timeout: Duration,
}

#[async_trait]
impl GridSession for FtpGridSession {
    async fn fetch(&mut self, file_name: &str) -> Result<Vec<u8>, StorageError> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| StorageError::Session("ftp session already failed".to_string()))?;
        let name = file_name.to_string();
        let (stream, bytes) = run_blocking(self.timeout, "retr", move || {
            let cursor = stream.retr_as_buffer(&name).map_err(|e| e.to_string())?;
            Ok((stream, cursor.into_inner()))
        })
        .await
        .map_err(|message| StorageError::Transfer {
            file: file_name.to_string(),
            message,
        })?;
        self.stream = Some(stream);
        Ok(bytes)
    }

    async fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        run_blocking(self.timeout, "quit", move || {
            stream.quit().map_err(|e| e.to_string())
        })
        .await
        .map_err(StorageError::Session)
    }
}

async fn run_blocking<T, F>(timeout: Duration, op: &'static str, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(format!("ftp {op} task failed: {join}")),
        Err(_) => Err(format!("ftp {op} timed out after {}s", timeout.as_secs())),
    }
}

/// Local mirror of the remote catalogue.
#[derive(Debug, Clone)]
pub struct DirectoryGridSource {
    pub dir: PathBuf,
}

impl DirectoryGridSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl GridSource for DirectoryGridSource {
    fn describe(&self) -> String {
        format!("dir://{}", self.dir.display())
    }

    async fn open(&self) -> Result<Box<dyn GridSession>, StorageError> {
        if !fs::try_exists(&self.dir)
            .await
            .map_err(StorageError::io("checking", &self.dir))?
        {
            return Err(StorageError::Session(format!(
                "mirror directory {} does not exist",
                self.dir.display()
            )));
        }
        Ok(Box::new(DirectoryGridSession {
            dir: self.dir.clone(),
        }))
    }
}

struct DirectoryGridSession {
    dir: PathBuf,
}

#[async_trait]
impl GridSession for DirectoryGridSession {
    async fn fetch(&mut self, file_name: &str) -> Result<Vec<u8>, StorageError> {
        fs::read(self.dir.join(file_name))
            .await
            .map_err(|err| StorageError::Transfer {
                file: file_name.to_string(),
                message: err.to_string(),
            })
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// File-name template for one product: prefix, model run hour, horizon codes.
#[derive(Debug, Clone)]
pub struct GridTemplate {
    pub prefix: String,
    pub run_hour: u8,
    pub horizons: Vec<HorizonCode>,
}

impl GridTemplate {
    pub fn expected(&self, date: NaiveDate) -> Vec<GridFileName> {
        self.horizons
            .iter()
            .map(|h| GridFileName::new(self.prefix.clone(), date, self.run_hour, *h))
            .collect()
    }
}

pub struct GridAcquisition {
    source: Arc<dyn GridSource>,
    cache: GridCache,
    template: GridTemplate,
}

impl GridAcquisition {
    pub fn new(source: Arc<dyn GridSource>, cache: GridCache, template: GridTemplate) -> Self {
        Self {
            source,
            cache,
            template,
        }
    }

    pub fn expected_files(&self, date: NaiveDate) -> Vec<GridFileName> {
        self.template.expected(date)
    }

    /// Expected files absent from the cache, marked `Missing`.
    pub async fn files_to_download(&self, expected: &[GridFileName]) -> Result<Vec<GridFile>, StorageError> {
        let mut missing = Vec::new();
        for name in expected {
            let file_name = name.file_name();
            if !self.cache.contains(&file_name).await? {
                missing.push(GridFile {
                    local_path: self.cache.path_for(&file_name),
                    name: name.clone(),
                    state: GridFileState::Missing,
                });
            }
        }
        if missing.is_empty() {
            info!("no data to download");
        }
        Ok(missing)
    }

    /// Fetch every file over a single session. The first failure aborts.
    pub async fn download(&self, files: &[GridFile]) -> Result<Vec<GridFile>, StorageError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let span = info_span!("grid_download", source = %self.source.describe(), files = files.len());
        async {
            let mut session = self.source.open().await?;
            let mut downloaded = Vec::with_capacity(files.len());
            for file in files {
                let name = file.name.file_name();
                let bytes = match session.fetch(&name).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = session.close().await;
                        return Err(err);
                    }
                };
                if let Err(err) = write_atomic(&file.local_path, &bytes).await {
                    let _ = session.close().await;
                    return Err(err);
                }
                let sha256 = sha256_hex(&bytes);
                info!(file = %name, bytes = bytes.len(), %sha256, "downloaded grid file");
                downloaded.push(GridFile {
                    state: GridFileState::Downloaded,
                    ..file.clone()
                });
            }
            session.close().await?;
            Ok(downloaded)
        }
        .instrument(span)
        .await
    }
}
