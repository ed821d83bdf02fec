//! Destination database: daily risk rows and the lease registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shellcast_core::RiskRecord;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{Executor, MySql, QueryBuilder, Row};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{ensure_identifier, DatabaseConfig};
use crate::stages::merge::read_records_csv;

const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row count mismatch: wrote {expected}, database reports {actual} for today")]
    RowCountMismatch { expected: usize, actual: usize },
    #[error("{} holds no risk rows", .0.display())]
    EmptyCsv(PathBuf),
    #[error("reading {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("unsafe SQL identifier: {0}")]
    InvalidIdentifier(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub inserted: usize,
    pub verified: usize,
    pub matched: bool,
}

/// Compare the rows written against the rows the database reports for today.
pub fn verify_row_count(expected: usize, actual: usize, strict: bool) -> Result<bool, PersistError> {
    if expected == actual {
        return Ok(true);
    }
    if strict {
        return Err(PersistError::RowCountMismatch { expected, actual });
    }
    warn!(expected, actual, "row count mismatch after insert");
    Ok(false)
}

#[async_trait]
pub trait RiskStore: Send + Sync {
    async fn ping(&self) -> Result<(), PersistError>;

    /// Replace today's rows with `records` in one transaction.
    async fn replace_today(&self, records: &[RiskRecord]) -> Result<PersistReport, PersistError>;
}

/// Opens the run's [`RiskStore`]. Connection failures surface at the
/// connectivity check so they are reported like any other stage failure.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RiskStore>, PersistError>;
}

/// An already open store.
#[async_trait]
impl StoreConnector for Arc<dyn RiskStore> {
    async fn connect(&self) -> Result<Arc<dyn RiskStore>, PersistError> {
        Ok(Arc::clone(self))
    }
}

pub struct MySqlConnector {
    config: DatabaseConfig,
}

impl MySqlConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for MySqlConnector {
    async fn connect(&self) -> Result<Arc<dyn RiskStore>, PersistError> {
        Ok(Arc::new(MySqlRiskStore::connect(&self.config).await?))
    }
}

pub struct MySqlRiskStore {
    pool: MySqlPool,
    table: String,
    delete_procedure: String,
    select_procedure: String,
    leases_table: String,
    strict_row_count: bool,
}

impl MySqlRiskStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PersistError> {
        for ident in [
            &config.table,
            &config.delete_procedure,
            &config.select_procedure,
            &config.leases_table,
        ] {
            ensure_identifier(ident).map_err(|_| PersistError::InvalidIdentifier(ident.clone()))?;
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;
        Ok(Self {
            pool,
            table: config.table.clone(),
            delete_procedure: config.delete_procedure.clone(),
            select_procedure: config.select_procedure.clone(),
            leases_table: config.leases_table.clone(),
            strict_row_count: config.strict_row_count,
        })
    }

    /// Insert leases missing from the registry and refresh the ones present.
    pub async fn upsert_leases(&self, leases: &[LeaseRecord]) -> Result<LeaseSyncReport, PersistError> {
        let existing: HashSet<String> = sqlx::query(&format!("SELECT lease_id FROM {}", self.leases_table))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.try_get::<String, _>("lease_id"))
            .collect::<Result<_, _>>()?;
        let report = partition_leases(leases, &existing);

        let mut tx = self.pool.begin().await?;
        for chunk in leases.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
                "INSERT INTO {} (lease_id, grow_area_name, grow_area_desc, cmu_name, rainfall_thresh_in, latitude, longitude) ",
                self.leases_table
            ));
            qb.push_values(chunk, |mut b, lease| {
                b.push_bind(lease.lease_id.as_str())
                    .push_bind(lease.grow_area_name.as_str())
                    .push_bind(lease.grow_area_desc.as_deref())
                    .push_bind(lease.cmu_name.as_str())
                    .push_bind(lease.rainfall_thresh_in)
                    .push_bind(lease.latitude)
                    .push_bind(lease.longitude);
            });
            qb.push(
                " ON DUPLICATE KEY UPDATE grow_area_name = VALUES(grow_area_name), \
                 grow_area_desc = VALUES(grow_area_desc), cmu_name = VALUES(cmu_name), \
                 rainfall_thresh_in = VALUES(rainfall_thresh_in), latitude = VALUES(latitude), \
                 longitude = VALUES(longitude)",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(
            total = report.total,
            inserted = report.inserted,
            updated = report.updated,
            "lease registry synced"
        );
        Ok(report)
    }
}

#[async_trait]
impl RiskStore for MySqlRiskStore {
    async fn ping(&self) -> Result<(), PersistError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn replace_today(&self, records: &[RiskRecord]) -> Result<PersistReport, PersistError> {
        let span = info_span!("replace_today", table = %self.table, rows = records.len());
        async move {
            let mut tx = self.pool.begin().await?;

            let delete = format!("CALL {}()", self.delete_procedure);
            (&mut *tx).execute(sqlx::raw_sql(&delete)).await?;

            let mut inserted = 0usize;
            for chunk in records.chunks(INSERT_CHUNK) {
                let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
                    "INSERT INTO {} (cmu_name, prob_1d_perc, prob_2d_perc, prob_3d_perc) ",
                    self.table
                ));
                qb.push_values(chunk, |mut b, record| {
                    b.push_bind(record.cmu_name.as_str())
                        .push_bind(record.prob_1d_perc.map(u8::from))
                        .push_bind(record.prob_2d_perc.map(u8::from))
                        .push_bind(record.prob_3d_perc.map(u8::from));
                });
                inserted += qb.build().execute(&mut *tx).await?.rows_affected() as usize;
            }

            let select = format!("CALL {}()", self.select_procedure);
            let verified = (&mut *tx).fetch_all(sqlx::raw_sql(&select)).await?.len();

            match verify_row_count(records.len(), verified, self.strict_row_count) {
                Ok(matched) => {
                    tx.commit().await?;
                    info!(inserted, verified, matched, "risk rows committed");
                    Ok(PersistReport {
                        inserted,
                        verified,
                        matched,
                    })
                }
                Err(err) => {
                    tx.rollback().await?;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Loads the merged CSV and hands it to a [`RiskStore`].
pub struct PersistenceWriter<'a> {
    store: &'a dyn RiskStore,
}

impl<'a> PersistenceWriter<'a> {
    pub fn new(store: &'a dyn RiskStore) -> Self {
        Self { store }
    }

    pub async fn persist(&self, csv_path: &Path) -> Result<PersistReport, PersistError> {
        let records = read_records_csv(csv_path).map_err(|source| PersistError::Csv {
            path: csv_path.to_path_buf(),
            source,
        })?;
        if records.is_empty() {
            return Err(PersistError::EmptyCsv(csv_path.to_path_buf()));
        }
        info!(csv = %csv_path.display(), rows = records.len(), "[Update MySQL database]");
        self.store.replace_today(&records).await
    }
}

/// One row of the lease centroid table produced by preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease_id: String,
    pub grow_area_name: String,
    pub grow_area_desc: Option<String>,
    pub cmu_name: String,
    pub rainfall_thresh_in: f64,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LeaseSyncReport {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
}

pub fn read_leases_csv(path: &Path) -> Result<Vec<LeaseRecord>, PersistError> {
    let csv_err = |source| PersistError::Csv {
        path: path.to_path_buf(),
        source,
    };
    csv::Reader::from_path(path)
        .map_err(csv_err)?
        .deserialize()
        .collect::<Result<Vec<_>, _>>()
        .map_err(csv_err)
}

pub fn partition_leases(leases: &[LeaseRecord], existing: &HashSet<String>) -> LeaseSyncReport {
    let updated = leases.iter().filter(|l| existing.contains(&l.lease_id)).count();
    LeaseSyncReport {
        total: leases.len(),
        inserted: leases.len() - updated,
        updated,
    }
}
