//! libSQL result store.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the latest
//! predictions table and the history of inference runs that produced it.
//!
//! **Access rules:**
//! - Pipeline: read-write (sole writer) via [`Storage::open`]
//! - Reporting and inspection: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use burnwatch_shared::{BurnwatchError, PredictionRecord, Result};
use chrono::Utc;
use libsql::{Connection, Database, params};
use serde::Serialize;
use uuid::Uuid;

/// One recorded inference run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRun {
    pub id: String,
    /// RFC 3339 timestamp.
    pub started_at: String,
    pub model_path: String,
    pub row_count: u64,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: libsql::Error) -> BurnwatchError {
    BurnwatchError::storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BurnwatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(BurnwatchError::storage(format!(
                "no results database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        BurnwatchError::storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BurnwatchError::storage(
                "database is opened in read-only mode",
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Predictions
    // -----------------------------------------------------------------------

    /// Replace the predictions table with `rows` and record the run.
    ///
    /// Everything happens in one transaction: readers see either the previous
    /// table or the new one. Returns the run id.
    pub async fn replace_predictions(
        &self,
        rows: &[PredictionRecord],
        model_path: &str,
    ) -> Result<String> {
        self.check_writable()?;
        let run_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM predictions", params![])
            .await
            .map_err(storage_err)?;

        for row in rows {
            tx.execute(
                "INSERT INTO predictions (path, prob, pred) VALUES (?1, ?2, ?3)",
                params![row.path.as_str(), row.prob, i64::from(row.pred)],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.execute(
            "INSERT INTO inference_runs (id, started_at, model_path, row_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id.as_str(), now.as_str(), model_path, rows.len() as i64],
        )
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        tracing::info!(run_id = %run_id, rows = rows.len(), "replaced predictions table");
        Ok(run_id)
    }

    /// All predictions in insertion order.
    pub async fn list_predictions(&self) -> Result<Vec<PredictionRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT path, prob, pred FROM predictions ORDER BY rowid",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let pred = row.get::<i64>(2).map_err(storage_err)?;
            results.push(PredictionRecord {
                path: row.get::<String>(0).map_err(storage_err)?,
                prob: row.get::<f64>(1).map_err(storage_err)?,
                pred: u8::from(pred != 0),
            });
        }
        Ok(results)
    }

    /// Number of rows in the predictions table.
    pub async fn count_predictions(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM predictions", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<u64>(0).map_err(storage_err)?),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Inference runs
    // -----------------------------------------------------------------------

    /// The most recent inference run, if any.
    pub async fn latest_run(&self) -> Result<Option<InferenceRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, model_path, row_count FROM inference_runs
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Number of recorded inference runs.
    pub async fn count_runs(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM inference_runs", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<u64>(0).map_err(storage_err)?),
            None => Ok(0),
        }
    }
}

fn row_to_run(row: &libsql::Row) -> Result<InferenceRun> {
    Ok(InferenceRun {
        id: row.get::<String>(0).map_err(storage_err)?,
        started_at: row.get::<String>(1).map_err(storage_err)?,
        model_path: row.get::<String>(2).map_err(storage_err)?,
        row_count: row.get::<u64>(3).map_err(storage_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("bw_test_{}.db", Uuid::now_v7()))
    }

    async fn test_storage() -> Storage {
        Storage::open(&temp_db()).await.expect("open test db")
    }

    fn rows(n: usize) -> Vec<PredictionRecord> {
        (0..n)
            .map(|i| PredictionRecord::new(format!("data/ndvi/tile_{i:04}_ndvi.tif"), 0.2 * i as f64, 0.5))
            .collect()
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
        assert_eq!(storage.count_predictions().await.unwrap(), 0);
        assert!(storage.latest_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_db();
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn replace_does_not_append() {
        let storage = test_storage().await;

        storage.replace_predictions(&rows(5), "models/final_model.safetensors").await.unwrap();
        assert_eq!(storage.count_predictions().await.unwrap(), 5);

        let run_id = storage
            .replace_predictions(&rows(3), "models/final_model.safetensors")
            .await
            .unwrap();
        assert_eq!(storage.count_predictions().await.unwrap(), 3);

        let listed = storage.list_predictions().await.unwrap();
        assert_eq!(listed, rows(3));
        assert_eq!(listed[2].pred, 0);

        let latest = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(latest.id, run_id);
        assert_eq!(latest.row_count, 3);
        assert_eq!(storage.count_runs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_replace_clears_table() {
        let storage = test_storage().await;
        storage.replace_predictions(&rows(4), "m.safetensors").await.unwrap();
        storage.replace_predictions(&[], "m.safetensors").await.unwrap();
        assert_eq!(storage.count_predictions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn burned_predictions_keep_their_flag() {
        let storage = test_storage().await;
        let input = vec![
            PredictionRecord::new("a_ndvi.tif", 0.9, 0.5),
            PredictionRecord::new("b_ndvi.tif", 0.1, 0.5),
        ];
        storage.replace_predictions(&input, "m.safetensors").await.unwrap();

        let listed = storage.list_predictions().await.unwrap();
        assert_eq!(listed[0].pred, 1);
        assert_eq!(listed[1].pred, 0);
        assert!((listed[0].prob - 0.9).abs() < 1e-12);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_db();
        let rw = Storage::open(&tmp).await.unwrap();
        rw.replace_predictions(&rows(2), "m.safetensors").await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.count_predictions().await.unwrap(), 2);

        let result = ro.replace_predictions(&rows(1), "m.safetensors").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        assert!(Storage::open_readonly(&temp_db()).await.is_err());
    }
}
