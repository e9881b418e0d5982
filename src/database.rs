use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::error::StoreError;
use crate::grading::{
    GradingConfig, GradingConfigId, GradingResult, Submission, SubmissionId, SubmittedFile,
};
use crate::store::{ResultId, ResultStore, StoredResult, SubmissionSource};

const DATABASE_NAME: &str = "autograder.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "autograder").context("Unable to find user directory")?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS grading_configs (
            id            INTEGER PRIMARY KEY,
            body          TEXT    NOT NULL,
            updated_time  TEXT    NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id                 INTEGER PRIMARY KEY,
            grading_config_id  INTEGER NOT NULL,
            created_time       TEXT    NOT NULL,
            FOREIGN KEY (grading_config_id) REFERENCES grading_configs (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submission_files (
            submission_id  INTEGER NOT NULL,
            name           TEXT    NOT NULL,
            content        BLOB    NOT NULL,
            PRIMARY KEY (submission_id, name),
            FOREIGN KEY (submission_id) REFERENCES submissions (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS grading_results (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id      INTEGER NOT NULL,
            grading_config_id  INTEGER NOT NULL,
            attempt            INTEGER NOT NULL,
            status             TEXT    NOT NULL,
            total_points       INTEGER NOT NULL,
            max_points         INTEGER NOT NULL,
            needs_review       INTEGER NOT NULL,
            body               TEXT    NOT NULL,
            created_time       TEXT    NOT NULL,
            UNIQUE (submission_id, attempt),
            FOREIGN KEY (submission_id) REFERENCES submissions (id)
        );",
        "CREATE INDEX IF NOT EXISTS idx_grading_results_review ON grading_results(needs_review);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Submissions, grading configurations and results in the shared SQLite
/// database
///
/// The web application owns the first two tables; the grading core only
/// writes `grading_results`, and only by appending.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates or replaces a grading configuration under its own id
    pub async fn save_grading_config(&self, config: &GradingConfig) -> Result<(), StoreError> {
        let body = serde_json::to_string(config)?;
        sqlx::query(
            r"
            INSERT INTO grading_configs (id, body, updated_time) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_time = excluded.updated_time
            ",
        )
        .bind(config.id.0)
        .bind(body)
        .bind(create_timestamp())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Stores a submission with its files and returns the new id
    pub async fn create_submission(
        &self,
        grading_config_id: GradingConfigId,
        files: &[SubmittedFile],
    ) -> Result<SubmissionId, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO submissions (grading_config_id, created_time) VALUES (?, ?)",
        )
        .bind(grading_config_id.0)
        .bind(create_timestamp())
        .execute(tx.as_mut())
        .await?;
        let id = SubmissionId(result.last_insert_rowid());

        for file in files {
            sqlx::query("INSERT INTO submission_files (submission_id, name, content) VALUES (?, ?, ?)")
                .bind(id.0)
                .bind(&file.name)
                .bind(&file.content)
                .execute(tx.as_mut())
                .await?;
        }

        tx.commit().await?;
        log::debug!("Inserted submission {id} with {} file(s)", files.len());
        Ok(id)
    }
}

#[async_trait]
impl SubmissionSource for SqliteStore {
    async fn submission(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT grading_config_id FROM submissions WHERE id = ?")
                .bind(id.0)
                .fetch_optional(self.pool.as_ref())
                .await?;
        let Some((grading_config_id,)) = row else {
            return Err(StoreError::SubmissionNotFound(id));
        };

        let files: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT name, content FROM submission_files WHERE submission_id = ? ORDER BY name",
        )
        .bind(id.0)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(Submission {
            id,
            grading_config_id: GradingConfigId(grading_config_id),
            files: files
                .into_iter()
                .map(|(name, content)| SubmittedFile { name, content })
                .collect(),
        })
    }

    async fn grading_config(&self, id: GradingConfigId) -> Result<Arc<GradingConfig>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM grading_configs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(self.pool.as_ref())
            .await?;
        let Some((body,)) = row else {
            return Err(StoreError::GradingConfigNotFound(id));
        };

        let config = GradingConfig::from_json(&body).inspect_err(|e| {
            log::warn!("Grading config {id} failed validation: {e}");
        })?;
        if config.id != id {
            log::warn!(
                "Grading config stored under id {id} declares id {}",
                config.id
            );
        }
        Ok(config)
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn insert_result(&self, result: &GradingResult) -> Result<ResultId, StoreError> {
        let body = serde_json::to_string(result)?;

        let inserted = sqlx::query(
            r"
            INSERT INTO grading_results
                (submission_id, grading_config_id, attempt, status, total_points, max_points,
                 needs_review, body, created_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(submission_id, attempt) DO NOTHING
            ",
        )
        .bind(result.submission_id.0)
        .bind(result.grading_config_id.0)
        .bind(result.attempt)
        .bind(result.status.as_str())
        .bind(result.total_points)
        .bind(result.max_points)
        .bind(result.needs_review)
        .bind(body)
        .bind(create_timestamp())
        .execute(self.pool.as_ref())
        .await?;

        if inserted.rows_affected() == 0 {
            log::debug!(
                "Result of submission {} attempt {} already stored",
                result.submission_id,
                result.attempt
            );
        }

        let (id,): (i64,) = sqlx::query_as(
            "SELECT id FROM grading_results WHERE submission_id = ? AND attempt = ?",
        )
        .bind(result.submission_id.0)
        .bind(result.attempt)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(ResultId(id))
    }

    async fn results_for(&self, submission: SubmissionId) -> Result<Vec<StoredResult>, StoreError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, body FROM grading_results WHERE submission_id = ? ORDER BY attempt",
        )
        .bind(submission.0)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|(id, body)| {
                Ok(StoredResult {
                    id: ResultId(id),
                    result: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    async fn latest_attempt(&self, submission: SubmissionId) -> Result<u32, StoreError> {
        let (latest,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(attempt) FROM grading_results WHERE submission_id = ?")
                .bind(submission.0)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(latest.unwrap_or(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::GradingStatus;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
        "id": 4,
        "limits": { "total_time": 10000, "total_points": 5 },
        "steps": [
            { "name": "run", "kind": "test", "program": "true", "points": 5 }
        ]
    }"#;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("test.sqlite3")).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    async fn seeded() -> (tempfile::TempDir, SqliteStore, SubmissionId) {
        let (dir, store) = store().await;
        let config = GradingConfig::from_json(CONFIG).unwrap();
        store.save_grading_config(&config).await.unwrap();
        let id = store
            .create_submission(
                config.id,
                &[SubmittedFile {
                    name: "main.c".to_string(),
                    content: b"int main() { return 0; }".to_vec(),
                }],
            )
            .await
            .unwrap();
        (dir, store, id)
    }

    #[tokio::test]
    async fn test_submission_round_trip() {
        let (_dir, store, id) = seeded().await;
        let submission = store.submission(id).await.unwrap();
        assert_eq!(submission.grading_config_id, GradingConfigId(4));
        assert_eq!(submission.files.len(), 1);
        assert_eq!(submission.files[0].name, "main.c");

        let config = store.grading_config(GradingConfigId(4)).await.unwrap();
        assert_eq!(config.limits.total_points, 5);
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.submission(SubmissionId(1)).await,
            Err(StoreError::SubmissionNotFound(_))
        ));
        assert!(matches!(
            store.grading_config(GradingConfigId(1)).await,
            Err(StoreError::GradingConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_on_load() {
        let (_dir, store) = store().await;
        sqlx::query("INSERT INTO grading_configs (id, body, updated_time) VALUES (9, ?, '')")
            .bind(r#"{"id": 9, "limits": {"total_time": 1, "total_points": 0}, "steps": []}"#)
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            store.grading_config(GradingConfigId(9)).await,
            Err(StoreError::InvalidGradingConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_result_is_idempotent() {
        let (_dir, store, id) = seeded().await;
        let mut result = GradingResult::without_steps(
            id,
            GradingConfigId(4),
            1,
            5,
            GradingStatus::Completed,
            None,
        );
        result.total_points = 5;

        let first = store.insert_result(&result).await.unwrap();
        let mut again = result.clone();
        again.status = GradingStatus::Cancelled;
        let second = store.insert_result(&again).await.unwrap();
        assert_eq!(first, second);

        let stored = store.results_for(id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].result, result);
    }

    #[tokio::test]
    async fn test_latest_attempt() {
        let (_dir, store, id) = seeded().await;
        assert_eq!(store.latest_attempt(id).await.unwrap(), 0);
        for attempt in [2, 1] {
            let result = GradingResult::without_steps(
                id,
                GradingConfigId(4),
                attempt,
                5,
                GradingStatus::InfrastructureError,
                None,
            );
            store.insert_result(&result).await.unwrap();
        }
        assert_eq!(store.latest_attempt(id).await.unwrap(), 2);

        let attempts: Vec<u32> = store
            .results_for(id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.result.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }
}
