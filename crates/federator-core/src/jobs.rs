//! Append-only job status log and the status derived from it

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::open_pool;
use crate::error::{Error, Result};
use crate::message::{LogEntry, LogLevel};

/// Status message recorded when a job finishes successfully
pub const COMPLETE: &str = "Complete";

/// Status message recorded when a job finishes with a non-200 status
pub const FAILED: &str = "Failed";

/// SQL to create the job status table
pub const CREATE_JOB_STATUS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    status_time TEXT NOT NULL,
    status_msg TEXT NOT NULL,
    status_code INTEGER NOT NULL
);
"#;

pub const CREATE_JOB_STATUS_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_job_status_job_id ON job_status(job_id)";

/// One row of a job's record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub status_time: DateTime<Utc>,
    pub status_msg: String,
    pub status_code: u16,
}

impl JobEntry {
    pub fn new(status_msg: impl Into<String>, status_code: u16) -> Self {
        Self {
            status_time: Utc::now(),
            status_msg: status_msg.into(),
            status_code,
        }
    }

    /// Render as a TRAPI log entry: INFO for 200, ERROR otherwise
    pub fn to_log_entry(&self) -> LogEntry {
        let level = if self.status_code == 200 {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        let mut entry = LogEntry::new(level, self.status_msg.clone());
        entry.timestamp = self.status_time.to_rfc3339();
        entry
    }
}

#[async_trait]
pub trait JobLog: Send + Sync {
    async fn append(&self, job_id: &str, entry: JobEntry) -> Result<()>;

    /// Entries for `job_id` in insertion order
    async fn entries(&self, job_id: &str) -> Result<Vec<JobEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub status: JobStatus,
    pub description: String,
    pub logs: Vec<LogEntry>,
}

impl JobReport {
    /// Derive the status of a job from its record.
    ///
    /// The last entry decides: `Complete` means done, a non-200 code means
    /// failed, and an entry older than `stale_after` means the job died
    /// without reporting.
    pub fn from_entries(entries: &[JobEntry], stale_after: Duration, now: DateTime<Utc>) -> Self {
        let logs = entries.iter().map(JobEntry::to_log_entry).collect();
        let Some(last) = entries.last() else {
            return Self {
                status: JobStatus::Failed,
                description: "No record of this job id is found, possibly due to a server restart."
                    .to_string(),
                logs,
            };
        };

        let (status, description) = if last.status_msg == COMPLETE {
            (JobStatus::Completed, "The job has completed successfully.".to_string())
        } else if last.status_code != 200 {
            (
                JobStatus::Failed,
                format!("The job has failed with status code {}.", last.status_code),
            )
        } else if is_stale(last.status_time, now, stale_after) {
            (
                JobStatus::Failed,
                "The job has internally timed out.".to_string(),
            )
        } else {
            (JobStatus::Running, "The job is running.".to_string())
        };

        Self {
            status,
            description,
            logs,
        }
    }
}

fn is_stale(at: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    (now - at)
        .to_std()
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

pub struct SqliteJobLog {
    pool: SqlitePool,
}

impl SqliteJobLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(path: &Path) -> Result<Self> {
        let log = Self::new(open_pool(path).await?);
        log.init().await?;
        Ok(log)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_JOB_STATUS_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        sqlx::query(CREATE_JOB_STATUS_INDEX_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        info!("Job status table initialized");
        Ok(())
    }
}

#[async_trait]
impl JobLog for SqliteJobLog {
    async fn append(&self, job_id: &str, entry: JobEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_status (job_id, status_time, status_msg, status_code) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(entry.status_time.to_rfc3339())
        .bind(&entry.status_msg)
        .bind(entry.status_code as i64)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        debug!(job_id = %job_id, status = entry.status_code, msg = %entry.status_msg, "Job log entry");
        Ok(())
    }

    async fn entries(&self, job_id: &str) -> Result<Vec<JobEntry>> {
        let rows = sqlx::query(
            "SELECT status_time, status_msg, status_code FROM job_status WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| {
                let time: String = row.get("status_time");
                let status_time = DateTime::parse_from_rfc3339(&time)
                    .map_err(|e| Error::Other(format!("Bad status_time '{}': {}", time, e)))?
                    .with_timezone(&Utc);
                let code: i64 = row.get("status_code");
                Ok(JobEntry {
                    status_time,
                    status_msg: row.get("status_msg"),
                    status_code: u16::try_from(code).unwrap_or(500),
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobLog {
    jobs: RwLock<HashMap<String, Vec<JobEntry>>>,
}

impl MemoryJobLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLog for MemoryJobLog {
    async fn append(&self, job_id: &str, entry: JobEntry) -> Result<()> {
        self.jobs
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn entries(&self, job_id: &str) -> Result<Vec<JobEntry>> {
        Ok(self.jobs.read().await.get(job_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_no_record_is_failed() {
        let report = JobReport::from_entries(&[], HOUR, Utc::now());
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(
            report.description,
            "No record of this job id is found, possibly due to a server restart."
        );
        assert!(report.logs.is_empty());
    }

    #[test]
    fn test_complete_is_completed() {
        let entries = vec![JobEntry::new("Starting job", 200), JobEntry::new(COMPLETE, 200)];
        let report = JobReport::from_entries(&entries, HOUR, Utc::now());
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.description, "The job has completed successfully.");
        assert_eq!(report.logs.len(), 2);
        assert_eq!(report.logs[0].message, "Starting job");
        assert_eq!(report.logs[0].level.as_deref(), Some("INFO"));
    }

    #[test]
    fn test_running_and_failed() {
        let running = vec![
            JobEntry::new("Starting job", 200),
            JobEntry::new("hey doing stuff", 200),
        ];
        assert_eq!(
            JobReport::from_entries(&running, HOUR, Utc::now()).status,
            JobStatus::Running
        );

        let failed = vec![JobEntry::new("Starting job", 200), JobEntry::new("o no", 512)];
        let report = JobReport::from_entries(&failed, HOUR, Utc::now());
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.logs[1].level.as_deref(), Some("ERROR"));
    }

    #[test]
    fn test_stale_job_times_out() {
        let mut entry = JobEntry::new("Starting operation lookup", 200);
        entry.status_time = Utc::now() - chrono::Duration::hours(2);
        let report = JobReport::from_entries(&[entry], HOUR, Utc::now());
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.description.contains("timed out"));
    }

    #[tokio::test]
    async fn test_sqlite_log_keeps_order_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteJobLog::connect(&dir.path().join("jobs.db")).await.unwrap();

        log.append("a", JobEntry::new("first", 200)).await.unwrap();
        log.append("b", JobEntry::new("other", 200)).await.unwrap();
        log.append("a", JobEntry::new("second", 500)).await.unwrap();

        let entries = log.entries("a").await.unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.status_msg.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(entries[1].status_code, 500);
        assert!(log.entries("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryJobLog::new();
        log.append("a", JobEntry::new(COMPLETE, 200)).await.unwrap();
        assert_eq!(log.entries("a").await.unwrap().len(), 1);
        assert!(log.entries("b").await.unwrap().is_empty());
    }
}
