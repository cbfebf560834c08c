use super::models::{Job, JobState, JobStatus, NewJob, PriorityGroup, QueuedContinuation};
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use super::{ContinuationInbox, EntityIndex, JobStore};
use crate::batch::{Continuation, ContinuationQueue};
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const JOB_COLUMNS: &str = "id, priority_group, task_name, status, errors, key_data, text_data, \
                           retry_after, version, created_at, last_modified";

/// How long a writer waits on a lock held by another connection before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open job database")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        if is_new_db {
            info!("Creating new job database at {:?}", path);
        }
        open_versioned(&mut conn, JOB_STORE_VERSIONED_SCHEMAS, is_new_db, "job")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Adds keys to the entity index. The application owns this table; this is
    /// mainly a convenience for seeding.
    pub fn insert_entity_keys(&self, kind: &str, keys: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO entity_keys (kind, key) VALUES (?1, ?2)")?;
            for key in keys {
                inserted += stmt.execute(params![kind, key])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        // Fixed precision keeps lexicographic order equal to time order.
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// `column` is the index reported if `s` is not a timestamp.
    fn parse_datetime(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    column,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    }

    fn parse_json<T: serde::de::DeserializeOwned>(column: usize, s: &str) -> rusqlite::Result<T> {
        serde_json::from_str(s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    fn encode_key_data(key_data: &[String]) -> Result<String> {
        serde_json::to_string(key_data).context("Failed to encode key data")
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get("status")?;
        let status = JobStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown job status '{}'", status_str).into(),
            )
        })?;

        let key_data_str: String = row.get("key_data")?;
        let key_data: Vec<String> = Self::parse_json(5, &key_data_str)?;

        let errors: i64 = row.get("errors")?;
        let retry_after: Option<String> = row.get("retry_after")?;
        let created_at: String = row.get("created_at")?;
        let last_modified: String = row.get("last_modified")?;

        Ok(Job {
            id: row.get("id")?,
            priority_group: row.get("priority_group")?,
            task_name: row.get("task_name")?,
            status,
            errors: errors.max(0) as u32,
            key_data,
            text_data: row.get("text_data")?,
            retry_after: retry_after
                .as_deref()
                .map(|s| Self::parse_datetime(7, s))
                .transpose()?,
            version: row.get("version")?,
            created_at: Self::parse_datetime(9, &created_at)?,
            last_modified: Self::parse_datetime(10, &last_modified)?,
        })
    }

    fn row_to_group(row: &rusqlite::Row) -> rusqlite::Result<PriorityGroup> {
        Ok(PriorityGroup {
            id: row.get("id")?,
            name: row.get("name")?,
            priority: row.get("priority")?,
            label: row.get("label")?,
        })
    }

    fn row_to_continuation(row: &rusqlite::Row) -> rusqlite::Result<QueuedContinuation> {
        let checkpoint: Option<String> = row.get("checkpoint")?;
        let params: String = row.get("params")?;
        let attempts: i64 = row.get("attempts")?;
        let not_before: String = row.get("not_before")?;

        Ok(QueuedContinuation {
            id: row.get("id")?,
            runner: row.get("runner")?,
            checkpoint: checkpoint
                .as_deref()
                .map(|s| Self::parse_json(2, s))
                .transpose()?,
            params: Self::parse_json(3, &params)?,
            attempts: attempts.max(0) as u32,
            not_before: Self::parse_datetime(5, &not_before)?,
        })
    }

    fn query_job(conn: &Connection, id: i64) -> Result<Option<Job>> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn query_job_by_task_and_keys(
        conn: &Connection,
        task_name: &str,
        encoded_key_data: &str,
    ) -> Result<Option<Job>> {
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE task_name = ?1 AND key_data = ?2 ORDER BY id LIMIT 1",
                    JOB_COLUMNS
                ),
                params![task_name, encoded_key_data],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn insert_job(conn: &Connection, job: &NewJob, encoded_key_data: &str) -> Result<i64> {
        let now = Self::format_datetime(&Utc::now());
        conn.execute(
            "INSERT INTO jobs (priority_group, task_name, status, errors, key_data, text_data,
                               retry_after, version, created_at, last_modified)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, NULL, 0, ?6, ?6)",
            params![
                job.priority_group,
                job.task_name,
                JobStatus::Waiting.as_str(),
                encoded_key_data,
                job.text_data,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl JobStore for SqliteJobStore {
    fn get_or_create_group(
        &self,
        name: &str,
        priority: i64,
        label: &str,
    ) -> Result<PriorityGroup> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO priority_groups (name, priority, label) VALUES (?1, ?2, ?3)",
            params![name, priority, label],
        )?;
        if inserted > 0 {
            info!("Created priority group '{}' (priority {})", name, priority);
        }

        let group = conn.query_row(
            "SELECT id, name, priority, label FROM priority_groups WHERE name = ?1",
            params![name],
            Self::row_to_group,
        )?;
        Ok(group)
    }

    fn get_group(&self, name: &str) -> Result<Option<PriorityGroup>> {
        let conn = self.conn.lock().unwrap();
        let group = conn
            .query_row(
                "SELECT id, name, priority, label FROM priority_groups WHERE name = ?1",
                params![name],
                Self::row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    fn list_groups_by_priority(&self) -> Result<Vec<PriorityGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, priority, label FROM priority_groups ORDER BY priority DESC, id",
        )?;
        let groups = stmt
            .query_map([], Self::row_to_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    fn create_job(&self, job: &NewJob) -> Result<Job> {
        let encoded = Self::encode_key_data(&job.key_data)?;
        let conn = self.conn.lock().unwrap();
        let id = Self::insert_job(&conn, job, &encoded)?;
        Self::query_job(&conn, id)?.context("Inserted job disappeared")
    }

    fn create_job_unique(&self, job: &NewJob) -> Result<(Job, bool)> {
        let encoded = Self::encode_key_data(&job.key_data)?;
        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<(Job, bool)> {
            if let Some(existing) =
                Self::query_job_by_task_and_keys(&conn, &job.task_name, &encoded)?
            {
                return Ok((existing, false));
            }
            let id = Self::insert_job(&conn, job, &encoded)?;
            let created = Self::query_job(&conn, id)?.context("Inserted job disappeared")?;
            Ok((created, true))
        })();

        match result {
            Ok(value) => {
                conn.execute("COMMIT", [])?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK", []) {
                    warn!("Failed to rollback transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn find_job(&self, task_name: &str, key_data: &[String]) -> Result<Option<Job>> {
        let encoded = Self::encode_key_data(key_data)?;
        let conn = self.conn.lock().unwrap();
        Self::query_job_by_task_and_keys(&conn, task_name, &encoded)
    }

    fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        Self::query_job(&conn, id)
    }

    fn list_waiting_jobs(&self, group: &str, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE priority_group = ?1 AND status = ?2
               AND (retry_after IS NULL OR retry_after <= ?3)
             ORDER BY id",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    group,
                    JobStatus::Waiting.as_str(),
                    Self::format_datetime(&now)
                ],
                Self::row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, usize)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(JobStatus::ALL
            .iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|(s, _)| s == status.as_str())
                    .map(|(_, c)| *c as usize)
                    .unwrap_or(0);
                (*status, count)
            })
            .collect())
    }

    fn write_job_state(&self, expected: &Job, next: &JobState) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Self::format_datetime(&Utc::now());
        let changed = conn.execute(
            "UPDATE jobs
             SET status = ?1, errors = ?2, retry_after = ?3, version = version + 1,
                 last_modified = ?4
             WHERE id = ?5 AND version = ?6",
            params![
                next.status.as_str(),
                next.errors as i64,
                next.retry_after.as_ref().map(Self::format_datetime),
                now,
                expected.id,
                expected.version
            ],
        )?;
        Ok(changed == 1)
    }

    fn update_key_data(&self, id: i64, key_data: &[String]) -> Result<bool> {
        let encoded = Self::encode_key_data(key_data)?;
        let conn = self.conn.lock().unwrap();
        let now = Self::format_datetime(&Utc::now());
        let changed = conn.execute(
            "UPDATE jobs SET key_data = ?1, version = version + 1, last_modified = ?2
             WHERE id = ?3",
            params![encoded, now, id],
        )?;
        Ok(changed == 1)
    }
}

impl EntityIndex for SqliteJobStore {
    fn keys_after(&self, kind: &str, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key FROM entity_keys
             WHERE kind = ?1 AND (?2 IS NULL OR key > ?2)
             ORDER BY key LIMIT ?3",
        )?;
        let keys = stmt
            .query_map(params![kind, after, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}

impl ContinuationQueue for SqliteJobStore {
    fn enqueue(&self, continuation: &Continuation) -> Result<i64> {
        let checkpoint = continuation
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let params = serde_json::to_string(&continuation.params)?;
        let now = Utc::now();
        let not_before = now
            + chrono::Duration::from_std(continuation.delay).unwrap_or_else(|_| chrono::Duration::zero());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO continuations (runner, checkpoint, params, attempts, not_before, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                continuation.runner,
                checkpoint,
                params,
                Self::format_datetime(&not_before),
                Self::format_datetime(&now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl ContinuationInbox for SqliteJobStore {
    fn due_continuations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedContinuation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, runner, checkpoint, params, attempts, not_before FROM continuations
             WHERE not_before <= ?1 ORDER BY not_before, id LIMIT ?2",
        )?;
        let due = stmt
            .query_map(
                params![Self::format_datetime(&now), limit as i64],
                Self::row_to_continuation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(due)
    }

    fn complete_continuation(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM continuations WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn reschedule_continuation(&self, id: i64, not_before: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE continuations SET attempts = attempts + 1, not_before = ?1 WHERE id = ?2",
            params![Self::format_datetime(&not_before), id],
        )?;
        Ok(())
    }
}
