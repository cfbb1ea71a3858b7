use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::answer_cache;
use crate::models::{JobRecord, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, external_id, source, title, company, location, url, detail_text,
    compensation, work_mode, apply_type, status, fit_score, fit_reasoning, apply_attempts,
    last_apply_result, last_attempt_at, discovered_at, enriched_at, screened_at, applied_at,
    updated_at";

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn, path: PathBuf::from(":memory:") })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL DEFAULT 'manual',
                title TEXT NOT NULL,
                company TEXT,
                location TEXT,
                url TEXT,
                detail_text TEXT,
                compensation TEXT,
                work_mode TEXT,
                apply_type TEXT,
                status TEXT NOT NULL DEFAULT 'NEW',
                fit_score REAL CHECK (fit_score IS NULL OR (fit_score >= 0.0 AND fit_score <= 1.0)),
                fit_reasoning TEXT,
                apply_attempts INTEGER NOT NULL DEFAULT 0,
                last_apply_result TEXT,
                last_attempt_at TEXT,
                discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
                enriched_at TEXT,
                screened_at TEXT,
                applied_at TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )?;
        self.conn.execute_batch(answer_cache::SCHEMA)?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'autoapply init' first."
            ));
        }
        Ok(())
    }

    // --- Job operations ---

    /// Records a posting. Re-adding a known external id refreshes the listing
    /// fields but leaves its lifecycle state alone.
    pub fn add_job(&self, job: &NewJob) -> Result<i64> {
        if job.external_id.trim().is_empty() {
            bail!("Job external id must not be empty");
        }
        let source = if job.source.is_empty() { "manual" } else { job.source.as_str() };

        self.conn.execute(
            "INSERT INTO jobs (external_id, source, title, company, location, url, detail_text,
                               compensation, work_mode, apply_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (external_id) DO UPDATE SET
                title = excluded.title,
                company = COALESCE(excluded.company, company),
                location = COALESCE(excluded.location, location),
                url = COALESCE(excluded.url, url),
                detail_text = COALESCE(excluded.detail_text, detail_text),
                compensation = COALESCE(excluded.compensation, compensation),
                work_mode = COALESCE(excluded.work_mode, work_mode),
                apply_type = COALESCE(excluded.apply_type, apply_type),
                updated_at = datetime('now')",
            params![
                job.external_id.trim(),
                source,
                job.title,
                job.company,
                job.location,
                job.url,
                job.detail_text,
                job.compensation,
                job.work_mode,
                job.apply_type,
            ],
        )?;

        self.conn
            .query_row(
                "SELECT id FROM jobs WHERE external_id = ?1",
                [job.external_id.trim()],
                |row| row.get(0),
            )
            .context("Failed to read back job id")
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        let mut sql = format!("SELECT {} FROM jobs", JOB_COLUMNS);
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY discovered_at DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(s) = status {
            stmt.query_map([s.as_str()], Self::row_to_job)?
        } else {
            stmt.query_map([], Self::row_to_job)?
        };

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                [id],
                Self::row_to_job,
            )
            .optional()
            .context("Failed to load job")
    }

    pub fn get_job_by_external_id(&self, external_id: &str) -> Result<Option<JobRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE external_id = ?1", JOB_COLUMNS),
                [external_id],
                Self::row_to_job,
            )
            .optional()
            .context("Failed to load job")
    }

    /// Jobs queued for an Easy Apply attempt, best fit first.
    pub fn jobs_ready_to_apply(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE status = ?1 AND LOWER(apply_type) = 'easy apply'
             ORDER BY fit_score IS NULL, fit_score DESC, id
             LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![JobStatus::ReadyToApply.as_str(), limit as i64],
            Self::row_to_job,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs ready to apply")
    }

    /// Unscored jobs with a description, newest first.
    pub fn jobs_needing_screening(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE status IN (?1, ?2) AND fit_score IS NULL
               AND detail_text IS NOT NULL AND TRIM(detail_text) != ''
             ORDER BY discovered_at DESC, id DESC
             LIMIT ?3",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![JobStatus::New.as_str(), JobStatus::Enriched.as_str(), limit as i64],
            Self::row_to_job,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs needing screening")
    }

    fn require_job(&self, id: i64) -> Result<JobRecord> {
        self.get_job(id)?.ok_or_else(|| anyhow!("Job {} not found", id))
    }

    fn check_transition(job: &JobRecord, next: JobStatus) -> Result<()> {
        if !job.status.can_transition_to(next) {
            bail!(
                "Job {} cannot move from {} to {}",
                job.id,
                job.status,
                next
            );
        }
        Ok(())
    }

    /// Moves a job forward, stamping the matching lifecycle timestamp.
    pub fn set_status(&self, id: i64, status: JobStatus) -> Result<()> {
        let job = self.require_job(id)?;
        Self::check_transition(&job, status)?;
        if job.status == status {
            return Ok(());
        }

        let stamp = match status {
            JobStatus::Enriched => Some("enriched_at"),
            JobStatus::Screened => Some("screened_at"),
            JobStatus::Applied => Some("applied_at"),
            _ => None,
        };
        let sql = match stamp {
            Some(column) => format!(
                "UPDATE jobs SET status = ?1, {} = datetime('now'), updated_at = datetime('now') WHERE id = ?2",
                column
            ),
            None => "UPDATE jobs SET status = ?1, updated_at = datetime('now') WHERE id = ?2".to_string(),
        };
        self.conn.execute(&sql, params![status.as_str(), id])?;
        Ok(())
    }

    /// Stores a fit assessment and marks the job screened.
    pub fn record_screening(&self, id: i64, score: f64, reasoning: Option<&str>) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            bail!("Fit score must be between 0.0 and 1.0, got {}", score);
        }
        self.set_status(id, JobStatus::Screened)?;
        self.conn.execute(
            "UPDATE jobs SET fit_score = ?1, fit_reasoning = COALESCE(?2, fit_reasoning),
                             updated_at = datetime('now')
             WHERE id = ?3",
            params![score, reasoning, id],
        )?;
        Ok(())
    }

    pub fn mark_ready(&self, id: i64) -> Result<()> {
        self.set_status(id, JobStatus::ReadyToApply)
    }

    /// Writes the result of an application attempt. `count_attempt` is false
    /// for dry runs, which leave the counter and status untouched.
    pub fn record_attempt(
        &self,
        id: i64,
        status: JobStatus,
        result: &str,
        count_attempt: bool,
    ) -> Result<()> {
        let job = self.require_job(id)?;
        Self::check_transition(&job, status)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE jobs SET last_apply_result = ?1, last_attempt_at = datetime('now'),
                             apply_attempts = apply_attempts + ?2,
                             updated_at = datetime('now')
             WHERE id = ?3",
            params![result, if count_attempt { 1 } else { 0 }, id],
        )?;
        if status != job.status {
            tx.execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            if status == JobStatus::Applied {
                tx.execute(
                    "UPDATE jobs SET applied_at = datetime('now') WHERE id = ?1",
                    [id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Hard delete, allowed only for listings confirmed invalid.
    pub fn delete_invalid(&self, id: i64) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND status = ?2",
            params![id, JobStatus::Invalid.as_str()],
        )?;
        Ok(deleted > 0)
    }

    pub fn delete_all_invalid(&self) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM jobs WHERE status = ?1",
            [JobStatus::Invalid.as_str()],
        )?;
        Ok(deleted)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let status: String = row.get(11)?;
        let status = status
            .parse::<JobStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, e.into()))?;
        let attempts: i64 = row.get(14)?;

        Ok(JobRecord {
            id: row.get(0)?,
            external_id: row.get(1)?,
            source: row.get(2)?,
            title: row.get(3)?,
            company: row.get(4)?,
            location: row.get(5)?,
            url: row.get(6)?,
            detail_text: row.get(7)?,
            compensation: row.get(8)?,
            work_mode: row.get(9)?,
            apply_type: row.get(10)?,
            status,
            fit_score: row.get(12)?,
            fit_reasoning: row.get(13)?,
            apply_attempts: attempts.max(0) as u32,
            last_apply_result: row.get(15)?,
            last_attempt_at: row.get(16)?,
            discovered_at: row.get(17)?,
            enriched_at: row.get(18)?,
            screened_at: row.get(19)?,
            applied_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }
}
