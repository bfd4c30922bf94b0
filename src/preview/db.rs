use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, params, params_from_iter};

use super::models::*;

/// Error text recorded on runs and environments cut short by a restart.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

/// Async-safe handle to the preview database.
///
/// Wraps `PreviewDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PreviewDb>>,
}

impl DbHandle {
    pub fn new(db: PreviewDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PreviewDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PreviewDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PreviewDb {
    conn: Connection,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {}", raw))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

const ENVIRONMENT_COLUMNS: &str = "e.id, e.project, e.name, e.branch, e.commit_sha, e.status, e.url, e.path, e.mr_iid,
     e.created_at, e.last_deployed_at, e.last_deployment_status, e.last_deployment_error,
     e.last_deployment_duration, e.last_accessed_at, e.auto_update, e.pinned, e.env_vars";

const SUMMARY_COLUMNS: &str =
    "id, environment_id, status, error, triggered_by, started_at, completed_at, duration";

impl PreviewDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS environments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project TEXT NOT NULL,
                    name TEXT NOT NULL,
                    branch TEXT,
                    commit_sha TEXT,
                    status TEXT NOT NULL DEFAULT 'creating',
                    url TEXT,
                    path TEXT,
                    mr_iid INTEGER,
                    created_at TEXT NOT NULL,
                    last_deployed_at TEXT,
                    last_deployment_status TEXT,
                    last_deployment_error TEXT,
                    last_deployment_duration REAL,
                    last_accessed_at TEXT,
                    auto_update INTEGER NOT NULL DEFAULT 1,
                    pinned INTEGER NOT NULL DEFAULT 0,
                    env_vars TEXT NOT NULL DEFAULT '{}',
                    UNIQUE(project, name)
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    environment_id INTEGER NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'running',
                    log_output TEXT,
                    error TEXT,
                    triggered_by TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    duration REAL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_deployments_environment
                    ON deployments(environment_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_running
                    ON deployments(environment_id) WHERE status = 'running';
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Environments ──────────────────────────────────────────────────

    /// Insert the environment if missing, then write only the fields set in
    /// `update`. Applying the same update twice leaves one identical row.
    pub fn upsert_environment(
        &self,
        project: &str,
        name: &str,
        update: &EnvironmentUpdate,
    ) -> Result<Environment> {
        self.conn
            .execute(
                "INSERT INTO environments (project, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project, name) DO NOTHING",
                params![project, name, ts(&Utc::now())],
            )
            .context("Failed to insert environment")?;

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut push = |column: &'static str, value: Value| {
            sets.push(column);
            values.push(value);
        };

        if let Some(v) = &update.branch {
            push("branch", Value::Text(v.clone()));
        }
        if let Some(v) = &update.commit_sha {
            push("commit_sha", Value::Text(v.clone()));
        }
        if let Some(v) = &update.status {
            push("status", Value::Text(v.as_str().to_string()));
        }
        if let Some(v) = &update.url {
            push("url", Value::Text(v.clone()));
        }
        if let Some(v) = &update.path {
            push("path", Value::Text(v.clone()));
        }
        if let Some(v) = update.mr_iid {
            push("mr_iid", Value::Integer(v));
        }
        if let Some(v) = &update.last_deployed_at {
            push("last_deployed_at", Value::Text(ts(v)));
        }
        if let Some(v) = &update.last_deployment_status {
            push("last_deployment_status", Value::Text(v.as_str().to_string()));
        }
        if let Some(v) = &update.last_deployment_error {
            push(
                "last_deployment_error",
                v.clone().map(Value::Text).unwrap_or(Value::Null),
            );
        }
        if let Some(v) = update.last_deployment_duration {
            push("last_deployment_duration", Value::Real(v));
        }
        if let Some(v) = &update.last_accessed_at {
            push("last_accessed_at", Value::Text(ts(v)));
        }
        if let Some(v) = update.auto_update {
            push("auto_update", Value::Integer(v as i64));
        }
        if let Some(v) = update.pinned {
            push("pinned", Value::Integer(v as i64));
        }
        if let Some(v) = &update.env_vars {
            let json = serde_json::to_string(v).context("Failed to serialize env_vars")?;
            push("env_vars", Value::Text(json));
        }

        if !sets.is_empty() {
            let assignments = sets
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", c, i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE environments SET {} WHERE project = ?{} AND name = ?{}",
                assignments,
                sets.len() + 1,
                sets.len() + 2
            );
            values.push(Value::Text(project.to_string()));
            values.push(Value::Text(name.to_string()));
            self.conn
                .execute(&sql, params_from_iter(values))
                .context("Failed to update environment")?;
        }

        self.get_environment(project, name)?
            .context("Environment not found after upsert")
    }

    pub fn get_environment(&self, project: &str, name: &str) -> Result<Option<Environment>> {
        let sql = format!(
            "SELECT {} FROM environments e WHERE e.project = ?1 AND e.name = ?2",
            ENVIRONMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_environment")?;
        let mut rows = stmt
            .query_map(params![project, name], EnvironmentRow::read)
            .context("Failed to query environment")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read environment row")?
                    .into_environment()?,
            )),
            None => Ok(None),
        }
    }

    /// Find the environment whose URL host is `domain`.
    pub fn find_environment_by_domain(&self, domain: &str) -> Result<Option<Environment>> {
        let sql = format!(
            "SELECT {} FROM environments e WHERE e.url = ?1 OR e.url = ?2",
            ENVIRONMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare find_environment_by_domain")?;
        let mut rows = stmt
            .query_map(
                params![format!("https://{}", domain), format!("http://{}", domain)],
                EnvironmentRow::read,
            )
            .context("Failed to query environment by domain")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read environment row")?
                    .into_environment()?,
            )),
            None => Ok(None),
        }
    }

    /// All environments with their most recent deployment, ordered by
    /// `(project, name)`.
    pub fn list_environments(&self) -> Result<Vec<EnvironmentListing>> {
        let sql = format!(
            "SELECT {},
                    d.id, d.environment_id, d.status, d.error, d.triggered_by,
                    d.started_at, d.completed_at, d.duration
             FROM environments e
             LEFT JOIN deployments d ON d.id = (
                 SELECT MAX(id) FROM deployments WHERE environment_id = e.id
             )
             ORDER BY e.project, e.name",
            ENVIRONMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_environments")?;
        let rows = stmt
            .query_map([], |row| {
                let env = EnvironmentRow::read(row)?;
                let latest = match row.get::<_, Option<i64>>(18)? {
                    Some(_) => Some(SummaryRow::read_at(row, 18)?),
                    None => None,
                };
                Ok((env, latest))
            })
            .context("Failed to query environments")?;
        let mut listings = Vec::new();
        for row in rows {
            let (env, latest) = row.context("Failed to read environment row")?;
            listings.push(EnvironmentListing {
                environment: env.into_environment()?,
                latest_deployment: latest.map(SummaryRow::into_summary).transpose()?,
            });
        }
        Ok(listings)
    }

    /// Environments in one of `statuses`, optionally limited to a project.
    pub fn list_environments_with_status(
        &self,
        project: Option<&str>,
        statuses: &[EnvironmentStatus],
    ) -> Result<Vec<Environment>> {
        Ok(self
            .list_environments()?
            .into_iter()
            .map(|l| l.environment)
            .filter(|e| project.is_none_or(|p| e.project == p))
            .filter(|e| statuses.contains(&e.status))
            .collect())
    }

    /// Delete an environment and (by cascade) its deployment history.
    pub fn delete_environment(&self, project: &str, name: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM environments WHERE project = ?1 AND name = ?2",
                params![project, name],
            )
            .context("Failed to delete environment")?;
        Ok(affected > 0)
    }

    pub fn touch_last_accessed(&self, project: &str, name: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE environments SET last_accessed_at = ?1 WHERE project = ?2 AND name = ?3",
                params![ts(&Utc::now()), project, name],
            )
            .context("Failed to update last_accessed_at")?;
        Ok(())
    }

    // ── Deployments ───────────────────────────────────────────────────

    /// Start a `running` deployment record. Returns `None` when the
    /// environment already has one in flight.
    pub fn try_create_deployment(
        &self,
        environment_id: i64,
        triggered_by: &str,
    ) -> Result<Option<DeploymentRecord>> {
        let inserted = self.conn.execute(
            "INSERT INTO deployments (environment_id, status, triggered_by, started_at)
             VALUES (?1, 'running', ?2, ?3)",
            params![environment_id, triggered_by, ts(&Utc::now())],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                return Ok(None);
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert deployment")),
        }
        let id = self.conn.last_insert_rowid();
        self.get_deployment(id)?
            .context("Deployment not found after insert")
            .map(Some)
    }

    /// Write the terminal outcome and log of a deployment, once.
    pub fn finish_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        log_output: &str,
        error: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let current = self
            .get_deployment(id)?
            .with_context(|| format!("Deployment {} not found", id))?;
        let now = Utc::now();
        let duration = (now - current.started_at).num_milliseconds() as f64 / 1000.0;
        self.conn
            .execute(
                "UPDATE deployments
                 SET status = ?1, log_output = ?2, error = ?3, completed_at = ?4, duration = ?5
                 WHERE id = ?6",
                params![status.as_str(), log_output, error, ts(&now), duration, id],
            )
            .context("Failed to finish deployment")?;
        self.get_deployment(id)?
            .context("Deployment not found after update")
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<DeploymentRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, environment_id, status, log_output, error, triggered_by,
                        started_at, completed_at, duration
                 FROM deployments WHERE id = ?1",
            )
            .context("Failed to prepare get_deployment")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(DeploymentRow {
                    log_output: row.get(3)?,
                    summary: SummaryRow {
                        id: row.get(0)?,
                        environment_id: row.get(1)?,
                        status: row.get(2)?,
                        error: row.get(4)?,
                        triggered_by: row.get(5)?,
                        started_at: row.get(6)?,
                        completed_at: row.get(7)?,
                        duration: row.get(8)?,
                    },
                })
            })
            .context("Failed to query deployment")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read deployment row")?
                    .into_record()?,
            )),
            None => Ok(None),
        }
    }

    /// Newest first, without log text.
    pub fn list_deployments(&self, environment_id: i64, limit: i64) -> Result<Vec<DeploymentSummary>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE environment_id = ?1 ORDER BY id DESC LIMIT ?2",
            SUMMARY_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_deployments")?;
        let rows = stmt
            .query_map(params![environment_id, limit], |row| SummaryRow::read_at(row, 0))
            .context("Failed to query deployments")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read deployment row")?.into_summary()?);
        }
        Ok(out)
    }

    pub fn has_running_deployment(&self, environment_id: i64) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM deployments WHERE environment_id = ?1 AND status = 'running'",
                params![environment_id],
                |row| row.get(0),
            )
            .context("Failed to count running deployments")?;
        Ok(count > 0)
    }

    /// Fail everything a previous process left mid-flight. Returns the number
    /// of deployments and environments touched.
    pub fn recover_interrupted(&self) -> Result<(usize, usize)> {
        let now = ts(&Utc::now());
        let deployments = self
            .conn
            .execute(
                "UPDATE deployments SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE status = 'running'",
                params![INTERRUPTED_ERROR, now],
            )
            .context("Failed to recover deployments")?;
        let environments = self
            .conn
            .execute(
                "UPDATE environments
                 SET status = 'failed', last_deployment_status = 'failed', last_deployment_error = ?1
                 WHERE status = 'creating'",
                params![INTERRUPTED_ERROR],
            )
            .context("Failed to recover environments")?;
        Ok((deployments, environments))
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = ?1")
            .context("Failed to prepare get_setting")?;
        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .context("Failed to query setting")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read setting")?)),
            None => Ok(None),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    pub fn all_settings(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings ORDER BY key")
            .context("Failed to prepare all_settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query settings")?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (k, v) = row.context("Failed to read setting")?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Raw environment row before status strings, flags and JSON are typed.
struct EnvironmentRow {
    id: i64,
    project: String,
    name: String,
    branch: Option<String>,
    commit_sha: Option<String>,
    status: String,
    url: Option<String>,
    path: Option<String>,
    mr_iid: Option<i64>,
    created_at: String,
    last_deployed_at: Option<String>,
    last_deployment_status: Option<String>,
    last_deployment_error: Option<String>,
    last_deployment_duration: Option<f64>,
    last_accessed_at: Option<String>,
    auto_update: i64,
    pinned: i64,
    env_vars: String,
}

impl EnvironmentRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project: row.get(1)?,
            name: row.get(2)?,
            branch: row.get(3)?,
            commit_sha: row.get(4)?,
            status: row.get(5)?,
            url: row.get(6)?,
            path: row.get(7)?,
            mr_iid: row.get(8)?,
            created_at: row.get(9)?,
            last_deployed_at: row.get(10)?,
            last_deployment_status: row.get(11)?,
            last_deployment_error: row.get(12)?,
            last_deployment_duration: row.get(13)?,
            last_accessed_at: row.get(14)?,
            auto_update: row.get(15)?,
            pinned: row.get(16)?,
            env_vars: row.get(17)?,
        })
    }

    fn into_environment(self) -> Result<Environment> {
        let status = EnvironmentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse environment status")?;
        let last_deployment_status = self
            .last_deployment_status
            .as_deref()
            .map(DeploymentStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse last deployment status")?;
        let env_vars: BTreeMap<String, String> =
            serde_json::from_str(&self.env_vars).context("Failed to parse env_vars JSON")?;

        Ok(Environment {
            id: self.id,
            project: self.project,
            name: self.name,
            branch: self.branch,
            commit_sha: self.commit_sha,
            status,
            url: self.url,
            path: self.path,
            mr_iid: self.mr_iid,
            created_at: parse_ts(&self.created_at)?,
            last_deployed_at: parse_opt_ts(self.last_deployed_at)?,
            last_deployment_status,
            last_deployment_error: self.last_deployment_error,
            last_deployment_duration: self.last_deployment_duration,
            last_accessed_at: parse_opt_ts(self.last_accessed_at)?,
            auto_update: self.auto_update != 0,
            pinned: self.pinned != 0,
            env_vars,
        })
    }
}

struct SummaryRow {
    id: i64,
    environment_id: i64,
    status: String,
    error: Option<String>,
    triggered_by: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    duration: Option<f64>,
}

impl SummaryRow {
    /// Read the eight summary columns starting at `offset`.
    fn read_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            environment_id: row.get(offset + 1)?,
            status: row.get(offset + 2)?,
            error: row.get(offset + 3)?,
            triggered_by: row.get(offset + 4)?,
            started_at: row.get(offset + 5)?,
            completed_at: row.get(offset + 6)?,
            duration: row.get(offset + 7)?,
        })
    }

    fn into_summary(self) -> Result<DeploymentSummary> {
        let status = DeploymentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deployment status")?;
        Ok(DeploymentSummary {
            id: self.id,
            environment_id: self.environment_id,
            status,
            error: self.error,
            triggered_by: self.triggered_by,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            duration: self.duration,
        })
    }
}

struct DeploymentRow {
    summary: SummaryRow,
    log_output: Option<String>,
}

impl DeploymentRow {
    fn into_record(self) -> Result<DeploymentRecord> {
        let s = self.summary.into_summary()?;
        Ok(DeploymentRecord {
            id: s.id,
            environment_id: s.environment_id,
            status: s.status,
            log_output: self.log_output,
            error: s.error,
            triggered_by: s.triggered_by,
            started_at: s.started_at,
            completed_at: s.completed_at,
            duration: s.duration,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
