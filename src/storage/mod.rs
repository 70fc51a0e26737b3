//! SQLite persistence.
//!
//! One [`Store`] owns the connection pool. Schema migrations are additive,
//! embedded at compile time, applied in strict order, and each recorded by
//! version number in `schema_version`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::Error;

/// Ordered, additive schema migrations. Never reorder or edit a shipped
/// entry; append a new version instead.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("migrations/001_init.sql")),
    (2, include_str!("migrations/002_linked_tasks.sql")),
    (3, include_str!("migrations/003_context.sql")),
    (4, include_str!("migrations/004_linked_details.sql")),
];

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub project: String,
    pub prompt: String,
    pub status: String,
    pub priority: String,
    pub session_id: String,
    pub pid: i64,
    pub git_branch: String,
    pub output: String,
    pub progress: String,
    pub error: String,
    pub cost_usd: f64,
    pub turns: i64,
    pub timeout_minutes: i64,
    pub dry_run: bool,
    pub created_at: String,
    pub started_at: String,
    pub completed_at: String,
    pub kind: String,
    pub context: String,
    pub current_task: String,
    /// JSON array of paths.
    pub files_modified: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskEventRow {
    pub task_id: String,
    pub event_type: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthCodeRow {
    pub code_hash: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: String,
    pub expires_at: String,
    pub used: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub token_hash: String,
    pub token_type: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: String,
    pub revoked: bool,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("herald.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database, used by tests. Pinned to one connection that
    /// never retires: every pooled connection would otherwise see its own
    /// empty `:memory:` database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(pool)
        .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(pool)
            .await?;
        let current = current.unwrap_or(0);

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(pool)
                .await?;
            debug!(version, "applied schema migration");
        }

        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub async fn save_task(&self, row: &TaskRow) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tasks
             (id, project, prompt, status, priority, session_id, pid, git_branch,
              output, progress, error, cost_usd, turns, timeout_minutes, dry_run,
              created_at, started_at, completed_at, kind, context, current_task,
              files_modified)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.project)
        .bind(&row.prompt)
        .bind(&row.status)
        .bind(&row.priority)
        .bind(&row.session_id)
        .bind(row.pid)
        .bind(&row.git_branch)
        .bind(&row.output)
        .bind(&row.progress)
        .bind(&row.error)
        .bind(row.cost_usd)
        .bind(row.turns)
        .bind(row.timeout_minutes)
        .bind(row.dry_run)
        .bind(&row.created_at)
        .bind(&row.started_at)
        .bind(&row.completed_at)
        .bind(&row.kind)
        .bind(&row.context)
        .bind(&row.current_task)
        .bind(&row.files_modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_tasks(&self) -> Result<Vec<TaskRow>> {
        Ok(sqlx::query_as("SELECT * FROM tasks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn append_task_event(
        &self,
        task_id: &str,
        event_type: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_events (task_id, event_type, message, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(event_type)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_task_events(&self, task_id: &str, limit: i64) -> Result<Vec<TaskEventRow>> {
        Ok(sqlx::query_as(
            "SELECT task_id, event_type, message, created_at FROM task_events
             WHERE task_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    // ─── OAuth codes and tokens ─────────────────────────────────────────────

    pub async fn store_auth_code(&self, row: &AuthCodeRow) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO oauth_codes
             (code_hash, client_id, redirect_uri, code_challenge, scope, expires_at, used)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.code_hash)
        .bind(&row.client_id)
        .bind(&row.redirect_uri)
        .bind(&row.code_challenge)
        .bind(&row.scope)
        .bind(&row.expires_at)
        .bind(row.used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically mark a code used and return it. The conditional UPDATE is
    /// the single point that flips `used`, so two racing consumers cannot
    /// both succeed.
    pub async fn consume_auth_code(&self, code_hash: &str) -> Result<AuthCodeRow, Error> {
        let row: Option<AuthCodeRow> = sqlx::query_as(
            "SELECT code_hash, client_id, redirect_uri, code_challenge, scope,
                    expires_at, used
             FROM oauth_codes WHERE code_hash = ?",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.into()))?;

        let row = row.ok_or_else(|| Error::Unauthorized("authorization code not found".into()))?;
        if row.used {
            return Err(Error::Unauthorized("authorization code already used".into()));
        }
        if is_past(&row.expires_at) {
            return Err(Error::Unauthorized("authorization code expired".into()));
        }

        let updated =
            sqlx::query("UPDATE oauth_codes SET used = 1 WHERE code_hash = ? AND used = 0")
                .bind(code_hash)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Internal(e.into()))?;
        if updated.rows_affected() == 0 {
            return Err(Error::Unauthorized("authorization code already used".into()));
        }

        Ok(AuthCodeRow { used: true, ..row })
    }

    pub async fn store_token(&self, row: &TokenRow) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO oauth_tokens
             (token_hash, token_type, client_id, scope, expires_at, revoked)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.token_hash)
        .bind(&row.token_type)
        .bind(&row.client_id)
        .bind(&row.scope)
        .bind(&row.expires_at)
        .bind(row.revoked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_token(&self, token_hash: &str) -> Result<TokenRow, Error> {
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT token_hash, token_type, client_id, scope, expires_at, revoked
             FROM oauth_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.into()))?;

        let row = row.ok_or_else(|| Error::Unauthorized("token not found".into()))?;
        if row.revoked {
            return Err(Error::Unauthorized("token revoked".into()));
        }
        if is_past(&row.expires_at) {
            return Err(Error::Unauthorized("token expired".into()));
        }
        Ok(row)
    }

    pub async fn revoke_token(&self, token_hash: &str) -> Result<()> {
        sqlx::query("UPDATE oauth_tokens SET revoked = 1 WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cleanup_auth(&self) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("DELETE FROM oauth_codes WHERE expires_at < ?")
            .bind(&now)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM oauth_tokens WHERE expires_at < ? OR revoked = 1")
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_past(rfc3339: &str) -> bool {
    match chrono::DateTime::parse_from_rfc3339(rfc3339) {
        Ok(t) => Utc::now() > t,
        // Unparseable expiry is treated as expired rather than eternal.
        Err(_) => true,
    }
}

// ─── Write-behind task persistence ───────────────────────────────────────────

/// A unit of task persistence emitted by the task manager.
#[derive(Debug)]
pub enum PersistMsg {
    Task(Box<TaskRow>),
    Event {
        task_id: String,
        event_type: String,
        message: String,
    },
}

/// Spawn the single writer job that drains task persistence messages in
/// order. With no store configured the channel still exists and messages
/// are discarded, which keeps the manager free of persistence branches.
pub fn spawn_task_writer(store: Option<Arc<Store>>) -> mpsc::UnboundedSender<PersistMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistMsg>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(store) = store.as_ref() else {
                continue;
            };
            let result = match &msg {
                PersistMsg::Task(row) => store.save_task(row).await,
                PersistMsg::Event {
                    task_id,
                    event_type,
                    message,
                } => store.append_task_event(task_id, event_type, message).await,
            };
            if let Err(e) = result {
                error!(err = %e, "task persistence write failed");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_row(id: &str) -> TaskRow {
        TaskRow {
            id: id.into(),
            project: "demo".into(),
            prompt: "do things".into(),
            status: "pending".into(),
            priority: "normal".into(),
            session_id: String::new(),
            pid: 0,
            git_branch: String::new(),
            output: String::new(),
            progress: String::new(),
            error: String::new(),
            cost_usd: 0.0,
            turns: 0,
            timeout_minutes: 30,
            dry_run: false,
            created_at: Utc::now().to_rfc3339(),
            started_at: String::new(),
            completed_at: String::new(),
            kind: "dispatched".into(),
            context: String::new(),
            current_task: String::new(),
            files_modified: "[]".into(),
        }
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let store = Store::open_in_memory().await.unwrap();
        // Re-running against the same pool is a no-op.
        Store::migrate(&store.pool).await.unwrap();
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(max, Some(MIGRATIONS.last().unwrap().0));
    }

    #[tokio::test]
    async fn task_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let mut row = task_row("t-1");
        store.save_task(&row).await.unwrap();

        row.status = "queued".into();
        store.save_task(&row).await.unwrap();

        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "t-1");
        assert_eq!(loaded[0].status, "queued");
    }

    #[tokio::test]
    async fn task_events_append_and_list() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_task(&task_row("t-1")).await.unwrap();
        store
            .append_task_event("t-1", "task.started", "PID 42")
            .await
            .unwrap();
        store
            .append_task_event("t-1", "task.completed", "")
            .await
            .unwrap();

        let events = store.list_task_events("t-1", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].event_type, "task.completed");
    }

    #[tokio::test]
    async fn consume_auth_code_is_single_use() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .store_auth_code(&AuthCodeRow {
                code_hash: "h".into(),
                client_id: "c".into(),
                redirect_uri: "http://localhost/cb".into(),
                code_challenge: "ch".into(),
                scope: "mcp".into(),
                expires_at: (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339(),
                used: false,
            })
            .await
            .unwrap();

        let code = store.consume_auth_code("h").await.unwrap();
        assert!(code.used);
        let err = store.consume_auth_code("h").await.unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[tokio::test]
    async fn token_revocation_and_cleanup() {
        let store = Store::open_in_memory().await.unwrap();
        let live = TokenRow {
            token_hash: "live".into(),
            token_type: "access".into(),
            client_id: "c".into(),
            scope: String::new(),
            expires_at: (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            revoked: false,
        };
        let dead = TokenRow {
            token_hash: "dead".into(),
            expires_at: (Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
            ..live.clone()
        };
        store.store_token(&live).await.unwrap();
        store.store_token(&dead).await.unwrap();

        assert!(store.get_token("live").await.is_ok());
        assert!(store.get_token("dead").await.is_err());

        store.revoke_token("live").await.unwrap();
        assert!(store.get_token("live").await.is_err());

        store.cleanup_auth().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oauth_tokens")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
