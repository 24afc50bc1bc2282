//! SQLite database for persistent storage.
//!
//! Holds the control panel audit log and per-guild settings.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{ConsoleError, Result};

/// Audit log entry for a configuration change made through the panel.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub guild_id: u64,
    pub user_id: String,
    pub username: String,
    pub action: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// General bot settings of one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSettings {
    pub guild_id: u64,
    pub command_prefix: String,
    pub log_channel_id: Option<u64>,
}

/// Prefix used until a guild picks its own.
pub const DEFAULT_COMMAND_PREFIX: &str = "-";

impl GuildSettings {
    /// Create settings with the given guild ID and defaults.
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            log_channel_id: None,
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    ///
    /// Creates the database file and initializes schema if needed.
    pub async fn new(path: &str) -> Result<Self> {
        let db_path = Path::new(path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ConsoleError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ConsoleError::Database(format!("Failed to connect to database: {}", e)))?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ConsoleError::Database(format!("Failed to create in-memory db: {}", e)))?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| ConsoleError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ConsoleError::Database(format!("Health check failed: {}", e)))?;

        Ok(())
    }

    /// Close every connection. Later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========== Audit Log ==========

    /// Create an audit log entry.
    pub async fn create_audit_log(
        &self,
        guild_id: u64,
        user_id: &str,
        username: &str,
        action: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO audit_log (guild_id, user_id, username, action, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(guild_id as i64)
        .bind(user_id)
        .bind(username)
        .bind(action)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ConsoleError::Database(format!("Failed to create audit log: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    /// Get audit logs for a guild, newest first.
    pub async fn get_audit_logs(
        &self,
        guild_id: u64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, guild_id, user_id, username, action, timestamp
             FROM audit_log WHERE guild_id = ?
             ORDER BY id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(guild_id as i64)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConsoleError::Database(format!("Failed to get audit logs: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(AuditLogEntry {
                id: row.get("id"),
                guild_id: row.get::<i64, _>("guild_id") as u64,
                user_id: row.get("user_id"),
                username: row.get("username"),
                action: row.get("action"),
                timestamp: chrono::DateTime::parse_from_rfc3339(row.get("timestamp"))
                    .map_err(|e| ConsoleError::Database(format!("Invalid timestamp: {}", e)))?
                    .with_timezone(&chrono::Utc),
            });
        }

        Ok(entries)
    }

    // ========== Guild Settings ==========

    /// Get guild settings, returns defaults if not found.
    pub async fn get_guild_settings(&self, guild_id: u64) -> Result<GuildSettings> {
        let row = sqlx::query(
            "SELECT command_prefix, log_channel_id FROM guild_settings WHERE guild_id = ?",
        )
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConsoleError::Database(format!("Failed to get guild settings: {}", e)))?;

        Ok(match row {
            Some(row) => GuildSettings {
                guild_id,
                command_prefix: row.get("command_prefix"),
                log_channel_id: row
                    .get::<Option<i64>, _>("log_channel_id")
                    .map(|id| id as u64),
            },
            None => GuildSettings::new(guild_id),
        })
    }

    /// Insert or replace guild settings.
    pub async fn set_guild_settings(&self, settings: &GuildSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO guild_settings (guild_id, command_prefix, log_channel_id, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(guild_id) DO UPDATE SET
                command_prefix = excluded.command_prefix,
                log_channel_id = excluded.log_channel_id,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(settings.guild_id as i64)
        .bind(&settings.command_prefix)
        .bind(settings.log_channel_id.map(|id| id as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| ConsoleError::Database(format!("Failed to set guild settings: {}", e)))?;

        Ok(())
    }
}

/// Database schema SQL.
const SCHEMA: &str = r#"
-- Audit log for configuration changes
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    username TEXT NOT NULL,
    action TEXT NOT NULL,
    timestamp TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_audit_log_guild ON audit_log(guild_id, id);

-- General settings per guild
CREATE TABLE IF NOT EXISTS guild_settings (
    guild_id INTEGER PRIMARY KEY,
    command_prefix TEXT NOT NULL,
    log_channel_id INTEGER,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;
