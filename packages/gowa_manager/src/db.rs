//! Persistence layer: a single `instances` table plus idempotent,
//! forward-compatible migrations (§4.7).

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::models::{Instance, InstanceConfig, InstanceStatus};

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

/// Current schema version. Increment when adding a migration below.
const SCHEMA_VERSION: i64 = 3;

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self> {
        info!("connecting to database: {db_url}");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(db_url)
            .await
            .with_context(|| format!("failed to connect to database: {db_url}"))?;

        run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA cache_size = -64000").execute(&pool).await?;
        sqlx::query("PRAGMA temp_store = MEMORY").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        info!("database ready");
        Ok(Self { pool })
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    pub async fn get_instance(&self, id: i64) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    pub async fn get_instance_by_key(&self, key: &str) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    pub async fn name_exists(&self, name: &str, exclude_id: Option<i64>) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instances WHERE name = ? AND id != ?",
        )
        .bind(name)
        .bind(exclude_id.unwrap_or(-1))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn insert_instance(
        &self,
        key: &str,
        name: &str,
        port: u16,
        config: &InstanceConfig,
        gowa_version: &str,
    ) -> Result<Instance> {
        let now = Utc::now();
        let config_json = serde_json::to_string(config)?;

        let id = sqlx::query(
            r#"
            INSERT INTO instances (key, name, port, status, config, gowa_version, error_message, created_at, updated_at)
            VALUES (?, ?, ?, 'stopped', ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(key)
        .bind(name)
        .bind(i64::from(port))
        .bind(&config_json)
        .bind(gowa_version)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_instance(id)
            .await?
            .context("just-inserted instance vanished")
    }

    pub async fn update_instance_fields(
        &self,
        id: i64,
        name: Option<&str>,
        config: Option<&InstanceConfig>,
        gowa_version: Option<&str>,
    ) -> Result<()> {
        let existing = self.get_instance(id).await?.context("instance not found")?;
        let name = name.unwrap_or(&existing.name);
        let config_json = match config {
            Some(c) => serde_json::to_string(c)?,
            None => serde_json::to_string(&existing.config)?,
        };
        let gowa_version = gowa_version.unwrap_or(&existing.gowa_version);

        sqlx::query(
            "UPDATE instances SET name = ?, config = ?, gowa_version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(config_json)
        .bind(gowa_version)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        id: i64,
        status: InstanceStatus,
        port: Option<u16>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET status = ?, port = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(port.map(i64::from))
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_port(&self, id: i64, port: u16) -> Result<()> {
        sqlx::query("UPDATE instances SET port = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(port))
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_instance(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn allocated_ports(&self) -> Result<Vec<u16>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT port FROM instances WHERE port IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|p| p as u16).collect())
    }

    pub async fn running_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE status = 'running' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<Instance> {
    let config_json: String = row.try_get("config")?;
    let config: InstanceConfig = serde_json::from_str(&config_json).unwrap_or_default();
    let port: Option<i64> = row.try_get("port")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Instance {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        name: row.try_get("name")?,
        port: port.map(|p| p as u16),
        status: row.try_get("status")?,
        config,
        gowa_version: row.try_get("gowa_version")?,
        error_message: row.try_get("error_message")?,
        created_at: created_at.parse().context("bad created_at timestamp")?,
        updated_at: updated_at.parse().context("bad updated_at timestamp")?,
    })
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("database schema up to date (version {current_version})");
        return Ok(());
    }

    info!("migrating database from version {current_version} to {SCHEMA_VERSION}");

    if current_version < 1 {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                port INTEGER,
                status TEXT NOT NULL DEFAULT 'stopped',
                config TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    if current_version < 2 {
        // "duplicate column" on a pre-migrated database is a no-op, not a failure.
        let _ = sqlx::query("ALTER TABLE instances ADD COLUMN gowa_version TEXT NOT NULL DEFAULT 'latest'")
            .execute(pool)
            .await;
    }

    if current_version < 3 {
        let _ = sqlx::query("ALTER TABLE instances ADD COLUMN error_message TEXT")
            .execute(pool)
            .await;
    }

    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceConfig;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn migrations_create_usable_schema() {
        let db = memory_db().await;
        assert!(db.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let db = memory_db().await;
        let config = InstanceConfig::default_for("app", "ABCD1234");
        let inserted = db
            .insert_instance("ABCD1234", "brave-otter-001", 8000, &config, "latest")
            .await
            .unwrap();

        let fetched = db.get_instance(inserted.id).await.unwrap().unwrap();
        assert_eq!(fetched.key, "ABCD1234");
        assert_eq!(fetched.name, "brave-otter-001");
        assert_eq!(fetched.status, InstanceStatus::Stopped);
        assert_eq!(fetched.port, Some(8000));
    }

    #[tokio::test]
    async fn name_and_key_uniqueness_is_enforced_by_the_schema() {
        let db = memory_db().await;
        let config = InstanceConfig::default_for("app", "ABCD1234");
        db.insert_instance("ABCD1234", "same-name", 8000, &config, "latest")
            .await
            .unwrap();

        let second = db
            .insert_instance("WXYZ9876", "same-name", 8001, &config, "latest")
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn update_status_persists_port_and_error_message() {
        let db = memory_db().await;
        let config = InstanceConfig::default_for("app", "ABCD1234");
        let instance = db
            .insert_instance("ABCD1234", "brave-otter-001", 8000, &config, "latest")
            .await
            .unwrap();

        db.update_status(instance.id, InstanceStatus::Running, Some(8001), None)
            .await
            .unwrap();
        let fetched = db.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InstanceStatus::Running);
        assert_eq!(fetched.port, Some(8001));
        assert!(fetched.error_message.is_none());

        db.update_status(instance.id, InstanceStatus::Error, None, Some("boom"))
            .await
            .unwrap();
        let fetched = db.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InstanceStatus::Error);
        assert_eq!(fetched.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn delete_is_idempotently_reported_as_not_found() {
        let db = memory_db().await;
        let config = InstanceConfig::default_for("app", "ABCD1234");
        let instance = db
            .insert_instance("ABCD1234", "brave-otter-001", 8000, &config, "latest")
            .await
            .unwrap();

        assert!(db.delete_instance(instance.id).await.unwrap());
        assert!(!db.delete_instance(instance.id).await.unwrap());
    }

    #[tokio::test]
    async fn allocated_ports_only_returns_assigned_ones() {
        let db = memory_db().await;
        let config = InstanceConfig::default_for("app", "ABCD1234");
        let a = db
            .insert_instance("AAAAAAAA", "name-a", 8000, &config, "latest")
            .await
            .unwrap();
        db.insert_instance("BBBBBBBB", "name-b", 8001, &config, "latest")
            .await
            .unwrap();

        db.update_status(a.id, InstanceStatus::Running, Some(8005), None)
            .await
            .unwrap();

        let mut ports = db.allocated_ports().await.unwrap();
        ports.sort();
        assert_eq!(ports, vec![8001, 8005]);
    }
}
