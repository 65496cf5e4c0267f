use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::time::Duration;
use tracing::debug;

use super::{
    EntityItem, ExecutionMetadata, InstanceInfo, OrchestrationItem, Provider, ProviderAdmin,
    ProviderError, PurgeFilter, PurgeResult, QueueDepths, RuntimeStatus, ScheduledActivityIdentifier, WorkItem,
    after, generate_lock_token, now_millis,
};
use crate::Event;
use crate::entity::{EntityId, EntityStateUpdate};

/// Configuration options for [`SqliteProvider`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub max_connections: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// SQLite-backed provider with transactional acks.
///
/// Queues are tables with a `visible_at` column; instance and entity locks
/// live in their own tables so a batch stays locked while it is processed.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Map sqlx errors to provider errors with a retry classification.
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }
        ProviderError::retryable(operation, error_msg)
    }

    /// Open (and create) a database.
    ///
    /// `database_url` is a sqlx SQLite URL such as `sqlite:data.db?mode=rwc`
    /// or `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            // in-memory databases vanish with their last connection
            .min_connections(if is_memory { 1 } else { 0 })
            .idle_timeout(if is_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if is_memory { None } else { Some(Duration::from_secs(1800)) })
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                orchestration_version TEXT NOT NULL DEFAULT '',
                input TEXT NOT NULL DEFAULT '',
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                PRIMARY KEY (instance_id, execution_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, execution_id, event_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                locked_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                instance_id TEXT,
                execution_id INTEGER,
                activity_id INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entity_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_name TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entity_state (
                entity_name TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (entity_name, entity_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entity_locks (
                entity_name TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                PRIMARY KEY (entity_name, entity_key)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, instance_id)",
            "CREATE INDEX IF NOT EXISTS idx_orch_lock ON orchestrator_queue(lock_token)",
            "CREATE INDEX IF NOT EXISTS idx_worker_available ON worker_queue(lock_token, id)",
            "CREATE INDEX IF NOT EXISTS idx_worker_identity ON worker_queue(instance_id, execution_id, activity_id)",
            "CREATE INDEX IF NOT EXISTS idx_entity_visible ON entity_queue(visible_at, entity_name, entity_key)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(pool).await?;
        }
        Ok(())
    }

    fn parse_status(operation: &str, raw: &str) -> Result<RuntimeStatus, ProviderError> {
        raw.parse::<RuntimeStatus>()
            .map_err(|e| ProviderError::permanent(operation, e))
    }

    fn encode_item(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item).map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))
    }

    fn decode_item(operation: &str, raw: &str) -> Result<WorkItem, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, format!("Deserialization error: {e}")))
    }

    async fn current_execution_id<'e, E>(executor: E, instance: &str) -> Result<Option<u64>, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(
                (SELECT current_execution_id FROM instances WHERE instance_id = ?1),
                (SELECT MAX(execution_id) FROM executions WHERE instance_id = ?1)
            )
            "#,
        )
        .bind(instance)
        .fetch_one(executor)
        .await?;
        Ok(id.map(|v| v as u64))
    }

    fn rows_to_events(operation: &str, rows: Vec<SqliteRow>) -> Result<Vec<Event>, ProviderError> {
        rows.into_iter()
            .enumerate()
            .map(|(idx, row)| {
                let data: String = row
                    .try_get("event_data")
                    .map_err(|e| ProviderError::permanent(operation, format!("Failed to get event_data: {e}")))?;
                serde_json::from_str::<Event>(&data).map_err(|e| {
                    ProviderError::permanent(
                        operation,
                        format!("Failed to deserialize history event at position {idx}: {e}"),
                    )
                })
            })
            .collect()
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_history", e))?;
        Self::rows_to_events("read_history", rows)
    }

    async fn append_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
        events: Vec<Event>,
    ) -> Result<(), ProviderError> {
        for event in &events {
            if event.event_id() == 0 {
                return Err(ProviderError::permanent(
                    "ack_orchestration_item",
                    "event_id must be set by runtime",
                ));
            }
            let event_data = serde_json::to_string(event).map_err(|e| {
                ProviderError::permanent("ack_orchestration_item", format!("Event serialization failed: {e}"))
            })?;
            sqlx::query(
                r#"
                INSERT INTO history (instance_id, execution_id, event_id, event_type, event_data)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance)
            .bind(execution_id as i64)
            .bind(event.event_id() as i64)
            .bind(event.event_type())
            .bind(event_data)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }
        Ok(())
    }

    async fn insert_orchestrator_item(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        item: &WorkItem,
        visible_at: u64,
    ) -> Result<(), ProviderError> {
        let instance = item
            .orchestrator_instance()
            .ok_or_else(|| ProviderError::permanent(operation, "Invalid work item type"))?;
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(instance)
            .bind(Self::encode_item(operation, item)?)
            .bind(visible_at as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    async fn insert_entity_item(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        item: &WorkItem,
        now_ms: u64,
    ) -> Result<(), ProviderError> {
        let WorkItem::EntityOperation { entity, .. } = item else {
            return Err(ProviderError::permanent(operation, "Invalid work item type"));
        };
        sqlx::query("INSERT INTO entity_queue (entity_name, entity_key, work_item, visible_at) VALUES (?, ?, ?, ?)")
            .bind(&entity.name)
            .bind(&entity.key)
            .bind(Self::encode_item(operation, item)?)
            .bind(now_ms as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    /// Remove an instance with everything stored or queued for it.
    async fn delete_instance_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
    ) -> Result<(), ProviderError> {
        for sql in [
            "DELETE FROM history WHERE instance_id = ?",
            "DELETE FROM executions WHERE instance_id = ?",
            "DELETE FROM orchestrator_queue WHERE instance_id = ?",
            "DELETE FROM worker_queue WHERE instance_id = ?",
            "DELETE FROM instance_locks WHERE instance_id = ?",
            "DELETE FROM instances WHERE instance_id = ?",
        ] {
            sqlx::query(sql)
                .bind(instance)
                .execute(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        }
        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        let now_ms = now_millis() as i64;

        let instance_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let Some(instance_id) = instance_id else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let lock_token = generate_lock_token();
        let locked_until = after(now_ms as u64, lock_timeout) as i64;

        let acquired = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until, locked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3, locked_at = ?4
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance_id)
        .bind(&lock_token)
        .bind(locked_until)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        if acquired.rows_affected() == 0 {
            debug!(target: "durable_e2e::providers::sqlite", instance = %instance_id, "Instance already locked");
            tx.rollback().await.ok();
            return Ok(None);
        }

        // Mark the batch so messages arriving later stay queued for the next turn
        sqlx::query("UPDATE orchestrator_queue SET lock_token = ?1 WHERE instance_id = ?2 AND visible_at <= ?3")
            .bind(&lock_token)
            .bind(&instance_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
            .bind(&lock_token)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let messages: Vec<WorkItem> = rows
            .iter()
            .filter_map(|r| {
                let raw: String = r.try_get("work_item").ok()?;
                match serde_json::from_str(&raw) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        tracing::warn!(
                            target: "durable_e2e::providers::sqlite",
                            instance = %instance_id,
                            error = %e,
                            "Dropping undecodable orchestrator message"
                        );
                        None
                    }
                }
            })
            .collect();

        let info = sqlx::query(
            r#"
            SELECT orchestration_name, orchestration_version, input, current_execution_id
            FROM instances
            WHERE instance_id = ?
            "#,
        )
        .bind(&instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let item = match info {
            Some(row) => {
                let execution_id = row.try_get::<i64, _>("current_execution_id").map_err(|e| {
                    ProviderError::permanent("fetch_orchestration_item", format!("Failed to get execution id: {e}"))
                })? as u64;
                let history = Self::read_history_in_tx(&mut tx, &instance_id, execution_id).await?;
                OrchestrationItem {
                    instance: instance_id.clone(),
                    orchestration_name: row.try_get("orchestration_name").unwrap_or_default(),
                    execution_id,
                    version: row.try_get("orchestration_version").unwrap_or_default(),
                    input: row.try_get("input").unwrap_or_default(),
                    messages,
                    history,
                }
            }
            None => {
                let execution_id = Self::current_execution_id(&mut *tx, &instance_id)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?
                    .unwrap_or(crate::INITIAL_EXECUTION_ID);
                let history = Self::read_history_in_tx(&mut tx, &instance_id, execution_id).await?;
                let (name, input) = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartOrchestration {
                            orchestration, input, ..
                        } => Some((orchestration.clone(), input.clone())),
                        _ => None,
                    })
                    .unwrap_or_default();
                OrchestrationItem {
                    instance: instance_id.clone(),
                    orchestration_name: name,
                    execution_id,
                    version: String::new(),
                    input,
                    messages,
                    history,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        debug!(
            target: "durable_e2e::providers::sqlite",
            instance = %instance_id,
            messages = item.messages.len(),
            history_len = item.history.len(),
            "Fetched orchestration item"
        );
        Ok(Some((item, lock_token)))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
        cancelled_activities: Vec<ScheduledActivityIdentifier>,
    ) -> Result<(), ProviderError> {
        const OP: &str = "ack_orchestration_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now_ms = now_millis();

        let instance_id: String = sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .ok_or_else(|| ProviderError::permanent(OP, "Invalid lock token"))?;

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        if let Some(name) = &metadata.orchestration_name {
            let version = metadata.orchestration_version.clone().unwrap_or_default();
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO instances
                (instance_id, orchestration_name, orchestration_version, current_execution_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&instance_id)
            .bind(name)
            .bind(&version)
            .bind(execution_id as i64)
            .bind(now_ms as i64)
            .bind(now_ms as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

            sqlx::query("UPDATE instances SET orchestration_name = ?, orchestration_version = ? WHERE instance_id = ?")
                .bind(name)
                .bind(&version)
                .bind(&instance_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO executions (instance_id, execution_id, status, started_at)
            VALUES (?, ?, 'Running', ?)
            "#,
        )
        .bind(&instance_id)
        .bind(execution_id as i64)
        .bind(now_ms as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        sqlx::query(
            r#"
            UPDATE instances
            SET current_execution_id = MAX(current_execution_id, ?), updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(execution_id as i64)
        .bind(now_ms as i64)
        .bind(&instance_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        if !history_delta.is_empty() {
            Self::append_history_in_tx(&mut tx, &instance_id, execution_id, history_delta).await?;
        }

        if let Some(status) = metadata.status {
            let completed_at = status.is_terminal().then_some(now_ms as i64);
            sqlx::query(
                r#"
                UPDATE executions
                SET status = ?, output = ?, completed_at = ?
                WHERE instance_id = ? AND execution_id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(&metadata.output)
            .bind(completed_at)
            .bind(&instance_id)
            .bind(execution_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }

        for item in &worker_items {
            let (activity_instance, activity_execution_id, activity_id) = match item {
                WorkItem::ActivityExecute {
                    instance,
                    execution_id,
                    id,
                    ..
                } => (Some(instance.as_str()), Some(*execution_id as i64), Some(*id as i64)),
                _ => (None, None, None),
            };
            sqlx::query(
                r#"
                INSERT INTO worker_queue (work_item, visible_at, instance_id, execution_id, activity_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(Self::encode_item(OP, item)?)
            .bind(now_ms as i64)
            .bind(activity_instance)
            .bind(activity_execution_id)
            .bind(activity_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }

        for item in &entity_items {
            Self::insert_entity_item(&mut tx, OP, item, now_ms).await?;
        }

        for activity in &cancelled_activities {
            sqlx::query("DELETE FROM worker_queue WHERE instance_id = ? AND execution_id = ? AND activity_id = ?")
                .bind(&activity.instance)
                .bind(activity.execution_id as i64)
                .bind(activity.activity_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }

        for item in &orchestrator_items {
            Self::insert_orchestrator_item(&mut tx, OP, item, item.visible_at_ms(now_ms)).await?;
        }

        let lock_valid: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instance_locks WHERE instance_id = ? AND lock_token = ? AND locked_until > ?",
        )
        .bind(&instance_id)
        .bind(lock_token)
        .bind(now_millis() as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        if lock_valid == 0 {
            tracing::warn!(
                target: "durable_e2e::providers::sqlite",
                instance = %instance_id,
                "Instance lock expired or invalid, aborting ack"
            );
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(OP, "Instance lock expired"));
        }

        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ? AND lock_token = ?")
            .bind(&instance_id)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        debug!(
            target: "durable_e2e::providers::sqlite",
            instance = %instance_id,
            execution_id,
            "Acknowledged orchestration item and released lock"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_orchestration_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let instance_id: Option<String> = sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if instance_id.is_none() {
            return Err(ProviderError::permanent(OP, "Invalid lock token"));
        }

        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let now_ms = now_millis();
        let visible_at = delay.map_or(now_ms, |d| after(now_ms, d));
        sqlx::query(
            "UPDATE orchestrator_queue SET lock_token = NULL, visible_at = MAX(visible_at, ?) WHERE lock_token = ?",
        )
        .bind(visible_at as i64)
        .bind(lock_token)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let now_ms = now_millis();
        let result = sqlx::query("UPDATE instance_locks SET locked_until = ?1 WHERE lock_token = ?2 AND locked_until > ?3")
            .bind(after(now_ms, extend_for) as i64)
            .bind(lock_token)
            .bind(now_ms as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("renew_orchestration_item_lock", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "renew_orchestration_item_lock",
                "Lock token invalid, expired, or already acked",
            ));
        }
        Ok(())
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        const OP: &str = "fetch_work_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now_ms = now_millis();

        let next = sqlx::query(
            r#"
            SELECT id, work_item FROM worker_queue
            WHERE visible_at <= ?1
              AND (lock_token IS NULL OR locked_until <= ?1)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(now_ms as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let Some(row) = next else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| ProviderError::permanent(OP, format!("Failed to get id: {e}")))?;
        let raw: String = row
            .try_get("work_item")
            .map_err(|e| ProviderError::permanent(OP, format!("Failed to get work_item: {e}")))?;

        let lock_token = generate_lock_token();
        sqlx::query("UPDATE worker_queue SET lock_token = ?1, locked_until = ?2 WHERE id = ?3")
            .bind(&lock_token)
            .bind(after(now_ms, lock_timeout) as i64)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let item = Self::decode_item(OP, &raw)?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(Some((item, lock_token)))
    }

    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        const OP: &str = "ack_work_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let result = sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(
                OP,
                "Activity was cancelled (worker queue row deleted)",
            ));
        }

        if let Some(completion) = completion {
            Self::insert_orchestrator_item(&mut tx, OP, &completion, now_millis()).await?;
        }

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let now_ms = now_millis();
        let result = sqlx::query("UPDATE worker_queue SET locked_until = ?1 WHERE lock_token = ?2 AND locked_until > ?3")
            .bind(after(now_ms, extend_for) as i64)
            .bind(token)
            .bind(now_ms as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("renew_work_item_lock", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "renew_work_item_lock",
                "Lock renewal failed - activity was cancelled or lock expired",
            ));
        }
        Ok(())
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let now_ms = now_millis();
        let visible_at = delay.map_or(now_ms, |d| after(now_ms, d));
        let result = sqlx::query(
            "UPDATE worker_queue SET lock_token = NULL, locked_until = NULL, visible_at = ?1 WHERE lock_token = ?2",
        )
        .bind(visible_at as i64)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("abandon_work_item", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                "Invalid lock token or already acked",
            ));
        }
        Ok(())
    }

    async fn fetch_entity_item(&self, lock_timeout: Duration) -> Result<Option<(EntityItem, String)>, ProviderError> {
        const OP: &str = "fetch_entity_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now_ms = now_millis() as i64;

        let next = sqlx::query(
            r#"
            SELECT q.id, q.entity_name, q.entity_key, q.work_item
            FROM entity_queue q
            LEFT JOIN entity_locks l ON q.entity_name = l.entity_name AND q.entity_key = l.entity_key
            WHERE q.visible_at <= ?1
              AND (l.entity_name IS NULL OR l.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let Some(row) = next else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let id: i64 = row
            .try_get("id")
            .map_err(|e| ProviderError::permanent(OP, format!("Failed to get id: {e}")))?;
        let raw: String = row
            .try_get("work_item")
            .map_err(|e| ProviderError::permanent(OP, format!("Failed to get work_item: {e}")))?;
        let WorkItem::EntityOperation {
            entity,
            operation,
            input,
            caller,
        } = Self::decode_item(OP, &raw)?
        else {
            return Err(ProviderError::permanent(OP, "Invalid entity queue item"));
        };

        let lock_token = generate_lock_token();
        let acquired = sqlx::query(
            r#"
            INSERT INTO entity_locks (entity_name, entity_key, lock_token, locked_until)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity_name, entity_key) DO UPDATE
            SET lock_token = ?3, locked_until = ?4
            WHERE locked_until <= ?5
            "#,
        )
        .bind(&entity.name)
        .bind(&entity.key)
        .bind(&lock_token)
        .bind(after(now_ms as u64, lock_timeout) as i64)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if acquired.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        sqlx::query("UPDATE entity_queue SET lock_token = ? WHERE id = ?")
            .bind(&lock_token)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM entity_state WHERE entity_name = ? AND entity_key = ?")
                .bind(&entity.name)
                .bind(&entity.key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(Some((
            EntityItem {
                entity,
                operation,
                input,
                caller,
                state,
            },
            lock_token,
        )))
    }

    async fn ack_entity_item(
        &self,
        token: &str,
        state: EntityStateUpdate,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        const OP: &str = "ack_entity_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now_ms = now_millis();

        let row = sqlx::query("SELECT entity_name, entity_key FROM entity_locks WHERE lock_token = ? AND locked_until > ?")
            .bind(token)
            .bind(now_ms as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .ok_or_else(|| ProviderError::permanent(OP, "Invalid or expired lock token"))?;
        let name: String = row
            .try_get("entity_name")
            .map_err(|e| ProviderError::permanent(OP, format!("Failed to get entity_name: {e}")))?;
        let key: String = row
            .try_get("entity_key")
            .map_err(|e| ProviderError::permanent(OP, format!("Failed to get entity_key: {e}")))?;

        sqlx::query("DELETE FROM entity_queue WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        match state {
            EntityStateUpdate::Unchanged => {}
            EntityStateUpdate::Set(value) => {
                sqlx::query(
                    r#"
                    INSERT INTO entity_state (entity_name, entity_key, state, updated_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(entity_name, entity_key) DO UPDATE SET state = ?3, updated_at = ?4
                    "#,
                )
                .bind(&name)
                .bind(&key)
                .bind(value)
                .bind(now_ms as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }
            EntityStateUpdate::Delete => {
                sqlx::query("DELETE FROM entity_state WHERE entity_name = ? AND entity_key = ?")
                    .bind(&name)
                    .bind(&key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }
        }

        if let Some(completion) = completion {
            Self::insert_orchestrator_item(&mut tx, OP, &completion, now_ms).await?;
        }

        sqlx::query("DELETE FROM entity_locks WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn abandon_entity_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_entity_item";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let removed = sqlx::query("DELETE FROM entity_locks WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if removed.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(OP, "Invalid lock token"));
        }

        let now_ms = now_millis();
        sqlx::query("UPDATE entity_queue SET lock_token = NULL, visible_at = ? WHERE lock_token = ?")
            .bind(delay.map_or(now_ms, |d| after(now_ms, d)) as i64)
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "enqueue_for_orchestrator";
        let now_ms = now_millis();
        let visible_at = item.visible_at_ms(now_ms).max(delay.map_or(now_ms, |d| after(now_ms, d)));
        tracing::debug!(target: "durable_e2e::providers::sqlite", ?item, delay = ?delay, "enqueue_for_orchestrator");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::insert_orchestrator_item(&mut tx, OP, &item, visible_at).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn enqueue_for_entity(&self, item: WorkItem) -> Result<(), ProviderError> {
        const OP: &str = "enqueue_for_entity";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::insert_entity_item(&mut tx, OP, &item, now_millis()).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let execution_id = Self::current_execution_id(&self.pool, instance)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        match execution_id {
            Some(id) => self.read_with_execution(instance, id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_with_execution", e))?;
        Self::rows_to_events("read_with_execution", rows)
    }

    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        const OP: &str = "create_instance";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let existing: Option<String> = sqlx::query_scalar(
            r#"
            SELECT e.status
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            WHERE i.instance_id = ?
            "#,
        )
        .bind(instance)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
        .map(|s: Option<String>| s.unwrap_or_else(|| "Pending".to_string()));

        if let Some(raw) = existing {
            if !Self::parse_status(OP, &raw)?.is_terminal() {
                tx.rollback().await.ok();
                return Err(ProviderError::permanent(OP, format!("instance already exists: {instance}")));
            }
            Self::delete_instance_in_tx(&mut tx, OP, instance).await?;
        }

        let now_ms = now_millis() as i64;
        sqlx::query(
            r#"
            INSERT INTO instances
            (instance_id, orchestration_name, orchestration_version, input, current_execution_id, created_at, updated_at)
            VALUES (?, ?, '', ?, ?, ?, ?)
            "#,
        )
        .bind(instance)
        .bind(orchestration)
        .bind(input)
        .bind(crate::INITIAL_EXECUTION_ID as i64)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        sqlx::query("INSERT INTO executions (instance_id, execution_id, status, started_at) VALUES (?, ?, 'Pending', ?)")
            .bind(instance)
            .bind(crate::INITIAL_EXECUTION_ID as i64)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    fn as_management_capability(&self) -> Option<&dyn ProviderAdmin> {
        Some(self as &dyn ProviderAdmin)
    }
}

#[async_trait::async_trait]
impl ProviderAdmin for SqliteProvider {
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY created_at DESC, instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }

    async fn list_instances_by_status(&self, statuses: &[RuntimeStatus]) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT i.instance_id, COALESCE(e.status, 'Pending') AS status
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            ORDER BY i.created_at DESC, i.instance_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("list_instances_by_status", e))?;

        let mut out = Vec::new();
        for row in rows {
            let id: String = row.try_get("instance_id").map_err(|e| {
                ProviderError::permanent("list_instances_by_status", format!("Failed to get instance_id: {e}"))
            })?;
            let raw: String = row.try_get("status").map_err(|e| {
                ProviderError::permanent("list_instances_by_status", format!("Failed to get status: {e}"))
            })?;
            if statuses.contains(&Self::parse_status("list_instances_by_status", &raw)?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        const OP: &str = "get_instance_info";
        let row = sqlx::query(
            r#"
            SELECT i.orchestration_name, i.orchestration_version, i.input, i.current_execution_id,
                   i.created_at, i.updated_at, COALESCE(e.status, 'Pending') AS status, e.output
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            WHERE i.instance_id = ?
            "#,
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let get_err = |e: sqlx::Error| ProviderError::permanent(OP, format!("Failed to decode instance row: {e}"));
        let status: String = row.try_get("status").map_err(get_err)?;
        Ok(Some(InstanceInfo {
            instance_id: instance.to_string(),
            orchestration_name: row.try_get("orchestration_name").map_err(get_err)?,
            orchestration_version: row.try_get("orchestration_version").map_err(get_err)?,
            current_execution_id: row.try_get::<i64, _>("current_execution_id").map_err(get_err)? as u64,
            status: Self::parse_status(OP, &status)?,
            input: row.try_get("input").map_err(get_err)?,
            output: row.try_get("output").map_err(get_err)?,
            created_at: row.try_get::<i64, _>("created_at").map_err(get_err)? as u64,
            updated_at: row.try_get::<i64, _>("updated_at").map_err(get_err)? as u64,
        }))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT execution_id FROM executions WHERE instance_id = ? ORDER BY execution_id")
                .bind(instance)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("list_executions", e))?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

    async fn read_history_with_execution_id(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        self.read_with_execution(instance, execution_id).await
    }

    async fn read_entity_state(&self, entity: &EntityId) -> Result<Option<String>, ProviderError> {
        sqlx::query_scalar("SELECT state FROM entity_state WHERE entity_name = ? AND entity_key = ?")
            .bind(&entity.name)
            .bind(&entity.key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read_entity_state", e))
    }

    async fn get_queue_depths(&self) -> Result<QueueDepths, ProviderError> {
        let (orch, worker, entity): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM orchestrator_queue),
                (SELECT COUNT(*) FROM worker_queue),
                (SELECT COUNT(*) FROM entity_queue)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_queue_depths", e))?;
        Ok(QueueDepths {
            orchestrator_queue: orch as usize,
            worker_queue: worker as usize,
            entity_queue: entity as usize,
        })
    }

    async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ProviderError> {
        const OP: &str = "purge_instances";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let rows = sqlx::query(
            r#"
            SELECT i.instance_id, i.created_at, COALESCE(e.status, 'Pending') AS status
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let mut matched = Vec::new();
        for row in rows {
            let get_err = |e: sqlx::Error| ProviderError::permanent(OP, format!("Failed to decode instance row: {e}"));
            let id: String = row.try_get("instance_id").map_err(get_err)?;
            let created_at = row.try_get::<i64, _>("created_at").map_err(get_err)? as u64;
            let status: String = row.try_get("status").map_err(get_err)?;
            if filter.matches(&id, created_at, Self::parse_status(OP, &status)?) {
                matched.push(id);
            }
        }

        for id in &matched {
            Self::delete_instance_in_tx(&mut tx, OP, id).await?;
        }
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        debug!(target: "durable_e2e::providers::sqlite", deleted = matched.len(), "Purged instances");
        Ok(PurgeResult {
            instances_deleted: matched.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use crate::entity::EntityId;
    use crate::providers::EntityCaller;

    async fn create_test_store() -> SqliteProvider {
        SqliteProvider::new("sqlite::memory:", None)
            .await
            .expect("Failed to create test store")
    }

    fn started(instance: &str) -> Event {
        Event::with_event_id(
            1,
            instance,
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "TestOrch".to_string(),
                version: "1.0.0".to_string(),
                input: "{}".to_string(),
            },
        )
    }

    fn metadata(status: RuntimeStatus) -> ExecutionMetadata {
        ExecutionMetadata {
            status: Some(status),
            output: None,
            orchestration_name: Some("TestOrch".to_string()),
            orchestration_version: Some("1.0.0".to_string()),
        }
    }

    async fn start_and_fetch(store: &SqliteProvider, instance: &str) -> (OrchestrationItem, String) {
        store.create_instance(instance, "TestOrch", "{}").await.unwrap();
        store
            .enqueue_for_orchestrator(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: "TestOrch".to_string(),
                    input: "{}".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        store
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .expect("fetch should succeed")
            .expect("item should be present")
    }

    #[tokio::test]
    async fn test_basic_enqueue_dequeue() {
        let store = create_test_store().await;
        let (item, lock_token) = start_and_fetch(&store, "test-1").await;
        assert_eq!(item.instance, "test-1");
        assert_eq!(item.messages.len(), 1);
        assert!(item.history.is_empty());
        assert_eq!(
            store.get_instance_info("test-1").await.unwrap().unwrap().status,
            RuntimeStatus::Pending
        );

        store
            .ack_orchestration_item(
                &lock_token,
                1,
                vec![started("test-1")],
                vec![],
                vec![],
                vec![],
                metadata(RuntimeStatus::Running),
                vec![],
            )
            .await
            .unwrap();

        assert!(store.fetch_orchestration_item(Duration::from_secs(30)).await.unwrap().is_none());
        let history = store.read("test-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type(), "OrchestrationStarted");
        let info = store.get_instance_info("test-1").await.unwrap().unwrap();
        assert_eq!(info.status, RuntimeStatus::Running);
        assert_eq!(info.orchestration_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_ack_enqueues_all_outputs_atomically() {
        let store = create_test_store().await;
        let (_, lock_token) = start_and_fetch(&store, "atomic").await;

        store
            .ack_orchestration_item(
                &lock_token,
                1,
                vec![started("atomic")],
                vec![WorkItem::ActivityExecute {
                    instance: "atomic".to_string(),
                    execution_id: 1,
                    id: 2,
                    orchestration: "TestOrch".to_string(),
                    name: "A".to_string(),
                    input: String::new(),
                }],
                vec![WorkItem::EntityOperation {
                    entity: EntityId::new("Counter", "c"),
                    operation: "add".to_string(),
                    input: "1".to_string(),
                    caller: Some(EntityCaller {
                        instance: "atomic".to_string(),
                        execution_id: 1,
                        id: 3,
                    }),
                }],
                vec![WorkItem::TimerFired {
                    instance: "atomic".to_string(),
                    execution_id: 1,
                    id: 4,
                    fire_at_ms: now_millis() + 60_000,
                }],
                metadata(RuntimeStatus::Running),
                vec![],
            )
            .await
            .unwrap();

        let depths = store.get_queue_depths().await.unwrap();
        assert_eq!(depths.worker_queue, 1);
        assert_eq!(depths.entity_queue, 1);
        assert_eq!(depths.orchestrator_queue, 1);
        // the timer is not due yet
        assert!(store.fetch_orchestration_item(Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_lock_token_rejected() {
        let store = create_test_store().await;
        let err = store
            .ack_orchestration_item(
                "lock_missing",
                1,
                vec![],
                vec![],
                vec![],
                vec![],
                ExecutionMetadata::default(),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(store.abandon_work_item("lock_missing", None).await.is_err());
        assert!(store.abandon_entity_item("lock_missing", None).await.is_err());
    }

    #[tokio::test]
    async fn test_abandon_orchestration_item_makes_batch_visible() {
        let store = create_test_store().await;
        let (_, lock_token) = start_and_fetch(&store, "abandon").await;
        store.abandon_orchestration_item(&lock_token, None).await.unwrap();

        let (item, _) = store
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.instance, "abandon");
        assert_eq!(item.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_expiration_allows_refetch() {
        let store = create_test_store().await;
        let (_, stale_token) = {
            store.create_instance("expire", "TestOrch", "{}").await.unwrap();
            store
                .enqueue_for_orchestrator(
                    WorkItem::StartOrchestration {
                        instance: "expire".to_string(),
                        orchestration: "TestOrch".to_string(),
                        input: "{}".to_string(),
                    },
                    None,
                )
                .await
                .unwrap();
            store
                .fetch_orchestration_item(Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap()
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (item, _) = store
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.messages.len(), 1);
        assert!(
            store
                .ack_orchestration_item(
                    &stale_token,
                    1,
                    vec![],
                    vec![],
                    vec![],
                    vec![],
                    ExecutionMetadata::default(),
                    vec![],
                )
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_worker_queue_operations() {
        let store = create_test_store().await;
        let (_, lock_token) = start_and_fetch(&store, "worker").await;
        store
            .ack_orchestration_item(
                &lock_token,
                1,
                vec![started("worker")],
                vec![WorkItem::ActivityExecute {
                    instance: "worker".to_string(),
                    execution_id: 1,
                    id: 2,
                    orchestration: "TestOrch".to_string(),
                    name: "A".to_string(),
                    input: "x".to_string(),
                }],
                vec![],
                vec![],
                metadata(RuntimeStatus::Running),
                vec![],
            )
            .await
            .unwrap();

        let (item, token) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(matches!(item, WorkItem::ActivityExecute { id: 2, .. }));
        assert!(store.fetch_work_item(Duration::from_secs(30)).await.unwrap().is_none());
        store.renew_work_item_lock(&token, Duration::from_secs(30)).await.unwrap();

        store
            .ack_work_item(
                &token,
                Some(WorkItem::ActivityCompleted {
                    instance: "worker".to_string(),
                    execution_id: 1,
                    id: 2,
                    result: "done".to_string(),
                }),
            )
            .await
            .unwrap();

        let (orch_item, _) = store
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            &orch_item.messages[..],
            [WorkItem::ActivityCompleted { result, .. }] if result == "done"
        ));
        assert_eq!(orch_item.history.len(), 1);
    }

    #[tokio::test]
    async fn test_entity_state_commit_and_lock() {
        let store = create_test_store().await;
        let entity = EntityId::new("TestEntity", "singleton");
        for op in ["SetState", "GetState"] {
            store
                .enqueue_for_entity(WorkItem::EntityOperation {
                    entity: entity.clone(),
                    operation: op.to_string(),
                    input: "42".to_string(),
                    caller: None,
                })
                .await
                .unwrap();
        }

        let (first, token) = store.fetch_entity_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.operation, "SetState");
        assert!(first.state.is_none());
        assert!(store.fetch_entity_item(Duration::from_secs(30)).await.unwrap().is_none());

        store
            .ack_entity_item(&token, EntityStateUpdate::Set("42".to_string()), None)
            .await
            .unwrap();
        assert_eq!(store.read_entity_state(&entity).await.unwrap().as_deref(), Some("42"));

        let (second, token) = store.fetch_entity_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.operation, "GetState");
        assert_eq!(second.state.as_deref(), Some("42"));
        store.abandon_entity_item(&token, None).await.unwrap();
        assert_eq!(store.get_queue_depths().await.unwrap().entity_queue, 1);
    }

    #[tokio::test]
    async fn test_purge_and_create_instance_rules() {
        let store = create_test_store().await;
        let (_, token) = start_and_fetch(&store, "done").await;
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("done")],
                vec![],
                vec![],
                vec![],
                metadata(RuntimeStatus::Completed),
                vec![],
            )
            .await
            .unwrap();
        store.create_instance("live", "TestOrch", "{}").await.unwrap();
        assert!(store.create_instance("live", "TestOrch", "{}").await.is_err());

        let mut running = store
            .list_instances_by_status(&[RuntimeStatus::Pending, RuntimeStatus::Running])
            .await
            .unwrap();
        running.sort();
        assert_eq!(running, vec!["live".to_string()]);

        let result = store.purge_instances(PurgeFilter::terminal()).await.unwrap();
        assert_eq!(result.instances_deleted, 1);
        assert!(store.read("done").await.unwrap().is_empty());
        assert!(store.list_executions("done").await.unwrap().is_empty());
        assert_eq!(store.purge_instances(PurgeFilter::terminal()).await.unwrap().instances_deleted, 0);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("store.db").display());
        {
            let store = SqliteProvider::new(&url, None).await.unwrap();
            store.create_instance("persist", "TestOrch", "in").await.unwrap();
        }
        let reopened = SqliteProvider::new(&url, None).await.unwrap();
        let info = reopened.get_instance_info("persist").await.unwrap().unwrap();
        assert_eq!(info.input, "in");
    }
}
