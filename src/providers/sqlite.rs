use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use super::{stamp_events, InstanceState, Provider, ProviderError, TerminalOutcome, WorkflowInstance};
use crate::{Event, EventKind};

/// SQLite-backed provider with full transactional support.
///
/// One row per instance in `instances`, one row per event in `history` keyed
/// by `(instance_id, seq)`. Compare-and-append and terminal commits run
/// inside a single transaction, so a terminal event and its status row land
/// together or not at all.
pub struct SqliteProvider {
    pool: SqlitePool,
    // Serializes writers inside this process; SQLite allows one anyway and
    // deferred transactions that upgrade to writes would otherwise hit BUSY.
    write_lock: Mutex<()>,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        // Check for SQLITE_BUSY (database locked) - retryable
        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        // Constraint violations - permanent
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        // Check for connection errors - retryable
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Default: treat as retryable (conservative approach)
        ProviderError::retryable(operation, error_msg)
    }

    fn is_unique_violation(e: &sqlx::Error) -> bool {
        match e {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }

    /// Create a new SQLite provider
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:orders.db" or "sqlite::memory:")
    ///
    /// File databases are created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let connect = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new();
        if is_memory {
            // Each connection to ":memory:" is its own database; keep exactly one alive.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(5);
        }

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // Journal mode: WAL for file DBs; MEMORY for in-memory DBs
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        // Every committed append must survive power loss.
                        sqlx::query("PRAGMA synchronous = FULL").execute(&mut *conn).await?;
                    }

                    // Set busy timeout to 60 seconds to retry on locks
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(connect)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "orderflow::providers::sqlite", url = database_url, "sqlite store ready");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Convenience: a private in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    /// Force a WAL checkpoint so all changes reach the main database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint operation fails.
    pub async fn checkpoint(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA wal_checkpoint(FULL)").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration TEXT NOT NULL,
                input TEXT NOT NULL,
                state TEXT NOT NULL,
                output TEXT,
                failure_reason TEXT,
                cancel_reason TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL REFERENCES instances(instance_id),
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (instance_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn instance_from_row(row: &SqliteRow) -> Result<WorkflowInstance, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = InstanceState::parse(&state)
            .ok_or_else(|| sqlx::Error::Protocol(format!("unknown instance state {state:?}")))?;
        let created: i64 = row.try_get("created_at_ms")?;
        let updated: i64 = row.try_get("updated_at_ms")?;
        Ok(WorkflowInstance {
            instance_id: row.try_get("instance_id")?,
            orchestration: row.try_get("orchestration")?,
            input: row.try_get("input")?,
            state,
            output: row.try_get("output")?,
            failure_reason: row.try_get("failure_reason")?,
            cancel_requested: row.try_get("cancel_reason")?,
            created_at_ms: created.max(0) as u64,
            updated_at_ms: updated.max(0) as u64,
        })
    }

    async fn fetch_instance(
        conn: &mut sqlx::SqliteConnection,
        instance: &str,
    ) -> Result<Option<WorkflowInstance>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::instance_from_row).transpose()
    }

    async fn insert_events(
        conn: &mut sqlx::SqliteConnection,
        operation: &str,
        instance: &str,
        events: &[Event],
    ) -> Result<(), ProviderError> {
        for event in events {
            let data = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))?;
            let result = sqlx::query(
                "INSERT INTO history (instance_id, seq, event_type, event_data, created_at_ms) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(instance)
            .bind(event.seq as i64)
            .bind(event.kind.type_name())
            .bind(data)
            .bind(event.timestamp_ms as i64)
            .execute(&mut *conn)
            .await;
            if let Err(e) = result {
                if Self::is_unique_violation(&e) {
                    // Someone else took this seq between our check and insert.
                    return Err(ProviderError::sequence_conflict(operation, instance, event.seq, event.seq + 1));
                }
                return Err(Self::sqlx_to_provider_error(operation, e));
            }
        }
        Ok(())
    }

    /// Compare-and-append inside `tx`. Returns the stamped events.
    async fn append_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<Vec<Event>, ProviderError> {
        let record = Self::fetch_instance(&mut **tx, instance)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?
            .ok_or_else(|| ProviderError::unknown_instance(operation, instance))?;
        if record.state.is_terminal() {
            return Err(ProviderError::invalid_transition(operation, instance, record.state));
        }

        let actual: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq) + 1, 0) FROM history WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        let actual = actual.max(0) as u64;
        if actual != expected_next_seq {
            return Err(ProviderError::sequence_conflict(operation, instance, expected_next_seq, actual));
        }

        let stamped = stamp_events(actual, events);
        Self::insert_events(&mut **tx, operation, instance, &stamped).await?;
        Ok(stamped)
    }

    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY seq ASC")
            .bind(instance)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("event_data").map_err(|e| Self::sqlx_to_provider_error("read", e))?;
            let event: Event = serde_json::from_str(&data)
                .map_err(|e| ProviderError::permanent("read", format!("Corrupt event for {instance}: {e}")))?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<WorkflowInstance, ProviderError> {
        let _w = self.write_lock.lock().await;
        let record = WorkflowInstance::new_running(instance, orchestration, input);
        let started = Event::new(
            0,
            EventKind::OrchestratorStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            },
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, orchestration, input, state, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance)
        .bind(orchestration)
        .bind(input)
        .bind(record.state.as_str())
        .bind(record.created_at_ms as i64)
        .bind(record.updated_at_ms as i64)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            if Self::is_unique_violation(&e) {
                return Err(ProviderError::duplicate_instance("create_instance", instance));
            }
            return Err(Self::sqlx_to_provider_error("create_instance", e));
        }
        Self::insert_events(&mut *tx, "create_instance", instance, &[started]).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
        Ok(record)
    }

    async fn append(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<Vec<Event>, ProviderError> {
        let _w = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        let stamped = Self::append_in_tx(&mut tx, "append", instance, expected_next_seq, events).await?;
        sqlx::query("UPDATE instances SET updated_at_ms = ? WHERE instance_id = ?")
            .bind(crate::now_ms() as i64)
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        Ok(stamped)
    }

    async fn commit_terminal(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
        outcome: TerminalOutcome,
    ) -> Result<Vec<Event>, ProviderError> {
        let _w = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("commit_terminal", e))?;
        let stamped = Self::append_in_tx(&mut tx, "commit_terminal", instance, expected_next_seq, events).await?;

        let (output, reason) = match &outcome {
            TerminalOutcome::Completed { output } => (Some(output.as_str()), None),
            TerminalOutcome::Failed { reason } | TerminalOutcome::Cancelled { reason } => (None, Some(reason.as_str())),
        };
        sqlx::query(
            r#"
            UPDATE instances
            SET state = ?, output = ?, failure_reason = ?, updated_at_ms = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(outcome.state().as_str())
        .bind(output)
        .bind(reason)
        .bind(crate::now_ms() as i64)
        .bind(instance)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("commit_terminal", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("commit_terminal", e))?;
        debug!(
            target: "orderflow::providers::sqlite",
            instance,
            state = %outcome.state(),
            "committed terminal state"
        );
        Ok(stamped)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let events = self.read_events(instance).await?;
        if events.is_empty() && self.get_instance(instance).await?.is_none() {
            return Err(ProviderError::unknown_instance("read", instance));
        }
        Ok(events)
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("get_instance", e))?;
        Self::fetch_instance(&mut *conn, instance)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("get_instance", e))
    }

    async fn request_cancellation(&self, instance: &str, reason: &str) -> Result<(), ProviderError> {
        let _w = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE instances SET cancel_reason = ?, updated_at_ms = ? WHERE instance_id = ? AND state = 'Running'",
        )
        .bind(reason)
        .bind(crate::now_ms() as i64)
        .bind(instance)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("request_cancellation", e))?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM instances WHERE instance_id = ?")
                .bind(instance)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("request_cancellation", e))?;
            if exists.is_none() {
                return Err(ProviderError::unknown_instance("request_cancellation", instance));
            }
        }
        Ok(())
    }

    async fn list_instances(&self, state: Option<InstanceState>) -> Result<Vec<String>, ProviderError> {
        let rows = match state {
            Some(s) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT instance_id FROM instances WHERE state = ? ORDER BY created_at_ms, instance_id",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_scalar::<_, String>("SELECT instance_id FROM instances ORDER BY created_at_ms, instance_id")
                    .fetch_all(&self.pool)
                    .await
            }
        };
        rows.map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }
}
