pub mod rows;
mod schema;

use chrono::{DateTime, Utc};
use colony_types::*;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The embedded relational store. Single writer, WAL-mode SQLite, one
/// connection shared behind an async mutex — mirroring the
/// `MemoryDatabase` pattern this runtime's memory layer used, generalized
/// from a vector-search cache to the full goal/task/event/knowledge/inbox
/// domain model.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl Store {
    pub async fn open(path: &Path) -> ColonyResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        schema::init_schema(&conn)?;
        schema::migrate_columns(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Opens an in-memory store, for tests.
    pub async fn open_in_memory() -> ColonyResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        schema::migrate_columns(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Runs `f` inside one SQLite transaction; either every write `f`
    /// performs is committed, or none are. Callers that need to compose
    /// several store operations atomically do so by calling plain
    /// `colony_store::rows::*` functions against the `&rusqlite::Transaction`
    /// handed to `f`, rather than nesting `run_transaction` calls — nesting
    /// transactions is not meaningful in SQLite, so the API does not offer
    /// it; composition happens at the Rust call-graph level instead.
    pub async fn run_transaction<F, T>(&self, f: F) -> ColonyResult<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> ColonyResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub async fn get_active_goals(&self) -> ColonyResult<Vec<Goal>> {
        let conn = self.conn.lock().await;
        rows::list_active_goals(&conn)
    }

    pub async fn get_goal(&self, id: &str) -> ColonyResult<Option<Goal>> {
        let conn = self.conn.lock().await;
        rows::get_goal(&conn, id)
    }

    pub async fn get_ready_tasks(&self, goal_id: &str) -> ColonyResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        rows::list_ready_tasks(&conn, goal_id)
    }

    pub async fn get_tasks_by_goal(&self, goal_id: &str) -> ColonyResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        rows::list_tasks_by_goal(&conn, goal_id)
    }

    pub async fn get_task(&self, id: &str) -> ColonyResult<Option<Task>> {
        let conn = self.conn.lock().await;
        rows::get_task(&conn, id)
    }

    pub async fn get_recent_events(&self, agent: &str, limit: usize) -> ColonyResult<Vec<StreamEvent>> {
        let conn = self.conn.lock().await;
        rows::list_recent_events(&conn, agent, limit)
    }

    pub async fn get_events_by_goal(&self, goal_id: &str) -> ColonyResult<Vec<StreamEvent>> {
        let conn = self.conn.lock().await;
        rows::list_events_by_goal(&conn, goal_id)
    }

    pub async fn get_events_by_type(
        &self,
        event_type: StreamEventType,
        since: Option<DateTime<Utc>>,
    ) -> ColonyResult<Vec<StreamEvent>> {
        let conn = self.conn.lock().await;
        rows::list_events_by_type(&conn, event_type, since)
    }

    pub async fn insert_inbox_message(&self, msg: &InboxMessage) -> ColonyResult<()> {
        self.run_transaction(|tx| rows::insert_inbox_message(tx, msg)).await
    }

    pub async fn update_inbox_message(&self, msg: &InboxMessage) -> ColonyResult<()> {
        self.run_transaction(|tx| rows::update_inbox_message(tx, msg)).await
    }

    pub async fn get_inbox_message(&self, id: &str) -> ColonyResult<Option<InboxMessage>> {
        let conn = self.conn.lock().await;
        rows::get_inbox_message(&conn, id)
    }

    pub async fn claim_inbox_messages(&self, to: &str, n: usize) -> ColonyResult<Vec<InboxMessage>> {
        self.run_transaction(|tx| rows::claim_inbox_messages(tx, to, n)).await
    }

    pub async fn kv_get(&self, key: &str) -> ColonyResult<Option<String>> {
        let conn = self.conn.lock().await;
        rows::kv_get(&conn, key)
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> ColonyResult<()> {
        let conn = self.conn.lock().await;
        rows::kv_set(&conn, key, value)
    }

    pub async fn upsert_agent(&self, agent: &AgentRecord) -> ColonyResult<()> {
        let conn = self.conn.lock().await;
        rows::upsert_agent(&conn, agent)
    }

    pub async fn get_idle_agent_for_role(&self, role: &str) -> ColonyResult<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        rows::get_idle_agent_for_role(&conn, role)
    }

    pub async fn get_any_idle_agent(&self) -> ColonyResult<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        rows::get_any_idle_agent(&conn)
    }

    pub async fn get_any_busy_agent(&self) -> ColonyResult<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        rows::get_any_busy_agent(&conn)
    }
}
