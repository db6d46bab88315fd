use colony_types::ColonyResult;
use rusqlite::Connection;

/// Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`) so opening
/// an existing database is always safe. New columns introduced by a later
/// schema version are added via `migrate_columns`, which probes
/// `PRAGMA table_info` before issuing `ALTER TABLE ... ADD COLUMN`.
pub fn init_schema(conn: &Connection) -> ColonyResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS goals (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            strategy TEXT,
            status TEXT NOT NULL,
            expected_revenue_cents INTEGER NOT NULL DEFAULT 0,
            actual_revenue_cents INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            deadline TEXT
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            goal_id TEXT NOT NULL REFERENCES goals(id),
            parent_id TEXT,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL,
            assigned_to TEXT,
            agent_role TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 50,
            dependencies TEXT NOT NULL DEFAULT '[]',
            result TEXT,
            estimated_cost_cents INTEGER NOT NULL DEFAULT 0,
            actual_cost_cents INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            retry_count INTEGER NOT NULL DEFAULT 0,
            timeout_ms INTEGER NOT NULL DEFAULT 300000,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_goal ON tasks(goal_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            agent_address TEXT NOT NULL,
            goal_id TEXT,
            task_id TEXT,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            compacted_to TEXT,
            created_at TEXT NOT NULL,
            seq INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_goal ON events(goal_id);
        CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
        CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_address);
        CREATE INDEX IF NOT EXISTS idx_events_seq ON events(seq);

        CREATE TABLE IF NOT EXISTS knowledge (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            content TEXT NOT NULL,
            confidence REAL NOT NULL,
            source TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_verified TEXT NOT NULL,
            expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_category ON knowledge(category);

        CREATE TABLE IF NOT EXISTS inbox (
            id TEXT PRIMARY KEY,
            from_address TEXT NOT NULL,
            to_address TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            received_at TEXT NOT NULL,
            processed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_inbox_to_status ON inbox(to_address, status, received_at);

        CREATE TABLE IF NOT EXISTS agents (
            address TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            status TEXT NOT NULL,
            spawned_for_task_id TEXT,
            last_seen_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_role_status ON agents(role, status);

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Forward-migrate an existing database by adding any column a later
/// schema revision introduced. Called after `init_schema` on every open.
pub fn migrate_columns(conn: &Connection) -> ColonyResult<()> {
    let existing: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(events)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        rows.collect::<Result<_, _>>()?
    };
    if !existing.iter().any(|c| c == "seq") {
        conn.execute("ALTER TABLE events ADD COLUMN seq INTEGER NOT NULL DEFAULT 0", [])?;
    }
    Ok(())
}
