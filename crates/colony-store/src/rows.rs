use chrono::{DateTime, Utc};
use colony_types::*;
use rusqlite::{params, Connection, OptionalExtension, Row};

fn parse_dt(row: &Row, idx: impl rusqlite::RowIndex) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
}

fn goal_status_str(status: &GoalStatus) -> &'static str {
    match status {
        GoalStatus::Active => "active",
        GoalStatus::Completed => "completed",
        GoalStatus::Failed => "failed",
        GoalStatus::Paused => "paused",
    }
}

fn goal_status_from(s: &str) -> GoalStatus {
    match s {
        "completed" => GoalStatus::Completed,
        "failed" => GoalStatus::Failed,
        "paused" => GoalStatus::Paused,
        _ => GoalStatus::Active,
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Assigned => "assigned",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Cancelled => "cancelled",
    }
}

pub fn task_status_from(s: &str) -> TaskStatus {
    match s {
        "assigned" => TaskStatus::Assigned,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "blocked" => TaskStatus::Blocked,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

fn goal_from_row(row: &Row) -> rusqlite::Result<Goal> {
    Ok(Goal {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        strategy: row.get("strategy")?,
        status: goal_status_from(&row.get::<_, String>("status")?),
        expected_revenue_cents: row.get("expected_revenue_cents")?,
        actual_revenue_cents: row.get("actual_revenue_cents")?,
        created_at: parse_dt(row, "created_at")?.unwrap_or_else(Utc::now),
        completed_at: parse_dt(row, "completed_at")?,
        deadline: parse_dt(row, "deadline")?,
    })
}

pub fn insert_goal(conn: &Connection, goal: &Goal) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO goals (id, title, description, strategy, status, expected_revenue_cents,
            actual_revenue_cents, created_at, completed_at, deadline)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            goal.id,
            goal.title,
            goal.description,
            goal.strategy,
            goal_status_str(&goal.status),
            goal.expected_revenue_cents,
            goal.actual_revenue_cents,
            goal.created_at.to_rfc3339(),
            goal.completed_at.map(|d| d.to_rfc3339()),
            goal.deadline.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn update_goal(conn: &Connection, goal: &Goal) -> ColonyResult<()> {
    conn.execute(
        "UPDATE goals SET title=?2, description=?3, strategy=?4, status=?5,
            expected_revenue_cents=?6, actual_revenue_cents=?7, completed_at=?8, deadline=?9
         WHERE id=?1",
        params![
            goal.id,
            goal.title,
            goal.description,
            goal.strategy,
            goal_status_str(&goal.status),
            goal.expected_revenue_cents,
            goal.actual_revenue_cents,
            goal.completed_at.map(|d| d.to_rfc3339()),
            goal.deadline.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_goal(conn: &Connection, id: &str) -> ColonyResult<Option<Goal>> {
    conn.query_row("SELECT * FROM goals WHERE id=?1", params![id], goal_from_row)
        .optional()
        .map_err(ColonyError::from)
}

pub fn list_active_goals(conn: &Connection) -> ColonyResult<Vec<Goal>> {
    let mut stmt = conn.prepare("SELECT * FROM goals WHERE status='active' ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], goal_from_row)?;
    rows.collect::<Result<_, _>>().map_err(ColonyError::from)
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let deps_raw: String = row.get("dependencies")?;
    let dependencies: Vec<String> = serde_json::from_str(&deps_raw).unwrap_or_default();
    let result_raw: Option<String> = row.get("result")?;
    let result = result_raw.and_then(|r| serde_json::from_str(&r).ok());

    Ok(Task {
        id: row.get("id")?,
        goal_id: row.get("goal_id")?,
        parent_id: row.get("parent_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: task_status_from(&row.get::<_, String>("status")?),
        assigned_to: row.get("assigned_to")?,
        agent_role: row.get("agent_role")?,
        priority: row.get::<_, i64>("priority")? as u8,
        dependencies,
        result,
        estimated_cost_cents: row.get("estimated_cost_cents")?,
        actual_cost_cents: row.get("actual_cost_cents")?,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        timeout_ms: row.get::<_, i64>("timeout_ms")? as u64,
        created_at: parse_dt(row, "created_at")?.unwrap_or_else(Utc::now),
        started_at: parse_dt(row, "started_at")?,
        completed_at: parse_dt(row, "completed_at")?,
    })
}

pub fn insert_task(conn: &Connection, task: &Task) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO tasks (id, goal_id, parent_id, title, description, status, assigned_to,
            agent_role, priority, dependencies, result, estimated_cost_cents, actual_cost_cents,
            max_retries, retry_count, timeout_ms, created_at, started_at, completed_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
        params![
            task.id,
            task.goal_id,
            task.parent_id,
            task.title,
            task.description,
            task_status_str(task.status),
            task.assigned_to,
            task.agent_role,
            task.priority as i64,
            serde_json::to_string(&task.dependencies)?,
            task.result.as_ref().map(serde_json::to_string).transpose()?,
            task.estimated_cost_cents,
            task.actual_cost_cents,
            task.max_retries as i64,
            task.retry_count as i64,
            task.timeout_ms as i64,
            task.created_at.to_rfc3339(),
            task.started_at.map(|d| d.to_rfc3339()),
            task.completed_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn update_task(conn: &Connection, task: &Task) -> ColonyResult<()> {
    conn.execute(
        "UPDATE tasks SET parent_id=?2, title=?3, description=?4, status=?5, assigned_to=?6,
            agent_role=?7, priority=?8, dependencies=?9, result=?10, estimated_cost_cents=?11,
            actual_cost_cents=?12, max_retries=?13, retry_count=?14, timeout_ms=?15,
            started_at=?16, completed_at=?17
         WHERE id=?1",
        params![
            task.id,
            task.parent_id,
            task.title,
            task.description,
            task_status_str(task.status),
            task.assigned_to,
            task.agent_role,
            task.priority as i64,
            serde_json::to_string(&task.dependencies)?,
            task.result.as_ref().map(serde_json::to_string).transpose()?,
            task.estimated_cost_cents,
            task.actual_cost_cents,
            task.max_retries as i64,
            task.retry_count as i64,
            task.timeout_ms as i64,
            task.started_at.map(|d| d.to_rfc3339()),
            task.completed_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_task(conn: &Connection, id: &str) -> ColonyResult<Option<Task>> {
    conn.query_row("SELECT * FROM tasks WHERE id=?1", params![id], task_from_row)
        .optional()
        .map_err(ColonyError::from)
}

pub fn list_tasks_by_goal(conn: &Connection, goal_id: &str) -> ColonyResult<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE goal_id=?1 ORDER BY created_at ASC")?;
    let rows = stmt.query_map(params![goal_id], task_from_row)?;
    rows.collect::<Result<_, _>>().map_err(ColonyError::from)
}

/// Ready = pending and every dependency completed, ordered by priority desc.
/// Evaluated in Rust rather than SQL so the "all deps completed" check stays
/// a single readable pass over an already-small per-goal task set.
pub fn list_ready_tasks(conn: &Connection, goal_id: &str) -> ColonyResult<Vec<Task>> {
    let tasks = list_tasks_by_goal(conn, goal_id)?;
    let completed: std::collections::HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();
    let mut ready: Vec<Task> = tasks
        .into_iter()
        .filter(|t| {
            t.status == TaskStatus::Pending
                && t.dependencies.iter().all(|d| completed.contains(d.as_str()))
        })
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(ready)
}

fn event_type_str(t: StreamEventType) -> &'static str {
    match t {
        StreamEventType::UserInput => "user_input",
        StreamEventType::PlanCreated => "plan_created",
        StreamEventType::PlanUpdated => "plan_updated",
        StreamEventType::TaskAssigned => "task_assigned",
        StreamEventType::TaskCompleted => "task_completed",
        StreamEventType::TaskFailed => "task_failed",
        StreamEventType::Action => "action",
        StreamEventType::Observation => "observation",
        StreamEventType::Inference => "inference",
        StreamEventType::Financial => "financial",
        StreamEventType::AgentSpawned => "agent_spawned",
        StreamEventType::AgentDied => "agent_died",
        StreamEventType::Knowledge => "knowledge",
        StreamEventType::MarketSignal => "market_signal",
        StreamEventType::Revenue => "revenue",
        StreamEventType::Error => "error",
        StreamEventType::Reflection => "reflection",
        StreamEventType::Compression => "compression",
        StreamEventType::CompressionError => "compression_error",
        StreamEventType::CompressionWarning => "compression_warning",
    }
}

pub fn event_type_from(s: &str) -> StreamEventType {
    match s {
        "plan_created" => StreamEventType::PlanCreated,
        "plan_updated" => StreamEventType::PlanUpdated,
        "task_assigned" => StreamEventType::TaskAssigned,
        "task_completed" => StreamEventType::TaskCompleted,
        "task_failed" => StreamEventType::TaskFailed,
        "action" => StreamEventType::Action,
        "observation" => StreamEventType::Observation,
        "inference" => StreamEventType::Inference,
        "financial" => StreamEventType::Financial,
        "agent_spawned" => StreamEventType::AgentSpawned,
        "agent_died" => StreamEventType::AgentDied,
        "knowledge" => StreamEventType::Knowledge,
        "market_signal" => StreamEventType::MarketSignal,
        "revenue" => StreamEventType::Revenue,
        "error" => StreamEventType::Error,
        "reflection" => StreamEventType::Reflection,
        "compression" => StreamEventType::Compression,
        "compression_error" => StreamEventType::CompressionError,
        "compression_warning" => StreamEventType::CompressionWarning,
        _ => StreamEventType::UserInput,
    }
}

fn event_from_row(row: &Row) -> rusqlite::Result<StreamEvent> {
    Ok(StreamEvent {
        id: row.get("id")?,
        event_type: event_type_from(&row.get::<_, String>("event_type")?),
        agent_address: row.get("agent_address")?,
        goal_id: row.get("goal_id")?,
        task_id: row.get("task_id")?,
        content: row.get("content")?,
        token_count: row.get::<_, i64>("token_count")? as u32,
        compacted_to: row.get("compacted_to")?,
        created_at: parse_dt(row, "created_at")?.unwrap_or_else(Utc::now),
    })
}

pub fn append_event(conn: &Connection, event: &StreamEvent, seq: i64) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO events (id, event_type, agent_address, goal_id, task_id, content,
            token_count, compacted_to, created_at, seq)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
        params![
            event.id,
            event_type_str(event.event_type),
            event.agent_address,
            event.goal_id,
            event.task_id,
            event.content,
            event.token_count as i64,
            event.compacted_to,
            event.created_at.to_rfc3339(),
            seq,
        ],
    )?;
    Ok(())
}

pub fn next_seq(conn: &Connection) -> ColonyResult<i64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(seq) FROM events", [], |r| r.get(0))?;
    Ok(max.unwrap_or(0) + 1)
}

pub fn list_recent_events(conn: &Connection, agent: &str, limit: usize) -> ColonyResult<Vec<StreamEvent>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM events WHERE agent_address=?1 ORDER BY seq DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![agent, limit as i64], event_from_row)?;
    let mut events: Vec<StreamEvent> = rows.collect::<Result<_, _>>()?;
    events.reverse();
    Ok(events)
}

pub fn list_events_by_goal(conn: &Connection, goal_id: &str) -> ColonyResult<Vec<StreamEvent>> {
    let mut stmt = conn.prepare("SELECT * FROM events WHERE goal_id=?1 ORDER BY seq ASC")?;
    let rows = stmt.query_map(params![goal_id], event_from_row)?;
    rows.collect::<Result<_, _>>().map_err(ColonyError::from)
}

pub fn list_events_by_type(
    conn: &Connection,
    event_type: StreamEventType,
    since: Option<DateTime<Utc>>,
) -> ColonyResult<Vec<StreamEvent>> {
    let type_str = event_type_str(event_type);
    let mut stmt = match since {
        Some(_) => conn.prepare(
            "SELECT * FROM events WHERE event_type=?1 AND created_at > ?2 ORDER BY seq ASC",
        )?,
        None => conn.prepare("SELECT * FROM events WHERE event_type=?1 ORDER BY seq ASC")?,
    };
    let rows = match since {
        Some(since) => stmt.query_map(params![type_str, since.to_rfc3339()], event_from_row)?,
        None => stmt.query_map(params![type_str], event_from_row)?,
    };
    rows.collect::<Result<_, _>>().map_err(ColonyError::from)
}

pub fn all_events_ordered(conn: &Connection) -> ColonyResult<Vec<StreamEvent>> {
    let mut stmt = conn.prepare("SELECT * FROM events ORDER BY seq ASC")?;
    let rows = stmt.query_map([], event_from_row)?;
    rows.collect::<Result<_, _>>().map_err(ColonyError::from)
}

pub fn set_event_compacted(conn: &Connection, id: &str, compacted_to: &str) -> ColonyResult<()> {
    conn.execute(
        "UPDATE events SET compacted_to=?2 WHERE id=?1",
        params![id, compacted_to],
    )?;
    Ok(())
}

pub fn prune_events_older_than(conn: &Connection, older_than: DateTime<Utc>) -> ColonyResult<usize> {
    let n = conn.execute(
        "DELETE FROM events WHERE created_at < ?1",
        params![older_than.to_rfc3339()],
    )?;
    Ok(n)
}

/// Hard-deletes exactly the given event ids, for compression stages that
/// have already computed a precise retained-window boundary rather than a
/// single cutoff timestamp.
pub fn delete_events_by_ids(conn: &Connection, ids: &[String]) -> ColonyResult<usize> {
    let mut deleted = 0usize;
    for id in ids {
        deleted += conn.execute("DELETE FROM events WHERE id=?1", params![id])?;
    }
    Ok(deleted)
}

fn knowledge_category_str(c: KnowledgeCategory) -> &'static str {
    match c {
        KnowledgeCategory::Market => "market",
        KnowledgeCategory::Technical => "technical",
        KnowledgeCategory::Social => "social",
        KnowledgeCategory::Financial => "financial",
        KnowledgeCategory::Operational => "operational",
    }
}

fn knowledge_category_from(s: &str) -> KnowledgeCategory {
    match s {
        "technical" => KnowledgeCategory::Technical,
        "social" => KnowledgeCategory::Social,
        "financial" => KnowledgeCategory::Financial,
        "operational" => KnowledgeCategory::Operational,
        _ => KnowledgeCategory::Market,
    }
}

fn knowledge_from_row(row: &Row) -> rusqlite::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get("id")?,
        category: knowledge_category_from(&row.get::<_, String>("category")?),
        key: row.get("key")?,
        content: row.get("content")?,
        confidence: row.get("confidence")?,
        source: row.get("source")?,
        access_count: row.get::<_, i64>("access_count")? as u32,
        token_count: row.get::<_, i64>("token_count")? as u32,
        created_at: parse_dt(row, "created_at")?.unwrap_or_else(Utc::now),
        last_verified: parse_dt(row, "last_verified")?.unwrap_or_else(Utc::now),
        expires_at: parse_dt(row, "expires_at")?,
    })
}

pub fn insert_knowledge(conn: &Connection, entry: &KnowledgeEntry) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO knowledge (id, category, key, content, confidence, source, access_count,
            token_count, created_at, last_verified, expires_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            entry.id,
            knowledge_category_str(entry.category),
            entry.key,
            entry.content,
            entry.confidence,
            entry.source,
            entry.access_count as i64,
            entry.token_count as i64,
            entry.created_at.to_rfc3339(),
            entry.last_verified.to_rfc3339(),
            entry.expires_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn list_knowledge_by_category(
    conn: &Connection,
    category: KnowledgeCategory,
    limit: usize,
) -> ColonyResult<Vec<KnowledgeEntry>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM knowledge WHERE category=?1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![knowledge_category_str(category), limit as i64],
        knowledge_from_row,
    )?;
    rows.collect::<Result<_, _>>().map_err(ColonyError::from)
}

fn inbox_status_str(s: InboxMessageStatus) -> &'static str {
    match s {
        InboxMessageStatus::Received => "received",
        InboxMessageStatus::InProgress => "in_progress",
        InboxMessageStatus::Processed => "processed",
        InboxMessageStatus::Failed => "failed",
    }
}

fn inbox_status_from(s: &str) -> InboxMessageStatus {
    match s {
        "in_progress" => InboxMessageStatus::InProgress,
        "processed" => InboxMessageStatus::Processed,
        "failed" => InboxMessageStatus::Failed,
        _ => InboxMessageStatus::Received,
    }
}

fn inbox_from_row(row: &Row) -> rusqlite::Result<InboxMessage> {
    Ok(InboxMessage {
        id: row.get("id")?,
        from: row.get("from_address")?,
        to: row.get("to_address")?,
        content: row.get("content")?,
        status: inbox_status_from(&row.get::<_, String>("status")?),
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        received_at: parse_dt(row, "received_at")?.unwrap_or_else(Utc::now),
        processed_at: parse_dt(row, "processed_at")?,
    })
}

pub fn insert_inbox_message(conn: &Connection, msg: &InboxMessage) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO inbox (id, from_address, to_address, content, status, retry_count,
            max_retries, received_at, processed_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        params![
            msg.id,
            msg.from,
            msg.to,
            msg.content,
            inbox_status_str(msg.status),
            msg.retry_count as i64,
            msg.max_retries as i64,
            msg.received_at.to_rfc3339(),
            msg.processed_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn update_inbox_message(conn: &Connection, msg: &InboxMessage) -> ColonyResult<()> {
    conn.execute(
        "UPDATE inbox SET status=?2, retry_count=?3, processed_at=?4 WHERE id=?1",
        params![
            msg.id,
            inbox_status_str(msg.status),
            msg.retry_count as i64,
            msg.processed_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Atomically claims up to `n` `received` messages addressed to `to` in
/// FIFO order by `received_at`, transitioning them to `in_progress`.
pub fn claim_inbox_messages(conn: &Connection, to: &str, n: usize) -> ColonyResult<Vec<InboxMessage>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM inbox WHERE to_address=?1 AND status='received'
             ORDER BY received_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to, n as i64], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for id in &ids {
        conn.execute(
            "UPDATE inbox SET status='in_progress' WHERE id=?1",
            params![id],
        )?;
    }
    let mut claimed = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(msg) = conn
            .query_row("SELECT * FROM inbox WHERE id=?1", params![id], inbox_from_row)
            .optional()?
        {
            claimed.push(msg);
        }
    }
    Ok(claimed)
}

pub fn get_inbox_message(conn: &Connection, id: &str) -> ColonyResult<Option<InboxMessage>> {
    conn.query_row("SELECT * FROM inbox WHERE id=?1", params![id], inbox_from_row)
        .optional()
        .map_err(ColonyError::from)
}

fn agent_status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Idle => "idle",
        AgentStatus::Busy => "busy",
        AgentStatus::Dead => "dead",
    }
}

fn agent_status_from(s: &str) -> AgentStatus {
    match s {
        "busy" => AgentStatus::Busy,
        "dead" => AgentStatus::Dead,
        _ => AgentStatus::Idle,
    }
}

fn agent_from_row(row: &Row) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        address: row.get("address")?,
        role: row.get("role")?,
        status: agent_status_from(&row.get::<_, String>("status")?),
        spawned_for_task_id: row.get("spawned_for_task_id")?,
        last_seen_at: parse_dt(row, "last_seen_at")?.unwrap_or_else(Utc::now),
    })
}

pub fn upsert_agent(conn: &Connection, agent: &AgentRecord) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO agents (address, role, status, spawned_for_task_id, last_seen_at)
         VALUES (?1,?2,?3,?4,?5)
         ON CONFLICT(address) DO UPDATE SET
            role=excluded.role, status=excluded.status,
            spawned_for_task_id=excluded.spawned_for_task_id, last_seen_at=excluded.last_seen_at",
        params![
            agent.address,
            agent.role,
            agent_status_str(agent.status),
            agent.spawned_for_task_id,
            agent.last_seen_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_idle_agent_for_role(conn: &Connection, role: &str) -> ColonyResult<Option<AgentRecord>> {
    conn.query_row(
        "SELECT * FROM agents WHERE role=?1 AND status='idle' ORDER BY last_seen_at ASC LIMIT 1",
        params![role],
        agent_from_row,
    )
    .optional()
    .map_err(ColonyError::from)
}

pub fn get_any_idle_agent(conn: &Connection) -> ColonyResult<Option<AgentRecord>> {
    conn.query_row(
        "SELECT * FROM agents WHERE status='idle' ORDER BY last_seen_at ASC LIMIT 1",
        [],
        agent_from_row,
    )
    .optional()
    .map_err(ColonyError::from)
}

pub fn get_any_busy_agent(conn: &Connection) -> ColonyResult<Option<AgentRecord>> {
    conn.query_row(
        "SELECT * FROM agents WHERE status='busy' ORDER BY last_seen_at ASC LIMIT 1",
        [],
        agent_from_row,
    )
    .optional()
    .map_err(ColonyError::from)
}

pub fn kv_get(conn: &Connection, key: &str) -> ColonyResult<Option<String>> {
    conn.query_row("SELECT value FROM kv WHERE key=?1", params![key], |row| row.get(0))
        .optional()
        .map_err(ColonyError::from)
}

pub fn kv_set(conn: &Connection, key: &str, value: &str) -> ColonyResult<()> {
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
