mod cycles;

pub use cycles::detect_cycles;

use chrono::{DateTime, Utc};
use colony_store::{rows, Store};
use colony_types::*;
use std::collections::{HashMap, HashSet};

/// Input to `decompose_goal`. Dependencies are aliases resolved against the
/// rest of the batch and the goal's already-persisted tasks — see
/// `resolve_alias` for the accepted forms.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    pub agent_role: String,
    pub priority: u8,
    pub dependencies: Vec<String>,
    pub estimated_cost_cents: i64,
    pub max_retries: u32,
    pub timeout_ms: u64,
    /// A caller-requested initial status. `assigned`/`running` and
    /// `completed`/`failed`/`cancelled` always win outright; any other
    /// value (including `None`) falls back to the dependency-derived
    /// `pending`/`blocked` default.
    pub requested_status: Option<TaskStatus>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            agent_role: "generalist".to_string(),
            priority: 50,
            dependencies: Vec::new(),
            estimated_cost_cents: 0,
            max_retries: 3,
            timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            requested_status: None,
        }
    }
}

pub async fn create_goal(store: &Store, goal: Goal) -> ColonyResult<()> {
    store.run_transaction(|tx| rows::insert_goal(tx, &goal)).await
}

/// Resolves one dependency alias against the new batch's ids (by position)
/// and titles, or against an already-persisted task id in the same goal.
/// Title resolution is disabled for any title that repeats within the
/// batch, since the alias would be ambiguous.
fn resolve_alias(
    alias: &str,
    existing_ids: &HashSet<String>,
    batch_ids: &[String],
    batch_titles: &[String],
    unique_titles: &HashSet<String>,
) -> ColonyResult<String> {
    if existing_ids.contains(alias) {
        return Ok(alias.to_string());
    }
    if let Ok(idx) = alias.parse::<usize>() {
        if let Some(id) = batch_ids.get(idx) {
            return Ok(id.clone());
        }
    }
    if let Some(rest) = alias.strip_prefix('#') {
        if let Ok(idx) = rest.parse::<usize>() {
            if let Some(id) = batch_ids.get(idx) {
                return Ok(id.clone());
            }
        }
    }
    if let Some(rest) = alias.strip_prefix("task-") {
        if let Ok(n) = rest.parse::<usize>() {
            if n >= 1 {
                if let Some(id) = batch_ids.get(n - 1) {
                    return Ok(id.clone());
                }
            }
        }
    }
    if unique_titles.contains(alias) {
        if let Some(pos) = batch_titles.iter().position(|t| t == alias) {
            return Ok(batch_ids[pos].clone());
        }
    }
    Err(ColonyError::InvalidInput(format!(
        "unresolved task dependency alias: {alias}"
    )))
}

/// Inserts `specs` as new tasks under `goal_id`, resolving dependency
/// aliases in two passes (allocate ids, then resolve references against
/// the allocated ids and already-persisted tasks) and rejecting the whole
/// batch if the combined dependency graph contains a cycle.
pub async fn decompose_goal(
    store: &Store,
    goal_id: &str,
    specs: Vec<TaskSpec>,
) -> ColonyResult<Vec<Task>> {
    store
        .run_transaction(|tx| {
            let existing = rows::list_tasks_by_goal(tx, goal_id)?;
            let existing_ids: HashSet<String> = existing.iter().map(|t| t.id.clone()).collect();
            let completed: HashSet<String> = existing
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.id.clone())
                .collect();

            let mut title_counts: HashMap<String, usize> = HashMap::new();
            for s in &specs {
                *title_counts.entry(s.title.clone()).or_insert(0) += 1;
            }
            let unique_titles: HashSet<String> = title_counts
                .into_iter()
                .filter(|(_, n)| *n == 1)
                .map(|(t, _)| t)
                .collect();

            let batch_ids: Vec<String> = specs.iter().map(|_| new_id()).collect();
            let batch_titles: Vec<String> = specs.iter().map(|s| s.title.clone()).collect();

            let mut resolved_deps: Vec<Vec<String>> = Vec::with_capacity(specs.len());
            for spec in &specs {
                let mut deps = Vec::with_capacity(spec.dependencies.len());
                for alias in &spec.dependencies {
                    deps.push(resolve_alias(
                        alias,
                        &existing_ids,
                        &batch_ids,
                        &batch_titles,
                        &unique_titles,
                    )?);
                }
                resolved_deps.push(deps);
            }

            let mut graph: HashMap<String, Vec<String>> = HashMap::new();
            for t in &existing {
                let mut deps = t.dependencies.clone();
                if let Some(p) = &t.parent_id {
                    deps.push(p.clone());
                }
                graph.insert(t.id.clone(), deps);
            }
            for (i, id) in batch_ids.iter().enumerate() {
                graph.insert(id.clone(), resolved_deps[i].clone());
            }
            detect_cycles(&graph)?;

            let now = Utc::now();
            let mut created = Vec::with_capacity(specs.len());
            for (i, spec) in specs.into_iter().enumerate() {
                let deps = resolved_deps[i].clone();
                let status = match spec.requested_status {
                    Some(
                        s @ (TaskStatus::Assigned
                        | TaskStatus::Running
                        | TaskStatus::Completed
                        | TaskStatus::Failed
                        | TaskStatus::Cancelled),
                    ) => s,
                    _ => {
                        if deps.iter().all(|d| completed.contains(d)) {
                            TaskStatus::Pending
                        } else {
                            TaskStatus::Blocked
                        }
                    }
                };
                let started_at = matches!(
                    status,
                    TaskStatus::Assigned
                        | TaskStatus::Running
                        | TaskStatus::Completed
                        | TaskStatus::Failed
                        | TaskStatus::Cancelled
                )
                .then_some(now);
                let completed_at = status.is_terminal().then_some(now);
                let task = Task {
                    id: batch_ids[i].clone(),
                    goal_id: goal_id.to_string(),
                    parent_id: None,
                    title: spec.title,
                    description: spec.description,
                    status,
                    assigned_to: None,
                    agent_role: spec.agent_role,
                    priority: spec.priority,
                    dependencies: deps,
                    result: None,
                    estimated_cost_cents: spec.estimated_cost_cents,
                    actual_cost_cents: 0,
                    max_retries: spec.max_retries,
                    retry_count: 0,
                    timeout_ms: spec.timeout_ms,
                    created_at: now,
                    started_at,
                    completed_at,
                };
                rows::insert_task(tx, &task)?;
                created.push(task);
            }
            Ok(created)
        })
        .await
}

pub async fn get_ready_tasks(store: &Store, goal_id: &str) -> ColonyResult<Vec<Task>> {
    store.get_ready_tasks(goal_id).await
}

pub async fn assign_task(store: &Store, task_id: &str, assigned_to: &str) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let mut task = rows::get_task(tx, task_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("task {task_id}")))?;
            if task.status != TaskStatus::Pending {
                return Err(ColonyError::InvalidState(format!(
                    "cannot assign task {task_id} in status {:?}",
                    task.status
                )));
            }
            task.status = TaskStatus::Assigned;
            task.assigned_to = Some(assigned_to.to_string());
            task.started_at = Some(Utc::now());
            rows::update_task(tx, &task)
        })
        .await
}

/// Marks a task `running`. Not in the distilled interface list but needed
/// so a worker can report "I picked this up" before it finishes, matching
/// the `running` status the data model defines.
pub async fn mark_task_running(store: &Store, task_id: &str) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let mut task = rows::get_task(tx, task_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("task {task_id}")))?;
            task.status = TaskStatus::Running;
            rows::update_task(tx, &task)
        })
        .await
}

pub async fn complete_task(store: &Store, task_id: &str, result: TaskResult) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let mut task = rows::get_task(tx, task_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("task {task_id}")))?;
            if task.status.is_terminal() {
                return Err(ColonyError::InvalidState(format!(
                    "task {task_id} already terminal"
                )));
            }
            task.actual_cost_cents = result.cost_cents;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.result = Some(result);
            rows::update_task(tx, &task)?;
            update_blocked_tasks(tx, &task.goal_id)?;
            refresh_goal(tx, &task.goal_id)
        })
        .await
}

/// `failTask(id, error, shouldRetry)`. Terminal tasks raise `InvalidState`.
/// A retryable failure stays within the task (status recomputed from live
/// dependency state); an exhausted failure marks the task permanently
/// failed and blocks every downstream task that depended on it, then
/// refreshes the goal — all inside the one transaction.
pub async fn fail_task(
    store: &Store,
    task_id: &str,
    error: &str,
    should_retry: bool,
) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let mut task = rows::get_task(tx, task_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("task {task_id}")))?;
            if task.status.is_terminal() {
                return Err(ColonyError::InvalidState(format!(
                    "task {task_id} already terminal"
                )));
            }

            let failure_result = TaskResult {
                success: false,
                output: error.to_string(),
                artifacts: Vec::new(),
                cost_cents: task.actual_cost_cents,
                duration_ms: 0,
            };

            if should_retry && task.can_retry() {
                task.retry_count += 1;
                task.assigned_to = None;
                task.started_at = None;
                task.completed_at = None;
                task.result = Some(failure_result);

                let siblings = rows::list_tasks_by_goal(tx, &task.goal_id)?;
                let completed: HashSet<&str> = siblings
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .map(|t| t.id.as_str())
                    .collect();
                task.status = if task.dependencies.iter().all(|d| completed.contains(d.as_str())) {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Blocked
                };
                rows::update_task(tx, &task)
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.result = Some(failure_result);
                rows::update_task(tx, &task)?;

                let siblings = rows::list_tasks_by_goal(tx, &task.goal_id)?;
                for mut sibling in siblings {
                    if sibling.id == task.id {
                        continue;
                    }
                    let downstream = matches!(
                        sibling.status,
                        TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running
                    ) && sibling.dependencies.contains(&task.id);
                    if downstream {
                        sibling.status = TaskStatus::Blocked;
                        rows::update_task(tx, &sibling)?;
                    }
                }
                refresh_goal(tx, &task.goal_id)
            }
        })
        .await
}

/// Promotes every `blocked` task whose dependencies are all `completed` to
/// `pending`. The sole mechanism by which `blocked -> pending` happens;
/// must run in the same transaction as the status change that triggered
/// the need for it.
pub fn update_blocked_tasks(tx: &rusqlite::Transaction, goal_id: &str) -> ColonyResult<()> {
    let tasks = rows::list_tasks_by_goal(tx, goal_id)?;
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    for mut task in tasks {
        if task.status != TaskStatus::Blocked {
            continue;
        }
        if task.dependencies.iter().all(|d| completed.contains(d.as_str())) {
            task.status = TaskStatus::Pending;
            rows::update_task(tx, &task)?;
        }
    }
    Ok(())
}

/// Reduction of task statuses into the goal's status. Paused goals are
/// left untouched.
fn refresh_goal(tx: &rusqlite::Transaction, goal_id: &str) -> ColonyResult<()> {
    let Some(mut goal) = rows::get_goal(tx, goal_id)? else {
        return Ok(());
    };
    if goal.status == GoalStatus::Paused {
        return Ok(());
    }

    let tasks = rows::list_tasks_by_goal(tx, goal_id)?;
    let new_status = if tasks.is_empty() {
        GoalStatus::Active
    } else if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
        GoalStatus::Failed
    } else if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        GoalStatus::Completed
    } else {
        GoalStatus::Active
    };

    if new_status != goal.status {
        goal.status = new_status.clone();
        if new_status == GoalStatus::Completed {
            goal.completed_at = Some(Utc::now());
        }
        rows::update_goal(tx, &goal)?;
    }
    Ok(())
}

pub async fn get_goal_progress(store: &Store, goal_id: &str) -> ColonyResult<TaskProgress> {
    let tasks = store.get_tasks_by_goal(goal_id).await?;
    let mut progress = TaskProgress {
        total: tasks.len() as u32,
        pending: 0,
        assigned: 0,
        running: 0,
        blocked: 0,
        completed: 0,
        failed: 0,
        cancelled: 0,
    };
    for task in &tasks {
        match task.status {
            TaskStatus::Pending => progress.pending += 1,
            TaskStatus::Assigned => progress.assigned += 1,
            TaskStatus::Running => progress.running += 1,
            TaskStatus::Blocked => progress.blocked += 1,
            TaskStatus::Completed => progress.completed += 1,
            TaskStatus::Failed => progress.failed += 1,
            TaskStatus::Cancelled => progress.cancelled += 1,
        }
    }
    Ok(progress)
}

pub async fn prune_completed_goals(store: &Store, older_than: DateTime<Utc>) -> ColonyResult<usize> {
    store
        .run_transaction(|tx| {
            let goals = rows::list_active_goals(tx)?; // active goals never match; re-query all below
            drop(goals);
            let mut stmt = tx.prepare(
                "SELECT id FROM goals WHERE status='completed' AND completed_at < ?1",
            )?;
            let ids: Vec<String> = stmt
                .query_map(rusqlite::params![older_than.to_rfc3339()], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);
            for id in &ids {
                tx.execute("DELETE FROM tasks WHERE goal_id=?1", rusqlite::params![id])?;
                tx.execute("DELETE FROM goals WHERE id=?1", rusqlite::params![id])?;
            }
            Ok(ids.len())
        })
        .await
}

/// Moves a `failed` goal back to `active` so replanning has somewhere to
/// land. Any other goal status is left untouched — reactivating a goal
/// that already completed or is merely paused would be a mistake, not a
/// retry.
pub async fn reactivate_goal(store: &Store, goal_id: &str) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let mut goal = rows::get_goal(tx, goal_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("goal {goal_id}")))?;
            if goal.status == GoalStatus::Failed {
                goal.status = GoalStatus::Active;
                goal.completed_at = None;
                rows::update_goal(tx, &goal)?;
            }
            Ok(())
        })
        .await
}

/// Resets every `failed` or `blocked` task under a goal back to `pending`
/// (dependencies permitting) or `blocked`, clearing the terminal failure so
/// a freshly generated plan can pick the work back up. Used by the
/// orchestrator's replanning step; never touches completed work.
pub async fn reset_failed_and_blocked(store: &Store, goal_id: &str) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let tasks = rows::list_tasks_by_goal(tx, goal_id)?;
            let completed: HashSet<String> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.id.clone())
                .collect();
            for mut task in tasks {
                if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
                    continue;
                }
                task.status = if task.dependencies.iter().all(|d| completed.contains(d)) {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Blocked
                };
                task.retry_count = 0;
                task.assigned_to = None;
                task.started_at = None;
                task.completed_at = None;
                rows::update_task(tx, &task)?;
            }
            refresh_goal(tx, goal_id)
        })
        .await
}

/// Forces a goal to `failed` regardless of its current task mix. Used when
/// the orchestrator's own tick catches an unexpected error and must record
/// the goal as down rather than leave it in whatever phase it was mid-step.
pub async fn mark_goal_failed(store: &Store, goal_id: &str) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let Some(mut goal) = rows::get_goal(tx, goal_id)? else {
                return Ok(());
            };
            if goal.status != GoalStatus::Failed {
                goal.status = GoalStatus::Failed;
                rows::update_goal(tx, &goal)?;
            }
            Ok(())
        })
        .await
}

/// Resets a single non-terminal task to `pending`, clearing assignment.
/// Used when a worker is declared dead and its in-flight task must be
/// handed to someone else without counting against its retry budget.
pub async fn reset_to_pending(store: &Store, task_id: &str) -> ColonyResult<()> {
    store
        .run_transaction(|tx| {
            let mut task = rows::get_task(tx, task_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("task {task_id}")))?;
            if task.status.is_terminal() {
                return Err(ColonyError::InvalidState(format!(
                    "cannot reset terminal task {task_id} to pending"
                )));
            }
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.started_at = None;
            rows::update_task(tx, &task)
        })
        .await
}
