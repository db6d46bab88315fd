use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub status: GoalStatus,
    pub expected_revenue_cents: i64,
    pub actual_revenue_cents: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub cost_cents: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub agent_role: String,
    pub priority: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub estimated_cost_cents: i64,
    pub actual_cost_cents: i64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    UserInput,
    PlanCreated,
    PlanUpdated,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    Action,
    Observation,
    Inference,
    Financial,
    AgentSpawned,
    AgentDied,
    Knowledge,
    MarketSignal,
    Revenue,
    Error,
    Reflection,
    Compression,
    CompressionError,
    CompressionWarning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub agent_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub content: String,
    pub token_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `ceil(len(content) / 3.5)`, used uniformly everywhere a token count is
/// needed so compression thresholds stay self-consistent across crates.
pub fn estimate_tokens(content: &str) -> u32 {
    let len = content.len() as f64;
    (len / 3.5).ceil() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    Market,
    Technical,
    Social,
    Financial,
    Operational,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub category: KnowledgeCategory,
    pub key: String,
    pub content: String,
    pub confidence: f32,
    pub source: String,
    pub access_count: u32,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxMessageStatus {
    Received,
    InProgress,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub status: InboxMessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Classifying,
    Planning,
    PlanReview,
    Executing,
    Replanning,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub plan_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_file_path: Option<String>,
    #[serde(default)]
    pub spawned_agent_ids: Vec<String>,
    pub replans_remaining: u32,
    pub phase_entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_error: Option<String>,
}

impl ExecutionState {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            goal_id: None,
            plan_id: None,
            plan_version: 0,
            plan_file_path: None,
            spawned_agent_ids: Vec::new(),
            replans_remaining: 0,
            phase_entered_at: Utc::now(),
            failed_task_id: None,
            failed_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Dead,
}

/// Not part of the distilled data model — `matchTaskToAgent` needs a live
/// roster to pick an idle agent from, so the Store carries one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub address: String,
    pub role: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_for_task_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: u32,
    pub pending: u32,
    pub assigned: u32,
    pub running: u32,
    pub blocked: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl TaskProgress {
    pub fn completion_percentage(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f32 / self.total as f32) * 100.0
    }

    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }

    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_matches_spec_formula() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(7)), 2);
        assert_eq!(estimate_tokens(&"a".repeat(350)), 100);
    }

    #[test]
    fn progress_percentage_handles_empty() {
        let progress = TaskProgress {
            total: 0,
            pending: 0,
            assigned: 0,
            running: 0,
            blocked: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        assert_eq!(progress.completion_percentage(), 0.0);
        assert!(!progress.all_completed());
    }
}
