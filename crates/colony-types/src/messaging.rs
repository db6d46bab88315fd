use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    StatusReport,
    ResourceRequest,
    KnowledgeShare,
    CustomerRequest,
    Alert,
    ShutdownRequest,
    PeerQuery,
    PeerResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub content: serde_json::Value,
    pub priority: MessagePriority,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub const COLONY_MESSAGE_PROTOCOL: &str = "colony_message_v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub protocol: String,
    pub sent_at: DateTime<Utc>,
    pub message: MessageEnvelope,
}

/// Worker task assignment payload — the `content` of a `task_assignment`
/// envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskAssignment {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub agent_role: String,
    pub dependencies: Vec<String>,
    pub timeout_ms: u64,
}

/// Worker task result payload — the `content` of a `task_result` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub cost_cents: i64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
