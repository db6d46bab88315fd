use chrono::{DateTime, Utc};
use colony_types::{ColonyResult, StreamEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A persisted snapshot written by stage 4 (`checkpoint_and_reset`) before
/// the retained window's prefix is compacted away. Reconstructs enough of
/// an agent's working memory — what it was doing, what it had decided,
/// where money stood — that a rehydrated agent does not start from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub agent_address: String,
    pub summary: String,
    pub summary_tokens: u32,
    pub active_goal_ids: Vec<String>,
    pub active_task_ids: Vec<String>,
    pub key_decisions: Vec<String>,
    pub financial_state: Vec<String>,
    pub turn_count: u64,
    pub tokens_saved: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

/// Walks an agent's full event history and derives the task/goal ids still
/// "live": a `task_assigned` event adds its task (and goal) id, a
/// `task_completed`/`task_failed` event removes it.
pub fn derive_active_ids(events: &[StreamEvent]) -> (Vec<String>, Vec<String>) {
    use colony_types::StreamEventType;
    use std::collections::BTreeSet;

    let mut active_tasks: BTreeSet<String> = BTreeSet::new();
    let mut active_goals: BTreeSet<String> = BTreeSet::new();

    for event in events {
        match event.event_type {
            StreamEventType::TaskAssigned => {
                if let Some(task_id) = &event.task_id {
                    active_tasks.insert(task_id.clone());
                }
                if let Some(goal_id) = &event.goal_id {
                    active_goals.insert(goal_id.clone());
                }
            }
            StreamEventType::TaskCompleted | StreamEventType::TaskFailed => {
                if let Some(task_id) = &event.task_id {
                    active_tasks.remove(task_id);
                }
            }
            _ => {}
        }
    }

    (active_goals.into_iter().collect(), active_tasks.into_iter().collect())
}

/// Pulls content from events whose type and wording suggest a decision was
/// made, most recent first, capped at `limit`.
pub fn derive_key_decisions(events: &[StreamEvent], limit: usize) -> Vec<String> {
    use colony_types::StreamEventType;

    const MARKERS: &[&str] = &["decided", "decision", "chose", "selecting", "will proceed"];

    events
        .iter()
        .rev()
        .filter(|e| {
            matches!(
                e.event_type,
                StreamEventType::PlanUpdated
                    | StreamEventType::Action
                    | StreamEventType::Reflection
                    | StreamEventType::Inference
            )
        })
        .filter(|e| {
            let lower = e.content.to_lowercase();
            MARKERS.iter().any(|m| lower.contains(m))
        })
        .take(limit)
        .map(|e| e.content.clone())
        .collect()
}

/// Writes the checkpoint to `<workspace>/checkpoints/<id>.json` using the
/// temp-file-then-rename idiom: a crash mid-write leaves at most a stray
/// `.tmp` file, never a half-written checkpoint at its real path.
pub async fn write_checkpoint(workspace: &Path, checkpoint: &Checkpoint) -> ColonyResult<PathBuf> {
    let dir = workspace.join("checkpoints");
    tokio::fs::create_dir_all(&dir).await?;
    let final_path = dir.join(format!("{}.json", checkpoint.id));
    let tmp_path = dir.join(format!("{}.json.tmp", checkpoint.id));

    let body = serde_json::to_vec_pretty(checkpoint)?;
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_types::{new_id, StreamEventType};

    fn evt(event_type: StreamEventType, task_id: Option<&str>, goal_id: Option<&str>, content: &str) -> StreamEvent {
        StreamEvent {
            id: new_id(),
            event_type,
            agent_address: "agent-1".into(),
            goal_id: goal_id.map(String::from),
            task_id: task_id.map(String::from),
            content: content.into(),
            token_count: 4,
            compacted_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn derive_active_ids_tracks_assignment_and_completion() {
        let events = vec![
            evt(StreamEventType::TaskAssigned, Some("t1"), Some("g1"), "assigned t1"),
            evt(StreamEventType::TaskAssigned, Some("t2"), Some("g1"), "assigned t2"),
            evt(StreamEventType::TaskCompleted, Some("t1"), Some("g1"), "t1 done"),
        ];
        let (goals, tasks) = derive_active_ids(&events);
        assert_eq!(goals, vec!["g1".to_string()]);
        assert_eq!(tasks, vec!["t2".to_string()]);
    }

    #[test]
    fn derive_key_decisions_filters_by_marker_words() {
        let events = vec![
            evt(StreamEventType::Reflection, None, None, "nothing notable happened"),
            evt(StreamEventType::PlanUpdated, None, None, "decided to split the deploy task"),
        ];
        let decisions = derive_key_decisions(&events, 5);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].contains("decided"));
    }

    #[tokio::test]
    async fn write_checkpoint_lands_at_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint {
            id: "cp-1".into(),
            agent_address: "agent-1".into(),
            summary: "summary".into(),
            summary_tokens: 2,
            active_goal_ids: vec![],
            active_task_ids: vec![],
            key_decisions: vec![],
            financial_state: vec![],
            turn_count: 0,
            tokens_saved: 0,
            created_at: Utc::now(),
            file_path: None,
        };
        let path = write_checkpoint(dir.path(), &checkpoint).await.unwrap();
        assert!(path.exists());
        assert_eq!(path, dir.path().join("checkpoints").join("cp-1.json"));
    }
}
