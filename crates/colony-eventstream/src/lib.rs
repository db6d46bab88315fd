use chrono::{DateTime, Utc};
use colony_store::{rows, Store};
use colony_types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    Reference,
    Summarize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOutcome {
    pub count: usize,
    pub tokens_saved: u64,
}

/// Ratio of tokens an agent currently has live in its event stream to the
/// size of its context window. The compression engine's `evaluate` is
/// keyed entirely off `utilization_percent`.
#[derive(Debug, Clone, Copy)]
pub struct Utilization {
    pub total_tokens: u64,
    pub window_tokens: u64,
    pub utilization_percent: f64,
}

/// Append-only view over the Store's events table.
pub struct EventStream<'a> {
    store: &'a Store,
}

impl<'a> EventStream<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Assigns an id and `createdAt`, fills `tokenCount` from content
    /// length if zero, and appends. Returns the assigned id.
    pub async fn append(&self, mut event: StreamEvent) -> ColonyResult<String> {
        if event.id.is_empty() {
            event.id = new_id();
        }
        if event.token_count == 0 {
            event.token_count = estimate_tokens(&event.content);
        }
        let id = event.id.clone();
        self.store
            .run_transaction(|tx| {
                let seq = rows::next_seq(tx)?;
                rows::append_event(tx, &event, seq)
            })
            .await?;
        Ok(id)
    }

    pub async fn get_recent(&self, agent: &str, limit: usize) -> ColonyResult<Vec<StreamEvent>> {
        self.store.get_recent_events(agent, limit).await
    }

    pub async fn get_by_goal(&self, goal_id: &str) -> ColonyResult<Vec<StreamEvent>> {
        self.store.get_events_by_goal(goal_id).await
    }

    pub async fn get_by_type(
        &self,
        event_type: StreamEventType,
        since: Option<DateTime<Utc>>,
    ) -> ColonyResult<Vec<StreamEvent>> {
        self.store.get_events_by_type(event_type, since).await
    }

    /// Every event for `agent`, oldest first. Capped at a generous limit
    /// since SQLite's `LIMIT` wants a finite bound; no agent in practice
    /// keeps this many turns live before compression kicks in.
    pub async fn all_for_agent(&self, agent: &str) -> ColonyResult<Vec<StreamEvent>> {
        self.store.get_recent_events(agent, 1_000_000).await
    }

    /// Sums token counts across every live (non-pruned) event belonging to
    /// `agent` and expresses it as a percentage of `window_tokens`.
    pub async fn current_utilization(
        &self,
        agent: &str,
        window_tokens: u64,
    ) -> ColonyResult<Utilization> {
        let events = self.all_for_agent(agent).await?;
        let total_tokens: u64 = events.iter().map(|e| e.token_count as u64).sum();
        let utilization_percent = if window_tokens == 0 {
            0.0
        } else {
            (total_tokens as f64 / window_tokens as f64) * 100.0
        };
        Ok(Utilization {
            total_tokens,
            window_tokens,
            utilization_percent,
        })
    }

    /// Rewrites the body of every event older than `older_than` with
    /// `compacted_to` still unset, replacing it with either a stable
    /// reference or a short heuristic summary. The event's id, type and
    /// timestamp are untouched — only its textual body shrinks.
    pub async fn compact(
        &self,
        older_than: DateTime<Utc>,
        strategy: CompactionStrategy,
    ) -> ColonyResult<CompactionOutcome> {
        self.store
            .run_transaction(|tx| {
                let events = rows::all_events_ordered(tx)?;
                let mut count = 0usize;
                let mut tokens_saved = 0u64;
                for event in events {
                    if event.created_at >= older_than || event.compacted_to.is_some() {
                        continue;
                    }
                    let compacted = match strategy {
                        CompactionStrategy::Reference => format!(
                            "ref:{}:{}:{}",
                            &event.id[..event.id.len().min(8)],
                            event_type_tag(event.event_type),
                            event.created_at.to_rfc3339(),
                        ),
                        CompactionStrategy::Summarize => {
                            let normalized: String = event
                                .content
                                .split_whitespace()
                                .collect::<Vec<_>>()
                                .join(" ")
                                .chars()
                                .take(96)
                                .collect();
                            format!("summary:{}:{}", event_type_tag(event.event_type), normalized)
                        }
                    };
                    let original_tokens = estimate_tokens(&event.content) as u64;
                    let new_tokens = estimate_tokens(&compacted) as u64;
                    tokens_saved += original_tokens.saturating_sub(new_tokens);
                    rows::set_event_compacted(tx, &event.id, &compacted)?;
                    count += 1;
                }
                Ok(CompactionOutcome { count, tokens_saved })
            })
            .await
    }

    /// Hard-deletes every event strictly older than `older_than`.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> ColonyResult<usize> {
        self.store
            .run_transaction(|tx| rows::prune_events_older_than(tx, older_than))
            .await
    }

    /// Same rewrite `compact` performs, but scoped to exactly the given ids
    /// rather than a timestamp cutoff. The compression engine computes a
    /// precise retained-window boundary (so it can preserve tool-call
    /// pairs) and hands back the ids it decided to collapse.
    pub async fn compact_ids(
        &self,
        ids: &[String],
        strategy: CompactionStrategy,
    ) -> ColonyResult<CompactionOutcome> {
        if ids.is_empty() {
            return Ok(CompactionOutcome::default());
        }
        self.store
            .run_transaction(|tx| {
                let events = rows::all_events_ordered(tx)?;
                let wanted: std::collections::HashSet<&str> =
                    ids.iter().map(|s| s.as_str()).collect();
                let mut count = 0usize;
                let mut tokens_saved = 0u64;
                for event in events {
                    if !wanted.contains(event.id.as_str()) || event.compacted_to.is_some() {
                        continue;
                    }
                    let compacted = match strategy {
                        CompactionStrategy::Reference => format!(
                            "ref:{}:{}:{}",
                            &event.id[..event.id.len().min(8)],
                            event_type_tag(event.event_type),
                            event.created_at.to_rfc3339(),
                        ),
                        CompactionStrategy::Summarize => {
                            let normalized: String = event
                                .content
                                .split_whitespace()
                                .collect::<Vec<_>>()
                                .join(" ")
                                .chars()
                                .take(96)
                                .collect();
                            format!("summary:{}:{}", event_type_tag(event.event_type), normalized)
                        }
                    };
                    let original_tokens = estimate_tokens(&event.content) as u64;
                    let new_tokens = estimate_tokens(&compacted) as u64;
                    tokens_saved += original_tokens.saturating_sub(new_tokens);
                    rows::set_event_compacted(tx, &event.id, &compacted)?;
                    count += 1;
                }
                Ok(CompactionOutcome { count, tokens_saved })
            })
            .await
    }

    /// Hard-deletes exactly the given event ids.
    pub async fn prune_ids(&self, ids: &[String]) -> ColonyResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.store
            .run_transaction(|tx| rows::delete_events_by_ids(tx, ids))
            .await
    }
}

fn event_type_tag(t: StreamEventType) -> &'static str {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(agent: &str, content: &str) -> StreamEvent {
        StreamEvent {
            id: String::new(),
            event_type: StreamEventType::Inference,
            agent_address: agent.to_string(),
            goal_id: None,
            task_id: None,
            content: content.to_string(),
            token_count: 0,
            compacted_to: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_assigns_id_and_token_count() {
        let store = Store::open_in_memory().await.unwrap();
        let stream = EventStream::new(&store);
        let id = stream.append(sample_event("agent-1", "hello world")).await.unwrap();
        assert!(!id.is_empty());
        let recent = stream.get_recent("agent-1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].token_count > 0);
    }

    #[tokio::test]
    async fn compact_reference_shrinks_body_and_reports_savings() {
        let store = Store::open_in_memory().await.unwrap();
        let stream = EventStream::new(&store);
        stream
            .append(sample_event("agent-1", &"x".repeat(400)))
            .await
            .unwrap();
        let outcome = stream
            .compact(Utc::now() + chrono::Duration::seconds(1), CompactionStrategy::Reference)
            .await
            .unwrap();
        assert_eq!(outcome.count, 1);
        assert!(outcome.tokens_saved > 0);
    }

    #[tokio::test]
    async fn compact_ids_only_touches_named_events() {
        let store = Store::open_in_memory().await.unwrap();
        let stream = EventStream::new(&store);
        let keep = stream.append(sample_event("agent-1", "keep me")).await.unwrap();
        let shrink = stream
            .append(sample_event("agent-1", &"y".repeat(400)))
            .await
            .unwrap();
        let outcome = stream
            .compact_ids(&[shrink.clone()], CompactionStrategy::Reference)
            .await
            .unwrap();
        assert_eq!(outcome.count, 1);
        let recent = stream.get_recent("agent-1", 10).await.unwrap();
        let kept = recent.iter().find(|e| e.id == keep).unwrap();
        assert_eq!(kept.content, "keep me");
        let shrunk = recent.iter().find(|e| e.id == shrink).unwrap();
        assert!(shrunk.compacted_to.is_some());
    }

    #[tokio::test]
    async fn prune_ids_removes_only_named_events() {
        let store = Store::open_in_memory().await.unwrap();
        let stream = EventStream::new(&store);
        let keep = stream.append(sample_event("agent-1", "keep")).await.unwrap();
        let drop = stream.append(sample_event("agent-1", "drop")).await.unwrap();
        let deleted = stream.prune_ids(&[drop]).await.unwrap();
        assert_eq!(deleted, 1);
        let recent = stream.get_recent("agent-1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, keep);
    }

    #[tokio::test]
    async fn current_utilization_sums_live_token_counts() {
        let store = Store::open_in_memory().await.unwrap();
        let stream = EventStream::new(&store);
        stream.append(sample_event("agent-1", &"z".repeat(350))).await.unwrap();
        let utilization = stream.current_utilization("agent-1", 1000).await.unwrap();
        assert!(utilization.total_tokens > 0);
        assert!(utilization.utilization_percent > 0.0);
        assert_eq!(utilization.window_tokens, 1000);
    }

    #[tokio::test]
    async fn prune_removes_old_events() {
        let store = Store::open_in_memory().await.unwrap();
        let stream = EventStream::new(&store);
        stream.append(sample_event("agent-1", "old")).await.unwrap();
        let deleted = stream.prune(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(stream.get_recent("agent-1", 10).await.unwrap().is_empty());
    }
}
