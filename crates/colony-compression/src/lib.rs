mod checkpoints;

pub use checkpoints::Checkpoint;

use chrono::Utc;
use colony_eventstream::{CompactionStrategy, EventStream, Utilization};
use colony_inference::{InferenceClient, InferenceMessage};
use colony_store::{rows, Store};
use colony_types::*;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub const STAGE1_THRESHOLD: f64 = 70.0;
pub const STAGE2_THRESHOLD: f64 = 80.0;
pub const STAGE3_THRESHOLD: f64 = 85.0;
pub const STAGE4_THRESHOLD: f64 = 90.0;
pub const STAGE5_THRESHOLD: f64 = 95.0;

const STAGE1_RETAIN_TURNS: usize = 5;
const STAGE2_RETAIN_TURNS: usize = 10;
const STAGE3_BATCH_SIZE: usize = 5;
const STAGE3_BUDGET_TOKENS: u32 = 220;
const STAGE4_RETAIN_TURNS: usize = 5;
const STAGE4_SUMMARY_BUDGET_TOKENS: u32 = 1500;
const STAGE5_RETAIN_TURNS: usize = 3;

/// The §4.6 threshold table, overridable per `CompressionEngine` instance
/// so integration tests and the runtime config layer can tune the cascade
/// without touching the defaults every other caller relies on.
#[derive(Debug, Clone, Copy)]
pub struct CompressionThresholds {
    pub stage1: f64,
    pub stage2: f64,
    pub stage3: f64,
    pub stage4: f64,
    pub stage5: f64,
}

impl Default for CompressionThresholds {
    fn default() -> Self {
        Self {
            stage1: STAGE1_THRESHOLD,
            stage2: STAGE2_THRESHOLD,
            stage3: STAGE3_THRESHOLD,
            stage4: STAGE4_THRESHOLD,
            stage5: STAGE5_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAction {
    CompactToolResults,
    CompressTurns,
    SummarizeBatch,
    CheckpointAndReset,
    EmergencyTruncate,
}

impl CompressionAction {
    pub fn stage(self) -> u8 {
        match self {
            CompressionAction::CompactToolResults => 1,
            CompressionAction::CompressTurns => 2,
            CompressionAction::SummarizeBatch => 3,
            CompressionAction::CheckpointAndReset => 4,
            CompressionAction::EmergencyTruncate => 5,
        }
    }
}

/// The set of actions `evaluate` decided to run, in ascending stage order.
/// An empty plan means utilization sits below every threshold.
#[derive(Debug, Clone, Default)]
pub struct CompressionPlan {
    pub actions: Vec<CompressionAction>,
}

impl CompressionPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn max_stage(&self) -> u8 {
        self.actions.iter().map(|a| a.stage()).max().unwrap_or(0)
    }

    fn contains(&self, action: CompressionAction) -> bool {
        self.actions.contains(&action)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionMetrics {
    pub turn_number: u64,
    pub pre_compression_tokens: u64,
    pub post_compression_tokens: u64,
    pub compression_ratio: f64,
    pub stage: u8,
    pub tokens_saved: u64,
    pub latency_ms: u64,
    pub total_checkpoints: u64,
    pub total_emergency_truncations: u64,
    pub compressed_turn_count: u64,
    pub average_compression_ratio: f64,
    pub peak_utilization_percent: f64,
    pub turns_without_compression: u64,
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub success: bool,
    pub metrics: CompressionMetrics,
}

/// In-memory running counters. Owned by the `CompressionEngine` value
/// itself and never exposed as a module static, so two engines (e.g. one
/// per agent process under test) never share state.
#[derive(Debug, Clone, Default)]
struct CompressionCounters {
    turn_number: u64,
    total_checkpoints: u64,
    total_emergency_truncations: u64,
    compressed_turn_count: u64,
    ratio_sum: f64,
    ratio_count: u64,
    peak_utilization_percent: f64,
    turns_without_compression: u64,
}

/// Five-stage progressive cascade that keeps an agent's event stream
/// within its context window. `evaluate` is pure bookkeeping (thresholds
/// and peak tracking); `execute` is where I/O — inference calls, store
/// writes, checkpoint files — happens.
pub struct CompressionEngine {
    store: Arc<Store>,
    inference: Arc<dyn InferenceClient>,
    workspace: PathBuf,
    agent_address: String,
    window_tokens: u64,
    thresholds: CompressionThresholds,
    counters: CompressionCounters,
}

impl CompressionEngine {
    pub fn new(
        store: Arc<Store>,
        inference: Arc<dyn InferenceClient>,
        workspace: PathBuf,
        agent_address: impl Into<String>,
        window_tokens: u64,
    ) -> Self {
        Self {
            store,
            inference,
            workspace,
            agent_address: agent_address.into(),
            window_tokens,
            thresholds: CompressionThresholds::default(),
            counters: CompressionCounters::default(),
        }
    }

    /// Overrides the §4.6 threshold table, e.g. from a loaded `RuntimeConfig`
    /// or a test that wants to exercise a stage without 15 synthetic events.
    pub fn with_thresholds(mut self, thresholds: CompressionThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn measure(&self) -> ColonyResult<Utilization> {
        EventStream::new(&self.store)
            .current_utilization(&self.agent_address, self.window_tokens)
            .await
    }

    /// Assembles a plan from crossed thresholds. Peak utilization is
    /// sticky across every call, matching the metrics contract even on
    /// ticks that end up producing an empty plan.
    pub fn evaluate(&mut self, utilization: Utilization) -> CompressionPlan {
        if utilization.utilization_percent > self.counters.peak_utilization_percent {
            self.counters.peak_utilization_percent = utilization.utilization_percent;
        }

        let pct = utilization.utilization_percent;
        let mut actions = Vec::new();
        if pct > self.thresholds.stage1 {
            actions.push(CompressionAction::CompactToolResults);
        }
        if pct > self.thresholds.stage2 {
            actions.push(CompressionAction::CompressTurns);
        }
        if pct > self.thresholds.stage3 {
            actions.push(CompressionAction::SummarizeBatch);
        }
        if pct > self.thresholds.stage4 {
            actions.push(CompressionAction::CheckpointAndReset);
        }
        if pct > self.thresholds.stage5 {
            actions.push(CompressionAction::EmergencyTruncate);
        }
        CompressionPlan { actions }
    }

    pub async fn execute(&mut self, plan: CompressionPlan) -> ColonyResult<CompressionResult> {
        let started = Instant::now();
        self.counters.turn_number += 1;

        let stream = EventStream::new(&self.store);
        let pre = self.measure().await?;

        if plan.is_empty() {
            self.counters.turns_without_compression += 1;
            let metrics = self.snapshot(0, pre.total_tokens, pre.total_tokens, 1.0, 0, started.elapsed().as_millis() as u64);
            return Ok(CompressionResult { success: true, metrics });
        }

        let mut stage_reached = 0u8;
        let mut force_stage4 = false;

        if plan.contains(CompressionAction::CompactToolResults) {
            self.compact_tool_results(&stream).await?;
            stage_reached = 1;
        }
        if plan.contains(CompressionAction::CompressTurns) {
            self.compress_turns(&stream).await?;
            stage_reached = 2;
        }
        if plan.contains(CompressionAction::SummarizeBatch) {
            match self.summarize_batch(&stream).await {
                Ok(()) => stage_reached = 3,
                Err(e) => {
                    stream
                        .append(StreamEvent {
                            id: String::new(),
                            event_type: StreamEventType::CompressionError,
                            agent_address: self.agent_address.clone(),
                            goal_id: None,
                            task_id: None,
                            content: format!("stage:3 summarize_batch failed: {e}"),
                            token_count: 0,
                            compacted_to: None,
                            created_at: Utc::now(),
                        })
                        .await?;
                    force_stage4 = true;
                }
            }
        }
        if plan.contains(CompressionAction::CheckpointAndReset) || force_stage4 {
            self.checkpoint_and_reset(&stream).await?;
            stage_reached = 4;
        }
        if plan.contains(CompressionAction::EmergencyTruncate) {
            self.emergency_truncate(&stream).await?;
            stage_reached = 5;
        }

        let post = self.measure().await?;
        let tokens_saved = pre.total_tokens.saturating_sub(post.total_tokens);
        let ratio = if pre.total_tokens == 0 {
            1.0
        } else {
            post.total_tokens as f64 / pre.total_tokens as f64
        };

        self.counters.ratio_sum += ratio;
        self.counters.ratio_count += 1;
        self.counters.compressed_turn_count += 1;
        self.counters.turns_without_compression = 0;
        if stage_reached == 4 {
            self.counters.total_checkpoints += 1;
        }
        if stage_reached == 5 {
            self.counters.total_emergency_truncations += 1;
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let metrics = self.snapshot(stage_reached, pre.total_tokens, post.total_tokens, ratio, tokens_saved, latency_ms);

        stream
            .append(StreamEvent {
                id: String::new(),
                event_type: StreamEventType::Compression,
                agent_address: self.agent_address.clone(),
                goal_id: None,
                task_id: None,
                content: serde_json::to_string(&metrics)?,
                token_count: 0,
                compacted_to: None,
                created_at: Utc::now(),
            })
            .await?;

        Ok(CompressionResult { success: true, metrics })
    }

    fn snapshot(
        &self,
        stage: u8,
        pre_tokens: u64,
        post_tokens: u64,
        ratio: f64,
        tokens_saved: u64,
        latency_ms: u64,
    ) -> CompressionMetrics {
        let average_compression_ratio = if self.counters.ratio_count == 0 {
            1.0
        } else {
            self.counters.ratio_sum / self.counters.ratio_count as f64
        };
        CompressionMetrics {
            turn_number: self.counters.turn_number,
            pre_compression_tokens: pre_tokens,
            post_compression_tokens: post_tokens,
            compression_ratio: ratio,
            stage,
            tokens_saved,
            latency_ms,
            total_checkpoints: self.counters.total_checkpoints,
            total_emergency_truncations: self.counters.total_emergency_truncations,
            compressed_turn_count: self.counters.compressed_turn_count,
            average_compression_ratio,
            peak_utilization_percent: self.counters.peak_utilization_percent,
            turns_without_compression: self.counters.turns_without_compression,
        }
    }

    async fn compact_tool_results(&self, stream: &EventStream<'_>) -> ColonyResult<()> {
        let events = stream.all_for_agent(&self.agent_address).await?;
        let start = retained_window_start(&events, STAGE1_RETAIN_TURNS);
        let ids: Vec<String> = events[..start].iter().map(|e| e.id.clone()).collect();
        stream.compact_ids(&ids, CompactionStrategy::Reference).await?;
        Ok(())
    }

    async fn compress_turns(&self, stream: &EventStream<'_>) -> ColonyResult<()> {
        let events = stream.all_for_agent(&self.agent_address).await?;
        let start = retained_window_start(&events, STAGE2_RETAIN_TURNS);
        let ids: Vec<String> = events[..start].iter().map(|e| e.id.clone()).collect();
        stream.compact_ids(&ids, CompactionStrategy::Summarize).await?;
        Ok(())
    }

    /// Batches the stage-2 target set in groups of `STAGE3_BATCH_SIZE`,
    /// asks the inference seam for a budgeted summary of each, and files
    /// the result as both a knowledge entry and a `reflection` event.
    /// Any inference failure propagates — the caller is responsible for
    /// the stage-4 fall-through.
    async fn summarize_batch(&self, stream: &EventStream<'_>) -> ColonyResult<()> {
        let events = stream.all_for_agent(&self.agent_address).await?;
        let start = retained_window_start(&events, STAGE2_RETAIN_TURNS);
        let target = &events[..start];
        if target.is_empty() {
            return Ok(());
        }

        for batch in target.chunks(STAGE3_BATCH_SIZE) {
            let joined = batch
                .iter()
                .map(|e| e.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = vec![
                InferenceMessage::system(format!(
                    "Summarize the following agent turns in under {STAGE3_BUDGET_TOKENS} tokens."
                )),
                InferenceMessage::user(joined),
            ];
            let mut summary = self.inference.complete(&prompt).await?;
            summary = clamp_to_token_budget(&summary, STAGE3_BUDGET_TOKENS);
            let summary_tokens = estimate_tokens(&summary);

            let now = Utc::now();
            let entry = KnowledgeEntry {
                id: new_id(),
                category: KnowledgeCategory::Operational,
                key: format!("compression_summary:{}:{}", self.agent_address, now.to_rfc3339()),
                content: summary.clone(),
                confidence: 0.6,
                source: "compression_engine".to_string(),
                access_count: 0,
                token_count: summary_tokens,
                created_at: now,
                last_verified: now,
                expires_at: None,
            };
            self.store.run_transaction(|tx| rows::insert_knowledge(tx, &entry)).await?;

            stream
                .append(StreamEvent {
                    id: String::new(),
                    event_type: StreamEventType::Reflection,
                    agent_address: self.agent_address.clone(),
                    goal_id: None,
                    task_id: None,
                    content: summary,
                    token_count: 0,
                    compacted_to: None,
                    created_at: Utc::now(),
                })
                .await?;

            let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
            stream.compact_ids(&ids, CompactionStrategy::Summarize).await?;
        }
        Ok(())
    }

    /// Produces a checkpoint for everything before the retained window,
    /// writes it to disk, rehydrates active task specs into the knowledge
    /// store, then compacts the prefix.
    async fn checkpoint_and_reset(&mut self, stream: &EventStream<'_>) -> ColonyResult<()> {
        let events = stream.all_for_agent(&self.agent_address).await?;
        let start = retained_window_start(&events, STAGE4_RETAIN_TURNS);
        let prefix = &events[..start];

        let (active_goal_ids, active_task_ids) = checkpoints::derive_active_ids(&events);
        let key_decisions = checkpoints::derive_key_decisions(prefix, 10);
        let financial_state = self.financial_snapshot().await?;

        let raw_summary = prefix
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        let summary = clamp_to_token_budget(&raw_summary, STAGE4_SUMMARY_BUDGET_TOKENS);
        let summary_tokens = estimate_tokens(&summary);

        let prefix_tokens: u64 = prefix.iter().map(|e| e.token_count as u64).sum();
        let compacted_tokens = estimate_tokens(&summary) as u64;
        let tokens_saved = prefix_tokens.saturating_sub(compacted_tokens);

        let checkpoint = Checkpoint {
            id: new_id(),
            agent_address: self.agent_address.clone(),
            summary,
            summary_tokens,
            active_goal_ids: active_goal_ids.clone(),
            active_task_ids: active_task_ids.clone(),
            key_decisions,
            financial_state,
            turn_count: events.len() as u64,
            tokens_saved,
            created_at: Utc::now(),
            file_path: None,
        };
        let file_path = checkpoints::write_checkpoint(&self.workspace, &checkpoint).await?;

        for task_id in &active_task_ids {
            if let Some(task) = self.store.get_task(task_id).await? {
                let now = Utc::now();
                let entry = KnowledgeEntry {
                    id: new_id(),
                    category: KnowledgeCategory::Operational,
                    key: format!("active_task_spec:{task_id}"),
                    content: serde_json::to_string(&task)?,
                    confidence: 1.0,
                    source: "compression_engine".to_string(),
                    access_count: 0,
                    token_count: estimate_tokens(&task.description),
                    created_at: now,
                    last_verified: now,
                    expires_at: None,
                };
                self.store.run_transaction(|tx| rows::insert_knowledge(tx, &entry)).await?;
            }
        }

        let ids: Vec<String> = prefix.iter().map(|e| e.id.clone()).collect();
        stream.compact_ids(&ids, CompactionStrategy::Reference).await?;

        stream
            .append(StreamEvent {
                id: String::new(),
                event_type: StreamEventType::Reflection,
                agent_address: self.agent_address.clone(),
                goal_id: None,
                task_id: None,
                content: format!(
                    "{{\"kind\":\"compression_checkpoint_created\",\"checkpointId\":\"{}\",\"filePath\":\"{}\"}}",
                    checkpoint.id,
                    file_path.display(),
                ),
                token_count: 0,
                compacted_to: None,
                created_at: Utc::now(),
            })
            .await?;

        Ok(())
    }

    /// Hard-prunes everything before the retained 3-turn window and
    /// records a warning — the last resort when the cascade above has not
    /// kept pace with growth.
    async fn emergency_truncate(&self, stream: &EventStream<'_>) -> ColonyResult<()> {
        let events = stream.all_for_agent(&self.agent_address).await?;
        let start = retained_window_start(&events, STAGE5_RETAIN_TURNS);
        let ids: Vec<String> = events[..start].iter().map(|e| e.id.clone()).collect();
        let pruned = stream.prune_ids(&ids).await?;

        stream
            .append(StreamEvent {
                id: String::new(),
                event_type: StreamEventType::CompressionWarning,
                agent_address: self.agent_address.clone(),
                goal_id: None,
                task_id: None,
                content: format!("emergency_truncate pruned {pruned} events"),
                token_count: 0,
                compacted_to: None,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn financial_snapshot(&self) -> ColonyResult<Vec<String>> {
        let mut lines = Vec::new();

        let mut financial_events = self.store.get_events_by_type(StreamEventType::Financial, None).await?;
        let mut revenue_events = self.store.get_events_by_type(StreamEventType::Revenue, None).await?;
        financial_events.append(&mut revenue_events);
        financial_events.sort_by_key(|e| e.created_at);
        for event in financial_events.iter().rev().take(10) {
            lines.push(event.content.clone());
        }

        let entries = self
            .store
            .run_transaction(|tx| rows::list_knowledge_by_category(tx, KnowledgeCategory::Financial, 5))
            .await?;
        for entry in entries {
            lines.push(entry.content);
        }
        Ok(lines)
    }
}

/// Extracts `tool_call_id:<id>` style references out of an event's
/// content. Deliberately permissive — it only needs to catch same-turn
/// references between a tool call and its result, not parse structured
/// payloads.
fn extract_tool_call_ids(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("tool_call_id:"))
        .map(|id| id.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Computes where a `keep_last`-turn retained window begins, then walks
/// the window back to a fixpoint so that any tool call referenced from
/// inside the window is never separated from its original mention.
fn retained_window_start(events: &[StreamEvent], keep_last: usize) -> usize {
    if events.len() <= keep_last {
        return 0;
    }
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (i, event) in events.iter().enumerate() {
        for id in extract_tool_call_ids(&event.content) {
            first_seen.entry(id).or_insert(i);
        }
    }

    let mut start = events.len() - keep_last;
    loop {
        let mut pulled_back = start;
        for event in &events[start..] {
            for id in extract_tool_call_ids(&event.content) {
                if let Some(&first) = first_seen.get(&id) {
                    if first < pulled_back {
                        pulled_back = first;
                    }
                }
            }
        }
        if pulled_back == start {
            break;
        }
        start = pulled_back;
    }
    start
}

/// Shrinks `text` until its estimated token count fits `budget`, cutting
/// on character boundaries from the end. Matches the same
/// `estimate_tokens` formula used for every other token accounting
/// decision in this codebase, so a clamp here and a threshold check
/// elsewhere never disagree about what "220 tokens" means.
fn clamp_to_token_budget(text: &str, budget: u32) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    let max_chars = (budget as f64 * 3.5).floor() as usize;
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_inference::HeuristicInferenceClient;

    fn make_events(n: usize, tokens_each: u32) -> Vec<StreamEvent> {
        (0..n)
            .map(|i| StreamEvent {
                id: format!("e{i}"),
                event_type: StreamEventType::Inference,
                agent_address: "agent-1".into(),
                goal_id: None,
                task_id: None,
                content: format!("turn {i}"),
                token_count: tokens_each,
                compacted_to: None,
                created_at: Utc::now(),
            })
            .collect()
    }

    fn engine(store: Arc<Store>, workspace: PathBuf) -> CompressionEngine {
        CompressionEngine::new(store, Arc::new(HeuristicInferenceClient), workspace, "agent-1", 1000)
    }

    #[test]
    fn evaluate_boundary_thresholds_match_table() {
        let mut e = engine(
            Arc::new(block_on_current_thread(Store::open_in_memory()).unwrap()),
            PathBuf::from("/tmp/colony-compression-test"),
        );
        let plan = |pct: f64| {
            e.evaluate(Utilization {
                total_tokens: 0,
                window_tokens: 1000,
                utilization_percent: pct,
            })
        };
        assert_eq!(plan(71.0).actions, vec![CompressionAction::CompactToolResults]);
        assert_eq!(
            plan(81.0).actions,
            vec![CompressionAction::CompactToolResults, CompressionAction::CompressTurns]
        );
        assert_eq!(
            plan(86.0).actions,
            vec![
                CompressionAction::CompactToolResults,
                CompressionAction::CompressTurns,
                CompressionAction::SummarizeBatch,
            ]
        );
        assert_eq!(
            plan(91.0).actions,
            vec![
                CompressionAction::CompactToolResults,
                CompressionAction::CompressTurns,
                CompressionAction::SummarizeBatch,
                CompressionAction::CheckpointAndReset,
            ]
        );
        assert_eq!(plan(96.0).actions.len(), 5);
        assert!(plan(50.0).is_empty());
    }

    // `evaluate` itself is synchronous; this just gets an in-memory Store
    // constructed for a plain `#[test]` without pulling in `#[tokio::test]`.
    fn block_on_current_thread<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn retained_window_pulls_back_for_split_tool_pairs() {
        let mut events = make_events(12, 10);
        events[1].content = "tool_call_id:abc issued".into();
        events[9].content = "tool_call_id:abc result".into();
        let start = retained_window_start(&events, 5);
        assert!(start <= 1, "window must include the original tool call at index 1");
    }

    #[test]
    fn clamp_to_token_budget_shrinks_oversized_text() {
        let text = "x".repeat(10_000);
        let clamped = clamp_to_token_budget(&text, 100);
        assert!(estimate_tokens(&clamped) <= 100);
    }

    #[tokio::test]
    async fn execute_on_empty_plan_is_a_no_op_with_ratio_one() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(store, dir.path().to_path_buf());
        let result = e.execute(CompressionPlan::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metrics.compression_ratio, 1.0);
        assert_eq!(result.metrics.stage, 0);
    }

    #[tokio::test]
    async fn checkpoint_and_reset_writes_file_and_reflection_event() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let stream = EventStream::new(&store);
        for i in 0..15 {
            stream
                .append(StreamEvent {
                    id: String::new(),
                    event_type: StreamEventType::Inference,
                    agent_address: "agent-1".into(),
                    goal_id: None,
                    task_id: None,
                    content: format!("turn {i}"),
                    token_count: 500,
                    compacted_to: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let mut e = engine(store.clone(), dir.path().to_path_buf());
        let utilization = e.measure().await.unwrap();
        let plan = e.evaluate(Utilization {
            total_tokens: utilization.total_tokens,
            window_tokens: 1000,
            utilization_percent: 91.0,
        });
        assert!(plan.actions.contains(&CompressionAction::CheckpointAndReset));

        let result = e.execute(plan).await.unwrap();
        assert!(result.success);

        let checkpoints_dir = dir.path().join("checkpoints");
        let mut found = false;
        let mut read = tokio::fs::read_dir(&checkpoints_dir).await.unwrap();
        while let Some(entry) = read.next_entry().await.unwrap() {
            if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
                found = true;
            }
        }
        assert!(found, "expected a checkpoint json file");

        let reflections = stream.get_by_type(StreamEventType::Reflection, None).await.unwrap();
        assert!(reflections
            .iter()
            .any(|e| e.content.contains("compression_checkpoint_created")));
    }

    struct FailingInference;

    #[async_trait::async_trait]
    impl InferenceClient for FailingInference {
        async fn complete(&self, _messages: &[InferenceMessage]) -> ColonyResult<String> {
            Err(ColonyError::InferenceFailure("provider unavailable".into()))
        }
    }

    #[tokio::test]
    async fn stage3_inference_failure_falls_through_to_stage4() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let stream = EventStream::new(&store);
        for i in 0..15 {
            stream
                .append(StreamEvent {
                    id: String::new(),
                    event_type: StreamEventType::Inference,
                    agent_address: "agent-1".into(),
                    goal_id: None,
                    task_id: None,
                    content: format!("turn {i}"),
                    token_count: 500,
                    compacted_to: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let mut e = CompressionEngine::new(
            store.clone(),
            Arc::new(FailingInference),
            dir.path().to_path_buf(),
            "agent-1",
            1000,
        );
        let plan = CompressionPlan {
            actions: vec![CompressionAction::CompactToolResults, CompressionAction::CompressTurns, CompressionAction::SummarizeBatch],
        };
        let result = e.execute(plan).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metrics.stage, 4);

        let errors = stream.get_by_type(StreamEventType::CompressionError, None).await.unwrap();
        assert!(errors.iter().any(|e| e.content.contains("stage:3")));
    }
}
