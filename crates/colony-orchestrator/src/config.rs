/// How a freshly produced plan gets from `plan_review` to `executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Approves automatically. A plan whose estimated cost exceeds
    /// `auto_budget_threshold_cents` is still approved, but the excess is
    /// recorded as plan feedback rather than silently absorbed.
    Auto,
    /// Leaves the phase at `plan_review` until an external operator approves
    /// or rejects it. The orchestrator never originates this transition on
    /// its own.
    Supervised,
    /// Approves after a synthetic critic pass, recording its note as
    /// feedback the same way the budget-exceeded note is recorded in auto
    /// mode.
    Consensus,
}

/// Tunables for one `Orchestrator` instance. Every field has a
/// `COLONY_ORCHESTRATOR_<FIELD>` environment override; see
/// [`crate::runtime_config`] for the layered loader that applies them.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub approval_mode: ApprovalMode,
    pub auto_budget_threshold_cents: i64,
    pub max_replans: u32,
    pub default_task_funding_cents: i64,
    pub default_timeout_ms: u64,
    /// Address the orchestrator identifies itself by when it self-assigns a
    /// task as a last resort, or funds/messages a spawned worker. `None`
    /// disables self-assignment, leaving an unmatchable task pending.
    pub self_address: Option<String>,
    /// Max inbox messages drained per executing tick's collect-results step.
    pub dispatch_claim_batch: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Auto,
            auto_budget_threshold_cents: 5_000,
            max_replans: 3,
            default_task_funding_cents: 100,
            default_timeout_ms: colony_types::DEFAULT_TASK_TIMEOUT_MS,
            self_address: Some("orchestrator:self".to_string()),
            dispatch_claim_batch: 50,
        }
    }
}
