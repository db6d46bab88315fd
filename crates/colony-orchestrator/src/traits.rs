use async_trait::async_trait;
use colony_types::{ColonyResult, Task};

/// Creates a new worker for a task that no idle agent can pick up.
/// Implementations reaching out to a remote sandbox should fall back to a
/// local in-process worker on provisioning failure rather than erroring —
/// `matchTaskToAgent` treats a spawn failure as "this option is
/// unavailable", not as a dispatch failure.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn spawn(&self, task: &Task) -> ColonyResult<String>;
}

/// Default executor for a single-machine deployment: every spawned worker
/// is an in-process address of the form `local:<uuid>`, which the
/// orchestrator recognizes and treats as needing neither funding nor a
/// `task_assignment` message — the work happens inside the same process
/// that already holds the task.
pub struct LocalWorkerExecutor;

#[async_trait]
impl WorkerExecutor for LocalWorkerExecutor {
    async fn spawn(&self, _task: &Task) -> ColonyResult<String> {
        Ok(format!("local:{}", colony_types::new_id()))
    }
}

/// Moves credits to fund a dispatched task, and recalls whatever is left
/// once a goal completes.
#[async_trait]
pub trait FundingProtocol: Send + Sync {
    async fn transfer(&self, to: &str, cents: i64) -> ColonyResult<()>;
    async fn recall(&self, from: &str) -> ColonyResult<i64>;
}

/// No real ledger backs a single-machine deployment by default; transfers
/// and recalls are accounting no-ops.
pub struct NullFundingProtocol;

#[async_trait]
impl FundingProtocol for NullFundingProtocol {
    async fn transfer(&self, _to: &str, _cents: i64) -> ColonyResult<()> {
        Ok(())
    }

    async fn recall(&self, _from: &str) -> ColonyResult<i64> {
        Ok(0)
    }
}

/// Liveness predicate for an assigned worker. The sole mechanism by which
/// a crashed worker's task is recovered: the executing tick resets any
/// task assigned to a dead address back to `pending`.
#[async_trait]
pub trait WorkerLiveness: Send + Sync {
    async fn is_alive(&self, address: &str) -> bool;
}

/// Default: every address is alive. Local in-process workers do not crash
/// independently of the orchestrator itself, so this is the correct
/// default for a single-machine deployment; a remote deployment supplies
/// its own heartbeat-backed implementation.
pub struct AlwaysAliveLiveness;

#[async_trait]
impl WorkerLiveness for AlwaysAliveLiveness {
    async fn is_alive(&self, _address: &str) -> bool {
        true
    }
}
