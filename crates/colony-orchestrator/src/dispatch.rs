use crate::traits::{FundingProtocol, WorkerExecutor};
use chrono::Utc;
use colony_store::Store;
use colony_types::{AgentRecord, AgentStatus, ColonyResult, Task};

/// `matchTaskToAgent`: idle agent in the right role, then any idle agent,
/// then a freshly spawned worker, then (spawning disabled) a busy agent
/// taken over, and finally self-assignment to `self_address` as the
/// fallback that always succeeds. Returns `None` only when self-assignment
/// is disabled and every other option was unavailable — the task simply
/// stays pending for the next tick, which is not a failure.
pub async fn match_task_to_agent(
    store: &Store,
    task: &Task,
    spawner: &dyn WorkerExecutor,
    spawn_enabled: bool,
    self_address: Option<&str>,
) -> ColonyResult<Option<String>> {
    if let Some(agent) = store.get_idle_agent_for_role(&task.agent_role).await? {
        claim_agent(store, &agent, &task.id).await?;
        return Ok(Some(agent.address));
    }

    if let Some(agent) = store.get_any_idle_agent().await? {
        claim_agent(store, &agent, &task.id).await?;
        return Ok(Some(agent.address));
    }

    if spawn_enabled {
        if let Ok(address) = spawner.spawn(task).await {
            store
                .upsert_agent(&AgentRecord {
                    address: address.clone(),
                    role: task.agent_role.clone(),
                    status: AgentStatus::Busy,
                    spawned_for_task_id: Some(task.id.clone()),
                    last_seen_at: Utc::now(),
                })
                .await?;
            return Ok(Some(address));
        }
    } else if let Some(agent) = store.get_any_busy_agent().await? {
        return Ok(Some(agent.address));
    }

    Ok(self_address.map(|s| s.to_string()))
}

async fn claim_agent(store: &Store, agent: &AgentRecord, task_id: &str) -> ColonyResult<()> {
    let mut updated = agent.clone();
    updated.status = AgentStatus::Busy;
    updated.spawned_for_task_id = Some(task_id.to_string());
    updated.last_seen_at = Utc::now();
    store.upsert_agent(&updated).await
}

/// True for addresses that never need funding or a `task_assignment`
/// envelope: the orchestrator's own identity and in-process local workers,
/// whose work happens inside the same process that already holds the task.
pub fn is_local_or_self(address: &str, self_address: Option<&str>) -> bool {
    address.starts_with("local:") || self_address == Some(address)
}

/// Transfers `max(estimated_cost_cents, default_task_funding_cents)` to the
/// assigned address. A no-op when both are zero — nothing to send, no
/// reason to round-trip the funding protocol.
pub async fn fund_agent_for_task(
    funding: &dyn FundingProtocol,
    address: &str,
    estimated_cost_cents: i64,
    default_task_funding_cents: i64,
) -> ColonyResult<()> {
    let amount = estimated_cost_cents.max(default_task_funding_cents);
    if amount == 0 {
        return Ok(());
    }
    funding.transfer(address, amount).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NullFundingProtocol;
    use colony_taskgraph::{create_goal, decompose_goal, TaskSpec};
    use colony_types::{new_id, Goal, GoalStatus};

    struct AlwaysSpawns;
    #[async_trait::async_trait]
    impl WorkerExecutor for AlwaysSpawns {
        async fn spawn(&self, _task: &Task) -> ColonyResult<String> {
            Ok(format!("local:{}", new_id()))
        }
    }

    struct NeverSpawns;
    #[async_trait::async_trait]
    impl WorkerExecutor for NeverSpawns {
        async fn spawn(&self, _task: &Task) -> ColonyResult<String> {
            Err(colony_types::ColonyError::InvalidState("spawning disabled".into()))
        }
    }

    async fn setup_task(store: &Store) -> Task {
        let goal = Goal {
            id: new_id(),
            title: "g".into(),
            description: "g".into(),
            strategy: None,
            status: GoalStatus::Active,
            expected_revenue_cents: 0,
            actual_revenue_cents: 0,
            created_at: Utc::now(),
            completed_at: None,
            deadline: None,
        };
        create_goal(store, goal.clone()).await.unwrap();
        decompose_goal(
            store,
            &goal.id,
            vec![TaskSpec {
                title: "t".into(),
                ..Default::default()
            }],
        )
        .await
        .unwrap()
        .remove(0)
    }

    #[tokio::test]
    async fn prefers_idle_agent_matching_role() {
        let store = Store::open_in_memory().await.unwrap();
        let task = setup_task(&store).await;
        store
            .upsert_agent(&AgentRecord {
                address: "worker-1".into(),
                role: "generalist".into(),
                status: AgentStatus::Idle,
                spawned_for_task_id: None,
                last_seen_at: Utc::now(),
            })
            .await
            .unwrap();

        let address = match_task_to_agent(&store, &task, &AlwaysSpawns, true, Some("orchestrator"))
            .await
            .unwrap();
        assert_eq!(address, Some("worker-1".to_string()));
    }

    #[tokio::test]
    async fn spawns_when_no_idle_agent_exists() {
        let store = Store::open_in_memory().await.unwrap();
        let task = setup_task(&store).await;
        let address = match_task_to_agent(&store, &task, &AlwaysSpawns, true, Some("orchestrator"))
            .await
            .unwrap();
        assert!(address.unwrap().starts_with("local:"));
    }

    #[tokio::test]
    async fn reassigns_busy_agent_when_spawning_disabled() {
        let store = Store::open_in_memory().await.unwrap();
        let task = setup_task(&store).await;
        store
            .upsert_agent(&AgentRecord {
                address: "worker-busy".into(),
                role: "other".into(),
                status: AgentStatus::Busy,
                spawned_for_task_id: None,
                last_seen_at: Utc::now(),
            })
            .await
            .unwrap();

        let address = match_task_to_agent(&store, &task, &NeverSpawns, false, Some("orchestrator"))
            .await
            .unwrap();
        assert_eq!(address, Some("worker-busy".to_string()));
    }

    #[tokio::test]
    async fn falls_back_to_self_assignment() {
        let store = Store::open_in_memory().await.unwrap();
        let task = setup_task(&store).await;
        let address = match_task_to_agent(&store, &task, &NeverSpawns, true, Some("orchestrator"))
            .await
            .unwrap();
        assert_eq!(address, Some("orchestrator".to_string()));
    }

    #[tokio::test]
    async fn funding_is_a_noop_when_both_amounts_are_zero() {
        fund_agent_for_task(&NullFundingProtocol, "worker-1", 0, 0).await.unwrap();
    }
}
