use colony_inference::{InferenceClient, InferenceMessage};
use colony_taskgraph::TaskSpec;
use colony_types::{ColonyError, ColonyResult, Goal, DEFAULT_TASK_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One task as the planner proposes it, dependencies still expressed as
/// indices into the sibling `tasks` array rather than resolved ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerTask {
    pub title: String,
    pub description: String,
    pub agent_role: String,
    pub priority: u8,
    pub dependencies: Vec<usize>,
    pub estimated_cost_cents: i64,
    pub max_retries: u32,
    pub timeout_ms: u64,
}

/// A validated plan, ready to persist and hand to `decompose_goal` once
/// reviewed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerOutput {
    pub analysis: String,
    pub strategy: String,
    #[serde(default)]
    pub custom_roles: Vec<String>,
    pub tasks: Vec<PlannerTask>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub estimated_total_cost_cents: i64,
    pub estimated_time_minutes: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlannerTask {
    title: String,
    description: String,
    #[serde(default = "default_role")]
    agent_role: String,
    #[serde(default)]
    dependencies: Vec<usize>,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    estimated_cost_cents: i64,
    #[serde(default = "default_retries")]
    max_retries: u32,
    #[serde(default = "default_timeout")]
    timeout_ms: u64,
}

fn default_role() -> String {
    "generalist".to_string()
}
fn default_priority() -> u8 {
    50
}
fn default_retries() -> u32 {
    3
}
fn default_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlannerOutput {
    analysis: String,
    strategy: String,
    #[serde(default)]
    custom_roles: Vec<String>,
    tasks: Vec<RawPlannerTask>,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    estimated_total_cost_cents: i64,
    #[serde(default)]
    estimated_time_minutes: u32,
}

impl PlannerOutput {
    /// Validates a raw, untrusted plan: every required string non-empty
    /// after trimming, custom role names unique, dependency indices in
    /// range, non-self-referential, non-duplicated within a task, and the
    /// combined dependency graph acyclic.
    pub fn validate(raw: RawPlannerOutput) -> ColonyResult<Self> {
        let analysis = raw.analysis.trim().to_string();
        if analysis.is_empty() {
            return Err(ColonyError::InvalidInput("plan analysis must not be empty".into()));
        }
        let strategy = raw.strategy.trim().to_string();
        if strategy.is_empty() {
            return Err(ColonyError::InvalidInput("plan strategy must not be empty".into()));
        }

        let mut seen_roles = HashSet::new();
        let mut custom_roles = Vec::with_capacity(raw.custom_roles.len());
        for role in &raw.custom_roles {
            let trimmed = role.trim().to_string();
            if trimmed.is_empty() {
                return Err(ColonyError::InvalidInput("custom role name must not be empty".into()));
            }
            if !seen_roles.insert(trimmed.clone()) {
                return Err(ColonyError::InvalidInput(format!(
                    "duplicate custom role name: {trimmed}"
                )));
            }
            custom_roles.push(trimmed);
        }

        let n = raw.tasks.len();
        let mut tasks = Vec::with_capacity(n);
        let mut graph: HashMap<usize, Vec<usize>> = HashMap::with_capacity(n);

        for (i, raw_task) in raw.tasks.iter().enumerate() {
            let title = raw_task.title.trim().to_string();
            if title.is_empty() {
                return Err(ColonyError::InvalidInput(format!("task {i} title must not be empty")));
            }
            let description = raw_task.description.trim().to_string();
            if description.is_empty() {
                return Err(ColonyError::InvalidInput(format!(
                    "task {i} description must not be empty"
                )));
            }
            let agent_role = if raw_task.agent_role.trim().is_empty() {
                default_role()
            } else {
                raw_task.agent_role.trim().to_string()
            };

            let mut dep_seen = HashSet::with_capacity(raw_task.dependencies.len());
            let mut dependencies = Vec::with_capacity(raw_task.dependencies.len());
            for &dep in &raw_task.dependencies {
                if dep == i {
                    return Err(ColonyError::InvalidInput(format!("task {i} depends on itself")));
                }
                if dep >= n {
                    return Err(ColonyError::InvalidInput(format!(
                        "task {i} dependency index {dep} out of range"
                    )));
                }
                if !dep_seen.insert(dep) {
                    return Err(ColonyError::InvalidInput(format!(
                        "task {i} has duplicate dependency index {dep}"
                    )));
                }
                dependencies.push(dep);
            }

            graph.insert(i, dependencies.clone());
            tasks.push(PlannerTask {
                title,
                description,
                agent_role,
                priority: raw_task.priority,
                dependencies,
                estimated_cost_cents: raw_task.estimated_cost_cents,
                max_retries: raw_task.max_retries,
                timeout_ms: raw_task.timeout_ms,
            });
        }

        validate_acyclic(&graph)?;

        Ok(Self {
            analysis,
            strategy,
            custom_roles,
            tasks,
            risks: raw.risks,
            estimated_total_cost_cents: raw.estimated_total_cost_cents,
            estimated_time_minutes: raw.estimated_time_minutes,
        })
    }

    /// A single generalist task covering the goal verbatim, used whenever
    /// inference is unavailable, returns unparseable output, or proposes an
    /// empty task list.
    pub fn single_task_fallback(goal: &Goal, reason: &str) -> Self {
        Self {
            analysis: format!("heuristic single-task fallback: {reason}"),
            strategy: "direct".to_string(),
            custom_roles: Vec::new(),
            tasks: vec![PlannerTask {
                title: goal.title.clone(),
                description: goal.description.clone(),
                agent_role: default_role(),
                priority: default_priority(),
                dependencies: Vec::new(),
                estimated_cost_cents: 0,
                max_retries: default_retries(),
                timeout_ms: default_timeout(),
            }],
            risks: Vec::new(),
            estimated_total_cost_cents: 0,
            estimated_time_minutes: 5,
        }
    }
}

fn validate_acyclic(graph: &HashMap<usize, Vec<usize>>) -> ColonyResult<()> {
    let string_graph: HashMap<String, Vec<String>> = graph
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|d| d.to_string()).collect()))
        .collect();
    colony_taskgraph::detect_cycles(&string_graph)
}

/// Converts a validated task into the aliasing form `decompose_goal`
/// expects: each dependency index becomes its decimal-string alias, which
/// `decompose_goal` resolves against the positions of the batch it was
/// submitted alongside.
pub fn to_task_spec(task: &PlannerTask) -> TaskSpec {
    TaskSpec {
        title: task.title.clone(),
        description: task.description.clone(),
        agent_role: task.agent_role.clone(),
        priority: task.priority,
        dependencies: task.dependencies.iter().map(|d| d.to_string()).collect(),
        estimated_cost_cents: task.estimated_cost_cents,
        max_retries: task.max_retries,
        timeout_ms: task.timeout_ms,
        requested_status: None,
    }
}

/// Inference-backed planner with a deterministic fallback. Mirrors
/// `Classifier`'s shape: one inference call, heuristic substitute on any
/// failure to parse or validate.
pub struct Planner {
    inference: Arc<dyn InferenceClient>,
}

impl Planner {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    pub async fn plan(&self, goal: &Goal, context: &str) -> PlannerOutput {
        let mut prompt = vec![InferenceMessage::system(
            "Decompose this goal into an ordered task plan. Respond as JSON: \
             {\"analysis\":\"...\",\"strategy\":\"...\",\"customRoles\":[...],\"tasks\":\
             [{\"title\":\"...\",\"description\":\"...\",\"agentRole\":\"...\",\"dependencies\":\
             [indices into this array],\"priority\":0-100,\"estimatedCostCents\":N,\
             \"maxRetries\":N,\"timeoutMs\":N}],\"risks\":[...],\"estimatedTotalCostCents\":N,\
             \"estimatedTimeMinutes\":N}",
        )];
        if !context.is_empty() {
            prompt.push(InferenceMessage::system(context.to_string()));
        }
        prompt.push(InferenceMessage::user(goal.description.clone()));

        match self.inference.complete(&prompt).await {
            Ok(text) => match serde_json::from_str::<RawPlannerOutput>(&text)
                .map_err(|e| ColonyError::InvalidInput(e.to_string()))
                .and_then(PlannerOutput::validate)
            {
                Ok(plan) if !plan.tasks.is_empty() => plan,
                Ok(_) => PlannerOutput::single_task_fallback(goal, "planner returned no tasks"),
                Err(e) => {
                    PlannerOutput::single_task_fallback(goal, &format!("invalid planner output: {e}"))
                }
            },
            Err(_) => PlannerOutput::single_task_fallback(goal, "inference unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_types::{new_id, GoalStatus};
    use chrono::Utc;

    fn goal() -> Goal {
        Goal {
            id: new_id(),
            title: "ship widget".into(),
            description: "ship the widget".into(),
            strategy: None,
            status: GoalStatus::Active,
            expected_revenue_cents: 0,
            actual_revenue_cents: 0,
            created_at: Utc::now(),
            completed_at: None,
            deadline: None,
        }
    }

    fn raw(tasks: Vec<RawPlannerTask>) -> RawPlannerOutput {
        RawPlannerOutput {
            analysis: "because".into(),
            strategy: "sequential".into(),
            custom_roles: Vec::new(),
            tasks,
            risks: Vec::new(),
            estimated_total_cost_cents: 0,
            estimated_time_minutes: 10,
        }
    }

    fn task(title: &str, deps: Vec<usize>) -> RawPlannerTask {
        RawPlannerTask {
            title: title.into(),
            description: format!("do {title}"),
            agent_role: default_role(),
            dependencies: deps,
            priority: default_priority(),
            estimated_cost_cents: 0,
            max_retries: default_retries(),
            timeout_ms: default_timeout(),
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_plan() {
        let plan = PlannerOutput::validate(raw(vec![task("a", vec![]), task("b", vec![0])])).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].dependencies, vec![0]);
    }

    #[test]
    fn validate_rejects_empty_title() {
        let mut t = task("a", vec![]);
        t.title = "   ".into();
        let result = PlannerOutput::validate(raw(vec![t]));
        assert!(matches!(result, Err(ColonyError::InvalidInput(_))));
    }

    #[test]
    fn validate_rejects_self_dependency() {
        let result = PlannerOutput::validate(raw(vec![task("a", vec![0])]));
        assert!(matches!(result, Err(ColonyError::InvalidInput(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_dependency() {
        let result = PlannerOutput::validate(raw(vec![task("a", vec![5])]));
        assert!(matches!(result, Err(ColonyError::InvalidInput(_))));
    }

    #[test]
    fn validate_rejects_duplicate_dependency_index() {
        let result = PlannerOutput::validate(raw(vec![task("a", vec![]), task("b", vec![0, 0])]));
        assert!(matches!(result, Err(ColonyError::InvalidInput(_))));
    }

    #[test]
    fn validate_rejects_cyclic_dependencies() {
        let result = PlannerOutput::validate(raw(vec![task("a", vec![1]), task("b", vec![0])]));
        assert!(matches!(result, Err(ColonyError::InvalidInput(_))));
    }

    #[test]
    fn validate_rejects_duplicate_custom_role() {
        let mut o = raw(vec![task("a", vec![])]);
        o.custom_roles = vec!["scout".into(), "scout".into()];
        let result = PlannerOutput::validate(o);
        assert!(matches!(result, Err(ColonyError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn planner_falls_back_on_declining_inference() {
        let planner = Planner::new(Arc::new(colony_inference::HeuristicInferenceClient));
        let plan = planner.plan(&goal(), "").await;
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].title, "ship widget");
    }
}
