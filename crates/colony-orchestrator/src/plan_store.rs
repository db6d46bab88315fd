use crate::planner::PlannerOutput;
use colony_types::ColonyResult;
use std::path::{Path, PathBuf};

/// Writes the canonical `plan.json`, a human-readable `plan.md` alongside
/// it, and — if a plan already occupies `plan.json` — archives the
/// outgoing one as `plan-v<version-1>.json` first. Mirrors the
/// temp-file-then-rename idiom the compression engine's checkpoint writer
/// uses, so a crash mid-write never leaves a half-written `plan.json`.
pub async fn persist_plan(workspace: &Path, plan: &PlannerOutput, version: u32) -> ColonyResult<PathBuf> {
    tokio::fs::create_dir_all(workspace).await?;
    let canonical = workspace.join("plan.json");

    if version > 1 {
        if let Ok(true) = tokio::fs::try_exists(&canonical).await {
            let archived = workspace.join(format!("plan-v{}.json", version - 1));
            tokio::fs::rename(&canonical, &archived).await?;
        }
    }

    let body = serde_json::to_vec_pretty(plan)?;
    let tmp = workspace.join("plan.json.tmp");
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, &canonical).await?;

    tokio::fs::write(workspace.join("plan.md"), render_markdown(plan)).await?;
    Ok(canonical)
}

pub async fn load_plan(workspace: &Path) -> ColonyResult<PlannerOutput> {
    let body = tokio::fs::read(workspace.join("plan.json")).await?;
    Ok(serde_json::from_slice(&body)?)
}

fn render_markdown(plan: &PlannerOutput) -> String {
    let mut out = String::new();
    out.push_str("# Plan\n\n## Analysis\n");
    out.push_str(&plan.analysis);
    out.push_str("\n\n## Strategy\n");
    out.push_str(&plan.strategy);
    out.push_str("\n\n## Tasks\n");
    for (i, task) in plan.tasks.iter().enumerate() {
        out.push_str(&format!("{}. **{}** ({}) — {}\n", i + 1, task.title, task.agent_role, task.description));
        if !task.dependencies.is_empty() {
            let deps: Vec<String> = task.dependencies.iter().map(|d| (d + 1).to_string()).collect();
            out.push_str(&format!("   depends on: {}\n", deps.join(", ")));
        }
    }
    if !plan.risks.is_empty() {
        out.push_str("\n## Risks\n");
        for risk in &plan.risks {
            out.push_str(&format!("- {risk}\n"));
        }
    }
    out.push_str(&format!(
        "\nEstimated cost: {}c, estimated time: {}m\n",
        plan.estimated_total_cost_cents, plan.estimated_time_minutes
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannerTask;

    fn sample_plan(cost: i64) -> PlannerOutput {
        PlannerOutput {
            analysis: "because".into(),
            strategy: "sequential".into(),
            custom_roles: vec![],
            tasks: vec![PlannerTask {
                title: "research".into(),
                description: "look into it".into(),
                agent_role: "generalist".into(),
                priority: 50,
                dependencies: vec![],
                estimated_cost_cents: cost,
                max_retries: 3,
                timeout_ms: 300_000,
            }],
            risks: vec!["might be slow".into()],
            estimated_total_cost_cents: cost,
            estimated_time_minutes: 10,
        }
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan(100);
        persist_plan(dir.path(), &plan, 1).await.unwrap();
        let loaded = load_plan(dir.path()).await.unwrap();
        assert_eq!(loaded.tasks[0].title, plan.tasks[0].title);
        assert!(dir.path().join("plan.md").exists());
    }

    #[tokio::test]
    async fn replanning_archives_the_outgoing_version() {
        let dir = tempfile::tempdir().unwrap();
        persist_plan(dir.path(), &sample_plan(100), 1).await.unwrap();
        persist_plan(dir.path(), &sample_plan(200), 2).await.unwrap();
        assert!(dir.path().join("plan-v1.json").exists());
        let current = load_plan(dir.path()).await.unwrap();
        assert_eq!(current.estimated_total_cost_cents, 200);
    }
}
