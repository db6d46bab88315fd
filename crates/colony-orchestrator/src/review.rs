use crate::config::ApprovalMode;
use crate::planner::PlannerOutput;

/// Outcome of reviewing a plan. `Pending` is a terminal value, not an
/// exception: a supervised plan simply stays in `plan_review` until an
/// external decision arrives, and the orchestrator's phase match stays
/// exhaustive either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved { feedback: Option<String> },
    Rejected { feedback: String },
    Pending,
}

/// Applies one approval mode to one plan. `auto` never withholds approval —
/// exceeding the budget threshold is recorded as feedback, not a rejection —
/// `supervised` always defers, and `consensus` approves behind a synthetic
/// critic note.
pub fn review_plan(
    mode: ApprovalMode,
    plan: &PlannerOutput,
    auto_budget_threshold_cents: i64,
) -> ReviewDecision {
    match mode {
        ApprovalMode::Auto => {
            if plan.estimated_total_cost_cents > auto_budget_threshold_cents {
                ReviewDecision::Approved {
                    feedback: Some(format!(
                        "estimated cost {} exceeds auto budget threshold {}",
                        plan.estimated_total_cost_cents, auto_budget_threshold_cents
                    )),
                }
            } else {
                ReviewDecision::Approved { feedback: None }
            }
        }
        ApprovalMode::Supervised => ReviewDecision::Pending,
        ApprovalMode::Consensus => ReviewDecision::Approved {
            feedback: Some("approved by critic role: quality-reviewer".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(cost: i64) -> PlannerOutput {
        PlannerOutput {
            analysis: "a".into(),
            strategy: "s".into(),
            custom_roles: vec![],
            tasks: vec![],
            risks: vec![],
            estimated_total_cost_cents: cost,
            estimated_time_minutes: 1,
        }
    }

    #[test]
    fn auto_approves_under_threshold_without_feedback() {
        let decision = review_plan(ApprovalMode::Auto, &plan(100), 500);
        assert_eq!(decision, ReviewDecision::Approved { feedback: None });
    }

    #[test]
    fn auto_approves_over_threshold_with_feedback() {
        let decision = review_plan(ApprovalMode::Auto, &plan(1000), 500);
        assert!(matches!(decision, ReviewDecision::Approved { feedback: Some(_) }));
    }

    #[test]
    fn supervised_always_stays_pending() {
        assert_eq!(review_plan(ApprovalMode::Supervised, &plan(0), 500), ReviewDecision::Pending);
    }

    #[test]
    fn consensus_approves_with_critic_feedback() {
        let decision = review_plan(ApprovalMode::Consensus, &plan(0), 500);
        assert!(matches!(decision, ReviewDecision::Approved { feedback: Some(_) }));
    }
}
