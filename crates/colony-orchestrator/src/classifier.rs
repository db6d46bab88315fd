use colony_inference::{InferenceClient, InferenceMessage};
use colony_types::Goal;
use serde::Deserialize;
use std::sync::Arc;

const MIN_STEPS: u8 = 1;
const MAX_STEPS: u8 = 12;
const TRIVIAL_THRESHOLD: u8 = 3;

#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    pub estimated_steps: u8,
    pub reason: String,
    pub step_outline: Vec<String>,
}

impl ClassifierOutput {
    pub fn is_trivial(&self) -> bool {
        self.estimated_steps <= TRIVIAL_THRESHOLD
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClassifierOutput {
    estimated_steps: u8,
    reason: String,
    #[serde(default)]
    step_outline: Vec<String>,
}

/// Lightweight inference call that decides whether a goal is simple enough
/// for a single generalist task or needs a full plan.
pub struct Classifier {
    inference: Arc<dyn InferenceClient>,
}

impl Classifier {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    pub async fn classify(&self, goal: &Goal) -> ClassifierOutput {
        let prompt = vec![
            InferenceMessage::system(
                "Estimate how many discrete steps this goal needs, 1-12. Respond as JSON: \
                 {\"estimatedSteps\":N,\"reason\":\"...\",\"stepOutline\":[...]}",
            ),
            InferenceMessage::user(goal.description.clone()),
        ];

        let parsed = match self.inference.complete(&prompt).await {
            Ok(text) => serde_json::from_str::<RawClassifierOutput>(&text).ok(),
            Err(_) => None,
        };

        match parsed {
            Some(raw) => ClassifierOutput {
                estimated_steps: raw.estimated_steps.clamp(MIN_STEPS, MAX_STEPS),
                reason: raw.reason,
                step_outline: raw.step_outline,
            },
            None => heuristic_classify(goal),
        }
    }
}

/// Deterministic substitute for inference: description length, conjunction
/// count and tool-vocabulary hits each add a step, clamped to `[1, 12]`.
fn heuristic_classify(goal: &Goal) -> ClassifierOutput {
    const TOOL_WORDS: &[&str] = &[
        "research", "design", "implement", "build", "test", "deploy", "review", "analyze",
        "write", "integrate",
    ];

    let description = goal.description.to_lowercase();
    let length_component = (description.len() / 40) as u32;
    let conjunction_component =
        description.matches(" and ").count() as u32 + description.matches(',').count() as u32;
    let tool_component = TOOL_WORDS.iter().filter(|w| description.contains(*w)).count() as u32;

    let steps = (1 + length_component + conjunction_component + tool_component)
        .clamp(MIN_STEPS as u32, MAX_STEPS as u32) as u8;

    ClassifierOutput {
        estimated_steps: steps,
        reason: "heuristic: length/conjunction/tool-vocabulary estimate".to_string(),
        step_outline: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_types::{new_id, GoalStatus};
    use chrono::Utc;

    fn goal(description: &str) -> Goal {
        Goal {
            id: new_id(),
            title: "t".into(),
            description: description.into(),
            strategy: None,
            status: GoalStatus::Active,
            expected_revenue_cents: 0,
            actual_revenue_cents: 0,
            created_at: Utc::now(),
            completed_at: None,
            deadline: None,
        }
    }

    #[test]
    fn short_goal_is_trivial() {
        let out = heuristic_classify(&goal("echo hello"));
        assert!(out.is_trivial());
    }

    #[test]
    fn multi_step_description_is_not_trivial() {
        let out = heuristic_classify(&goal(
            "research, design, implement, test, deploy and review the widget",
        ));
        assert!(!out.is_trivial());
        assert!(out.estimated_steps <= MAX_STEPS);
    }
}
