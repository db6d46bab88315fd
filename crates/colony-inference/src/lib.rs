use async_trait::async_trait;
use colony_types::ColonyResult;

/// One turn of the message list handed to an `InferenceClient`.
#[derive(Debug, Clone)]
pub struct InferenceMessage {
    pub role: String,
    pub content: String,
}

impl InferenceMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Opaque provider/routing seam. The classifier, planner and compression
/// engine each speak to this trait and never to a concrete provider — the
/// core need only know that `complete` may fail, at which point every
/// caller substitutes its own deterministic heuristic.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, messages: &[InferenceMessage]) -> ColonyResult<String>;
}

/// The seam's shipped implementation: always declines. Classifier, planner
/// and the stage-3 summarizer all degrade to their own deterministic
/// heuristic the moment `complete` returns an error, so wiring this client
/// in by default makes every run exercise those heuristics deterministically
/// instead of depending on a live provider being configured.
pub struct HeuristicInferenceClient;

#[async_trait]
impl InferenceClient for HeuristicInferenceClient {
    async fn complete(&self, _messages: &[InferenceMessage]) -> ColonyResult<String> {
        Err(colony_types::ColonyError::InferenceFailure(
            "no inference provider configured; caller should fall back to its heuristic"
                .to_string(),
        ))
    }
}
