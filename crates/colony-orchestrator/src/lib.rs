pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod plan_store;
pub mod planner;
pub mod review;
pub mod runtime_config;
pub mod traits;

pub use classifier::{Classifier, ClassifierOutput};
pub use config::{ApprovalMode, OrchestratorConfig};
pub use orchestrator::Orchestrator;
pub use planner::{Planner, PlannerOutput, PlannerTask};
pub use review::ReviewDecision;
pub use runtime_config::RuntimeConfig;
pub use traits::{
    AlwaysAliveLiveness, FundingProtocol, LocalWorkerExecutor, NullFundingProtocol, WorkerExecutor,
    WorkerLiveness,
};
