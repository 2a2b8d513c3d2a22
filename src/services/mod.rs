pub mod evaluator;
pub mod instance_selector;
pub mod log_parser;
pub mod outcome_classifier;
pub mod patch_applicator;
pub mod retry;
pub mod run_state;
pub mod run_summary;
pub mod scheduler;
pub mod shell;
pub mod test_runner;

pub use evaluator::{Evaluator, InstanceOutcome};
pub use instance_selector::{select_instances, PredictionSet, Selection};
pub use outcome_classifier::{classify, Classification};
pub use patch_applicator::{inspect_patch, ApplyResult, PatchApplicator, PatchShape};
pub use retry::{Attempted, RetryPolicy};
pub use run_state::{RunEvent, RunState, RunStats, WorkerSlot};
pub use run_summary::{summarize, RunSummary};
pub use scheduler::{RunOutcome, RunPlan, Scheduler, WorkItem};
pub use test_runner::TestRunner;
