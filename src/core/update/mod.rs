pub mod orchestrator;
pub mod runtime;
pub mod state;

pub use orchestrator::{
    LaunchDecision, StepDownload, UpdateOrchestrator, UpdateOutcome, UpdateRequest, UpdateSummary,
};
pub use runtime::{ClientRuntimeCheck, GameLauncher, ProcessLauncher, RuntimeDependencies};
pub use state::{StateMachine, UpdateState};
