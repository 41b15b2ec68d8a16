use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::events::EventSink;

/// Phases of one orchestrator run.
///
/// ```text
/// Idle -> Preparing -> ResolvingVersions -> {InstallingFresh | ApplyingDiffChain | UpToDate}
///      -> EnsuringRuntimeDeps -> [Launching] -> Done
/// ```
/// `Cancelled` and `Error` are reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Preparing,
    ResolvingVersions,
    InstallingFresh,
    ApplyingDiffChain,
    UpToDate,
    EnsuringRuntimeDeps,
    Launching,
    Done,
    Cancelled,
    Error,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }

    pub fn can_transition_to(self, next: UpdateState) -> bool {
        use UpdateState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Error) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, ResolvingVersions)
                | (ResolvingVersions, InstallingFresh)
                | (ResolvingVersions, ApplyingDiffChain)
                | (ResolvingVersions, UpToDate)
                | (InstallingFresh, EnsuringRuntimeDeps)
                | (ApplyingDiffChain, EnsuringRuntimeDeps)
                | (UpToDate, EnsuringRuntimeDeps)
                | (EnsuringRuntimeDeps, Launching)
                | (EnsuringRuntimeDeps, Done)
                | (Launching, Done)
        )
    }
}

/// Current state of a run; every accepted transition is published as a
/// `StateChanged` event.
#[derive(Debug)]
pub struct StateMachine {
    state: UpdateState,
    events: EventSink,
}

impl StateMachine {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: UpdateState::Idle,
            events,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn advance(&mut self, next: UpdateState) -> UpdaterResult<()> {
        self.advance_with_code(next, None)
    }

    pub fn advance_with_code(
        &mut self,
        next: UpdateState,
        exit_code: Option<i32>,
    ) -> UpdaterResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(UpdaterError::Other(format!(
                "Illegal update state transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("Update state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.events.state_changed(next, exit_code);
        Ok(())
    }
}
