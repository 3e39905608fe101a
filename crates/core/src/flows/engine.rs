use thiserror::Error;

use crate::flows::states::{TransitionOutcome, TurnEvent, TurnState};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnTransitionError {
    #[error("invalid turn transition from {state:?} using event {event:?}")]
    InvalidTransition { state: TurnState, event: TurnEvent },
}

/// Deterministic transition table for a single turn.
#[derive(Clone, Debug, Default)]
pub struct TurnFlow;

impl TurnFlow {
    pub fn initial_state(&self) -> TurnState {
        TurnState::Start
    }

    pub fn apply(
        &self,
        current: TurnState,
        event: TurnEvent,
    ) -> Result<TransitionOutcome, TurnTransitionError> {
        use TurnEvent::{
            BlockInput, CheckOutput, Disconnect, Dispatch, Fail, Finish, Generate, LoadContext,
            Persist, Route,
        };
        use TurnState::{
            Cancelled, ContextLoaded, Dispatched, Done, Failed, Generated, InputBlocked,
            OutputChecked, Persisted, Routed, Start,
        };

        let to = match (current, event) {
            (Start, LoadContext) => ContextLoaded,
            (ContextLoaded, BlockInput) => InputBlocked,
            (ContextLoaded, Route) => Routed,
            (Routed, Dispatch) => Dispatched,
            (Dispatched, Generate) => Generated,
            (Generated, CheckOutput) => OutputChecked,
            (OutputChecked, Persist) | (InputBlocked, Persist) => Persisted,
            (Persisted, Finish) => Done,
            (InputBlocked, Disconnect)
            | (Routed, Disconnect)
            | (Dispatched, Disconnect)
            | (Generated, Disconnect)
            | (OutputChecked, Disconnect) => Cancelled,
            (state, Fail) if !state.is_terminal() => Failed,
            _ => {
                return Err(TurnTransitionError::InvalidTransition { state: current, event });
            }
        };

        Ok(TransitionOutcome { from: current, to, event })
    }
}

/// Tracks the live state of one turn and the transitions it has taken.
#[derive(Clone, Debug)]
pub struct TurnMachine {
    flow: TurnFlow,
    state: TurnState,
    history: Vec<TransitionOutcome>,
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new(TurnFlow)
    }
}

impl TurnMachine {
    pub fn new(flow: TurnFlow) -> Self {
        let state = flow.initial_state();
        Self { flow, state, history: Vec::new() }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &[TransitionOutcome] {
        &self.history
    }

    pub fn advance(&mut self, event: TurnEvent) -> Result<TurnState, TurnTransitionError> {
        let outcome = self.flow.apply(self.state, event)?;
        self.state = outcome.to;
        self.history.push(outcome);
        Ok(self.state)
    }
}
