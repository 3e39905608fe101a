use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnState {
    Start,
    ContextLoaded,
    Routed,
    Dispatched,
    Generated,
    OutputChecked,
    Persisted,
    Done,
    InputBlocked,
    Cancelled,
    Failed,
}

impl TurnState {
    /// Absorbing states accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnEvent {
    LoadContext,
    BlockInput,
    Route,
    Dispatch,
    Generate,
    CheckOutput,
    Persist,
    Finish,
    Disconnect,
    Fail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: TurnState,
    pub to: TurnState,
    pub event: TurnEvent,
}
