pub mod engine;
pub mod states;

pub use engine::{TurnFlow, TurnMachine, TurnTransitionError};
pub use states::{TransitionOutcome, TurnEvent, TurnState};
