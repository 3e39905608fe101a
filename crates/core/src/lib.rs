pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use domain::cart::{Cart, CartLine, ItemId, RemoveOutcome};
pub use domain::turn::{
    Capability, ProductHit, SafetyDirection, SafetyVerdict, Stage, StreamEvent, TimingRecord,
    TurnRequest, UserId,
};
pub use errors::{ApplicationError, DomainError, FailureClass, InterfaceError};
pub use flows::{TurnEvent, TurnFlow, TurnState, TurnTransitionError};
