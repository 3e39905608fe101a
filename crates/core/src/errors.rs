use thiserror::Error;

use crate::flows::TurnTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("turn has neither query text nor an image")]
    EmptyTurn,
    #[error(transparent)]
    TurnTransition(#[from] TurnTransitionError),
}

/// Failures that escape a turn and must be reported to the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{service} unavailable: {detail}")]
    Upstream { service: &'static str, detail: String },
    #[error("misconfigured: {0}")]
    Configuration(String),
}

/// How an error surfaces at the HTTP boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Rejected,
    Unavailable,
    Internal,
}

/// Caller-facing error. `detail` is for logs; clients only ever see [`InterfaceError::user_message`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{class:?} [{correlation_id}]: {detail}")]
pub struct InterfaceError {
    pub class: FailureClass,
    pub detail: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self.class {
            FailureClass::Rejected => "Please send a question or an image so I can help.",
            FailureClass::Unavailable => {
                "The shopping assistant is temporarily unavailable. Please retry shortly."
            }
            FailureClass::Internal => "Something went wrong on our side. Please try again.",
        }
    }
}

impl ApplicationError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Domain(DomainError::EmptyTurn) => FailureClass::Rejected,
            Self::Upstream { .. } => FailureClass::Unavailable,
            Self::Domain(DomainError::TurnTransition(_)) | Self::Configuration(_) => {
                FailureClass::Internal
            }
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        InterfaceError {
            class: self.class(),
            detail: self.to_string(),
            correlation_id: correlation_id.into(),
        }
    }
}
