//! Turn orchestration for the shopping assistant.
//!
//! A turn flows through the modules in this order:
//! 1. **Screening and routing** (`guardrails`, `router`) - the input check races the router
//! 2. **Capability dispatch** (`handlers`) - cart edits, catalog retrieval or plain chat
//! 3. **Generation** (`generator`) - the answer is streamed from the model and buffered
//! 4. **Output gate** (`guardrails`) - buffered text is released only when allowed
//! 5. **Memory** (`summary`) - the turn is folded into the stored context
//!
//! `runtime::TurnOrchestrator` drives the sequence and owns the turn state machine.
//!
//! The model only phrases answers and picks tools. Cart arithmetic and catalog matching
//! thresholds stay deterministic.

pub mod catalog;
pub mod conversation;
pub mod generator;
pub mod guardrails;
pub mod handlers;
pub mod llm;
pub mod prompts;
pub mod router;
pub mod runtime;
pub mod summary;
pub mod tools;

pub use catalog::{CatalogClient, CatalogError, CatalogQuery, HttpCatalogClient};
pub use guardrails::{GuardrailDecision, HttpSafetyClassifier, SafetyClassifier, SafetyGate};
pub use llm::{LlmClient, LlmError, OpenAiCompatibleClient};
pub use runtime::{
    CollectingSink, EventSink, TurnError, TurnOrchestrator, TurnReport, TurnSettings,
};
