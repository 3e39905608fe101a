use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::cart::Cart;
use crate::errors::DomainError;

pub type UserId = i64;

fn default_guardrails() -> bool {
    true
}

/// Ingress payload for a single turn.
///
/// `context` and `cart` are the client's copy and are accepted for wire compatibility only.
/// Turns start from the context store, or from an empty context when it is unreachable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub cart: Cart,
    #[serde(default)]
    pub retrieved: BTreeMap<String, String>,
    #[serde(default = "default_guardrails")]
    pub guardrails: bool,
}

impl TurnRequest {
    pub fn new(user_id: UserId, query: impl Into<String>) -> Self {
        Self {
            user_id,
            query: query.into(),
            image: None,
            context: String::new(),
            cart: Cart::default(),
            retrieved: BTreeMap::new(),
            guardrails: true,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_guardrails(mut self, enabled: bool) -> Self {
        self.guardrails = enabled;
        self
    }

    pub fn has_query(&self) -> bool {
        !self.query.trim().is_empty()
    }

    pub fn has_image(&self) -> bool {
        self.image.as_deref().map(|image| !image.trim().is_empty()).unwrap_or(false)
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref().filter(|image| !image.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.has_query() && !self.has_image() {
            return Err(DomainError::EmptyTurn);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Cart,
    Retriever,
    Chatter,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Cart, Capability::Retriever, Capability::Chatter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cart => "cart",
            Self::Retriever => "retriever",
            Self::Chatter => "chatter",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Content(String),
    Images(BTreeMap<String, String>),
    Done,
}

impl StreamEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyDirection {
    Input,
    Output,
}

impl SafetyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

/// A ranked catalog record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductHit {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub score: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Memory,
    Planner,
    Rails,
    Cart,
    Retriever,
    Chatter,
    Summarizer,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Planner => "planner",
            Self::Rails => "rails",
            Self::Cart => "cart",
            Self::Retriever => "retriever",
            Self::Chatter => "chatter",
            Self::Summarizer => "summarizer",
        }
    }
}

/// Elapsed seconds per pipeline stage, plus the stages that fell back to a degraded default.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimingRecord {
    timings: BTreeMap<String, f64>,
    degraded: BTreeSet<String>,
}

impl TimingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repeated stages accumulate, so both safety checks land under `rails`.
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        *self.timings.entry(stage.as_str().to_string()).or_insert(0.0) += elapsed.as_secs_f64();
    }

    pub fn mark_degraded(&mut self, stage: Stage) {
        self.degraded.insert(stage.as_str().to_string());
    }

    pub fn set_total(&mut self, elapsed: Duration) {
        self.timings.insert("total".to_string(), elapsed.as_secs_f64());
    }

    pub fn seconds(&self, stage: Stage) -> Option<f64> {
        self.timings.get(stage.as_str()).copied()
    }

    pub fn is_degraded(&self, stage: Stage) -> bool {
        self.degraded.contains(stage.as_str())
    }

    pub fn timings(&self) -> &BTreeMap<String, f64> {
        &self.timings
    }

    pub fn degraded(&self) -> &BTreeSet<String> {
        &self.degraded
    }
}
