use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use aisle_core::domain::turn::{SafetyDirection, SafetyVerdict, UserId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SafetyError {
    #[error("safety classifier transport failure: {0}")]
    Transport(String),
    #[error("safety classifier returned status {0}")]
    Status(u16),
    #[error("safety classifier response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn classify(
        &self,
        user_id: UserId,
        text: &str,
        direction: SafetyDirection,
    ) -> Result<SafetyVerdict, SafetyError>;
}

#[derive(Debug, Serialize)]
struct RailRequest<'a> {
    user_id: UserId,
    query: &'a str,
}

#[derive(Debug, Deserialize)]
struct RailResponse {
    #[serde(default)]
    content: String,
}

/// Rails service client: text is allowed iff the service echoes it back unchanged.
pub struct HttpSafetyClassifier {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSafetyClassifier {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SafetyError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| SafetyError::Transport(error.to_string()))?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl SafetyClassifier for HttpSafetyClassifier {
    async fn classify(
        &self,
        user_id: UserId,
        text: &str,
        direction: SafetyDirection,
    ) -> Result<SafetyVerdict, SafetyError> {
        let url = format!("{}/rail/{}/check", self.base_url, direction.as_str());
        let response = self
            .http
            .post(url)
            .json(&RailRequest { user_id, query: text })
            .send()
            .await
            .map_err(|error| SafetyError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(SafetyError::Status(response.status().as_u16()));
        }

        let body = response
            .json::<RailResponse>()
            .await
            .map_err(|error| SafetyError::Decode(error.to_string()))?;
        Ok(verdict_from_echo(text, &body.content, direction))
    }
}

fn verdict_from_echo(sent: &str, returned: &str, direction: SafetyDirection) -> SafetyVerdict {
    if returned == sent {
        SafetyVerdict::allow()
    } else {
        SafetyVerdict::block(format!("{}_rail_rewrote_content", direction.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: String, user_message: String },
    /// Classifier unavailable; treated as allowed.
    Degrade { reason_code: &'static str },
}

impl GuardrailDecision {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degrade { .. })
    }
}

/// Wraps the classifier with the per-call deadline and the fail-open policy.
#[derive(Clone)]
pub struct SafetyGate {
    classifier: Arc<dyn SafetyClassifier>,
    timeout: Duration,
    unsafe_message: String,
}

impl SafetyGate {
    pub fn new(
        classifier: Arc<dyn SafetyClassifier>,
        timeout: Duration,
        unsafe_message: impl Into<String>,
    ) -> Self {
        Self { classifier, timeout, unsafe_message: unsafe_message.into() }
    }

    pub async fn check(
        &self,
        user_id: UserId,
        text: &str,
        direction: SafetyDirection,
    ) -> GuardrailDecision {
        let outcome =
            tokio::time::timeout(self.timeout, self.classifier.classify(user_id, text, direction))
                .await;

        match outcome {
            Ok(Ok(verdict)) if verdict.allowed => GuardrailDecision::Allow,
            Ok(Ok(verdict)) => GuardrailDecision::Deny {
                reason_code: verdict.reason.unwrap_or_else(|| "blocked".to_string()),
                user_message: self.unsafe_message.clone(),
            },
            Ok(Err(error)) => {
                warn!(
                    event_name = "turn.rails.degraded",
                    user_id,
                    direction = direction.as_str(),
                    error = %error,
                    "safety classifier failed; allowing content"
                );
                GuardrailDecision::Degrade { reason_code: "classifier_error" }
            }
            Err(_) => {
                warn!(
                    event_name = "turn.rails.degraded",
                    user_id,
                    direction = direction.as_str(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "safety classifier timed out; allowing content"
                );
                GuardrailDecision::Degrade { reason_code: "classifier_timeout" }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use aisle_core::domain::turn::{SafetyDirection, SafetyVerdict, UserId};

    use super::{
        verdict_from_echo, GuardrailDecision, SafetyClassifier, SafetyError, SafetyGate,
    };

    enum Behavior {
        Verdict(SafetyVerdict),
        Fail,
        Hang,
    }

    struct ScriptedClassifier(Behavior);

    #[async_trait]
    impl SafetyClassifier for ScriptedClassifier {
        async fn classify(
            &self,
            _user_id: UserId,
            _text: &str,
            _direction: SafetyDirection,
        ) -> Result<SafetyVerdict, SafetyError> {
            match &self.0 {
                Behavior::Verdict(verdict) => Ok(verdict.clone()),
                Behavior::Fail => Err(SafetyError::Status(503)),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(SafetyVerdict::allow())
                }
            }
        }
    }

    fn gate(behavior: Behavior) -> SafetyGate {
        SafetyGate::new(
            Arc::new(ScriptedClassifier(behavior)),
            Duration::from_millis(50),
            "Sorry, I cannot help with that.",
        )
    }

    #[tokio::test]
    async fn blocked_verdict_denies_with_fallback_message() {
        let decision = gate(Behavior::Verdict(SafetyVerdict::block("policy")))
            .check(7, "something bad", SafetyDirection::Input)
            .await;

        assert_eq!(
            decision,
            GuardrailDecision::Deny {
                reason_code: "policy".to_string(),
                user_message: "Sorry, I cannot help with that.".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn classifier_error_fails_open() {
        let decision = gate(Behavior::Fail).check(7, "hi", SafetyDirection::Output).await;

        assert_eq!(decision, GuardrailDecision::Degrade { reason_code: "classifier_error" });
        assert!(decision.is_degraded());
    }

    #[tokio::test]
    async fn classifier_timeout_fails_open() {
        let decision = gate(Behavior::Hang).check(7, "hi", SafetyDirection::Input).await;

        assert_eq!(decision, GuardrailDecision::Degrade { reason_code: "classifier_timeout" });
    }

    #[test]
    fn rewritten_echo_counts_as_block() {
        assert!(verdict_from_echo("hello", "hello", SafetyDirection::Input).allowed);

        let blocked = verdict_from_echo("hello", "I'm sorry, I can't respond to that.", SafetyDirection::Output);
        assert!(!blocked.allowed);
        assert_eq!(blocked.reason.as_deref(), Some("output_rail_rewrote_content"));
    }
}
