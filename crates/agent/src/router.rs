use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use aisle_core::domain::cart::Cart;
use aisle_core::domain::turn::Capability;

use crate::llm::LlmClient;
use crate::prompts::PromptLibrary;

const ROUTING_MAX_TOKENS: u32 = 8;

/// Maps a raw model answer onto the closed capability set.
pub fn normalize_route(raw: &str) -> Option<Capability> {
    let lowered = raw.trim().to_ascii_lowercase();
    let first = lowered
        .split(|character: char| !(character.is_ascii_alphanumeric() || character == '_'))
        .find(|word| !word.is_empty())?;

    match first {
        "cart" | "cart_node" => Some(Capability::Cart),
        "retriever" | "search" | "product_finder" => Some(Capability::Retriever),
        "chatter" | "general" | "assistant" => Some(Capability::Chatter),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    pub capability: Capability,
    /// False when the model answer was unusable and the chatter default applied.
    pub from_model: bool,
}

pub struct Router {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    timeout: Duration,
}

impl Router {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptLibrary>, timeout: Duration) -> Self {
        Self { llm, prompts, timeout }
    }

    pub async fn route(
        &self,
        query: &str,
        has_image: bool,
        cart: &Cart,
        context: &str,
    ) -> RouteDecision {
        if has_image && query.trim().is_empty() {
            return RouteDecision { capability: Capability::Retriever, from_model: false };
        }

        let messages = match self.prompts.routing(query, cart, context) {
            Ok(messages) => messages,
            Err(error) => {
                warn!(event_name = "turn.route.prompt_failed", error = %error, "defaulting to chatter");
                return RouteDecision { capability: Capability::Chatter, from_model: false };
            }
        };

        let answer =
            tokio::time::timeout(self.timeout, self.llm.complete(&messages, ROUTING_MAX_TOKENS))
                .await;

        match answer {
            Ok(Ok(raw)) => match normalize_route(&raw) {
                Some(capability) => RouteDecision { capability, from_model: true },
                None => {
                    warn!(event_name = "turn.route.unrecognized", answer = %raw, "defaulting to chatter");
                    RouteDecision { capability: Capability::Chatter, from_model: false }
                }
            },
            Ok(Err(error)) => {
                warn!(event_name = "turn.route.failed", error = %error, "defaulting to chatter");
                RouteDecision { capability: Capability::Chatter, from_model: false }
            }
            Err(_) => {
                warn!(event_name = "turn.route.timeout", "defaulting to chatter");
                RouteDecision { capability: Capability::Chatter, from_model: false }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use aisle_core::domain::turn::Capability;

    use super::normalize_route;

    #[test]
    fn synonyms_and_noise_are_normalized() {
        assert_eq!(normalize_route("cart"), Some(Capability::Cart));
        assert_eq!(normalize_route("  Retriever.\n"), Some(Capability::Retriever));
        assert_eq!(normalize_route("search"), Some(Capability::Retriever));
        assert_eq!(normalize_route("product_finder"), Some(Capability::Retriever));
        assert_eq!(normalize_route("cart_node"), Some(Capability::Cart));
        assert_eq!(normalize_route("General question"), Some(Capability::Chatter));
        assert_eq!(normalize_route("assistant"), Some(Capability::Chatter));
    }

    #[test]
    fn unknown_or_empty_answers_have_no_route() {
        assert_eq!(normalize_route("checkout"), None);
        assert_eq!(normalize_route(""), None);
        assert_eq!(normalize_route("   \n"), None);
    }
}
