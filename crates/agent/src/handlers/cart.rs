use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use aisle_core::domain::cart::{ItemId, RemoveOutcome};
use aisle_core::domain::turn::Capability;

use super::{CapabilityHandler, HandlerInput, HandlerOutput};
use crate::catalog::{CatalogClient, CatalogQuery};
use crate::conversation::{CartIntent, CartIntentExtractor, CartOperation};
use crate::llm::LlmClient;
use crate::prompts::PromptLibrary;
use crate::tools::cart_tools;

#[derive(Clone, Debug)]
pub struct CartSettings {
    pub categories: Vec<String>,
    pub similarity_threshold: f32,
    pub llm_timeout: Duration,
    pub catalog_timeout: Duration,
}

enum Resolution {
    Found(ItemId),
    NotFound,
    Unavailable,
}

pub struct CartHandler {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<dyn CatalogClient>,
    prompts: Arc<PromptLibrary>,
    extractor: CartIntentExtractor,
    settings: CartSettings,
}

impl CartHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        catalog: Arc<dyn CatalogClient>,
        prompts: Arc<PromptLibrary>,
        settings: CartSettings,
    ) -> Self {
        Self { llm, catalog, prompts, extractor: CartIntentExtractor::new(), settings }
    }

    /// Tool call first; keyword extraction when the model gives nothing usable.
    async fn interpret(&self, input: &HandlerInput<'_>) -> CartIntent {
        let from_model = match self.prompts.cart(input.query, input.context) {
            Ok(messages) => {
                let tools = cart_tools();
                match tokio::time::timeout(
                    self.settings.llm_timeout,
                    self.llm.call_tool(&messages, &tools),
                )
                .await
                {
                    Ok(Ok(call)) => Some(CartIntent::from_tool_call(&call)),
                    Ok(Err(error)) => {
                        warn!(event_name = "turn.cart.tool_call_failed", error = %error, "falling back to keyword extraction");
                        None
                    }
                    Err(_) => {
                        warn!(event_name = "turn.cart.tool_call_timeout", "falling back to keyword extraction");
                        None
                    }
                }
            }
            Err(error) => {
                warn!(event_name = "turn.cart.prompt_failed", error = %error, "falling back to keyword extraction");
                None
            }
        };

        match from_model {
            Some(intent @ (CartIntent::Mutate { .. } | CartIntent::View { .. })) => intent,
            _ => self.extractor.extract(input.query),
        }
    }

    /// Top-1 catalog lookup; the match must score strictly above the threshold.
    async fn resolve(&self, item_reference: &str) -> Resolution {
        let query = CatalogQuery::text(item_reference, self.settings.categories.clone(), 1);
        match tokio::time::timeout(self.settings.catalog_timeout, self.catalog.search(&query)).await
        {
            Ok(Ok(hits)) => match hits.into_iter().next() {
                Some(hit) if hit.score > self.settings.similarity_threshold => {
                    info!(
                        event_name = "turn.cart.item_resolved",
                        item_reference,
                        item = %hit.name,
                        score = f64::from(hit.score),
                        "catalog match accepted"
                    );
                    Resolution::Found(ItemId(hit.name))
                }
                _ => Resolution::NotFound,
            },
            Ok(Err(error)) => {
                warn!(event_name = "turn.cart.catalog_failed", error = %error, "cart item lookup failed");
                Resolution::Unavailable
            }
            Err(_) => {
                warn!(event_name = "turn.cart.catalog_timeout", "cart item lookup timed out");
                Resolution::Unavailable
            }
        }
    }
}

#[async_trait]
impl CapabilityHandler for CartHandler {
    fn capability(&self) -> Capability {
        Capability::Cart
    }

    async fn handle(&self, input: HandlerInput<'_>) -> HandlerOutput {
        let intent = self.interpret(&input).await;
        let mut output = HandlerOutput::unchanged(input.cart);
        info!(
            event_name = "turn.cart.intent",
            user_id = input.user_id,
            intent = intent.label(),
            confidence = intent.confidence(),
            "cart intent decoded"
        );

        match intent {
            CartIntent::View { .. } => {
                output.notes = output.cart.describe();
            }
            CartIntent::Unrecognized { reason } => {
                output.notes = format!(
                    "The cart request could not be understood ({reason}). {}",
                    output.cart.describe()
                );
            }
            CartIntent::Mutate { operation, item_reference, quantity, .. } => {
                let item = match self.resolve(&item_reference).await {
                    Resolution::Found(item) => item,
                    Resolution::NotFound => {
                        output.notes =
                            format!("No such item ({item_reference}) could be found in the catalog.");
                        return output;
                    }
                    Resolution::Unavailable => {
                        output.degraded = true;
                        output.notes = format!(
                            "The catalog could not be reached to look up ({item_reference}), so the cart was not changed."
                        );
                        return output;
                    }
                };

                output.notes = match operation {
                    CartOperation::Add => {
                        output.cart.add(item.clone(), quantity);
                        format!("Added {quantity} of '{item}' to cart")
                    }
                    CartOperation::Remove => match output.cart.remove(&item, quantity) {
                        RemoveOutcome::Absent => {
                            format!("'{item}' is not in the cart. {}", output.cart.describe())
                        }
                        RemoveOutcome::Removed { removed } => {
                            format!("Removed all {removed} of '{item}' from cart")
                        }
                        RemoveOutcome::Decremented { remaining } => {
                            format!("Removed {quantity} of '{item}' from cart, {remaining} left")
                        }
                    },
                };
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use aisle_core::domain::cart::{Cart, ItemId};
    use aisle_core::domain::turn::ProductHit;

    use super::{CartHandler, CartSettings};
    use crate::catalog::{CatalogClient, CatalogError, CatalogQuery};
    use crate::handlers::{CapabilityHandler, HandlerInput};
    use crate::llm::{ChatMessage, FragmentStream, LlmClient, LlmError, ToolCall, ToolSpec};
    use crate::prompts::PromptLibrary;

    struct ToolCallingLlm(Result<ToolCall, LlmError>);

    #[async_trait]
    impl LlmClient for ToolCallingLlm {
        async fn complete(&self, _: &[ChatMessage], _: u32) -> Result<String, LlmError> {
            Ok("cart".to_string())
        }

        async fn call_tool(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ToolCall, LlmError> {
            self.0.clone()
        }

        async fn stream(&self, _: &[ChatMessage]) -> Result<FragmentStream, LlmError> {
            Err(LlmError::Transport("not used".to_string()))
        }
    }

    struct OneHitCatalog {
        score: f32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogClient for OneHitCatalog {
        async fn search(&self, query: &CatalogQuery) -> Result<Vec<ProductHit>, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(query.top_k, 1);
            Ok(vec![ProductHit {
                id: "sku-1".to_string(),
                name: "blue_shirt".to_string(),
                description: "A blue shirt".to_string(),
                image_url: "http://img/blue.png".to_string(),
                score: self.score,
            }])
        }
    }

    fn handler(call: Result<ToolCall, LlmError>, score: f32) -> (CartHandler, Arc<OneHitCatalog>) {
        let catalog = Arc::new(OneHitCatalog { score, calls: AtomicUsize::new(0) });
        let prompts = Arc::new(PromptLibrary::new("route", "chat", "sum").expect("prompts"));
        let handler = CartHandler::new(
            Arc::new(ToolCallingLlm(call)),
            catalog.clone(),
            prompts,
            CartSettings {
                categories: vec!["shirt".to_string()],
                similarity_threshold: 0.8,
                llm_timeout: Duration::from_secs(1),
                catalog_timeout: Duration::from_secs(1),
            },
        );
        (handler, catalog)
    }

    fn add_call(item: &str, quantity: i64) -> Result<ToolCall, LlmError> {
        Ok(ToolCall {
            name: "add_to_cart".to_string(),
            arguments: json!({"item_name": item, "quantity": quantity}),
        })
    }

    async fn run(handler: &CartHandler, query: &str, cart: &Cart) -> super::HandlerOutput {
        let retrieved = BTreeMap::new();
        handler
            .handle(HandlerInput {
                user_id: 7,
                query,
                image: None,
                context: "",
                cart,
                retrieved: &retrieved,
            })
            .await
    }

    #[tokio::test]
    async fn add_above_threshold_mutates_cart() {
        let (handler, catalog) = handler(add_call("blue shirts", 2), 0.93);

        let output = run(&handler, "add 2 blue shirts to cart", &Cart::new()).await;

        assert_eq!(output.cart.quantity(&ItemId::from("blue_shirt")), 2);
        assert_eq!(output.notes, "Added 2 of 'blue_shirt' to cart");
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn match_at_threshold_is_rejected() {
        let (handler, _) = handler(add_call("blue shirts", 2), 0.8);

        let output = run(&handler, "add 2 blue shirts to cart", &Cart::new()).await;

        assert!(output.cart.is_empty());
        assert_eq!(output.notes, "No such item (blue shirts) could be found in the catalog.");
    }

    #[tokio::test]
    async fn removing_absent_item_reports_current_state() {
        let call = Ok(ToolCall {
            name: "remove_from_cart".to_string(),
            arguments: json!({"item_name": "blue shirt", "quantity": 1}),
        });
        let (handler, _) = handler(call, 0.95);
        let mut cart = Cart::new();
        cart.add(ItemId::from("tote_bag"), 1);

        let output = run(&handler, "remove the blue shirt", &cart).await;

        assert_eq!(output.cart, cart);
        assert!(output.notes.contains("The user has (1 tote_bag) in their cart"));
    }

    #[tokio::test]
    async fn oversized_remove_reports_the_amount_actually_held() {
        let call = Ok(ToolCall {
            name: "remove_from_cart".to_string(),
            arguments: json!({"item_name": "blue shirt", "quantity": 5}),
        });
        let (handler, _) = handler(call, 0.95);
        let mut cart = Cart::new();
        cart.add(ItemId::from("blue_shirt"), 2);

        let output = run(&handler, "remove 5 blue shirts", &cart).await;

        assert!(output.cart.is_empty());
        assert_eq!(output.notes, "Removed all 2 of 'blue_shirt' from cart");
    }

    #[tokio::test]
    async fn partial_remove_reports_what_is_left() {
        let call = Ok(ToolCall {
            name: "remove_from_cart".to_string(),
            arguments: json!({"item_name": "blue shirt", "quantity": 1}),
        });
        let (handler, _) = handler(call, 0.95);
        let mut cart = Cart::new();
        cart.add(ItemId::from("blue_shirt"), 3);

        let output = run(&handler, "remove a blue shirt", &cart).await;

        assert_eq!(output.cart.quantity(&ItemId::from("blue_shirt")), 2);
        assert_eq!(output.notes, "Removed 1 of 'blue_shirt' from cart, 2 left");
    }

    #[tokio::test]
    async fn tool_call_failure_falls_back_to_keyword_extraction() {
        let (handler, catalog) = handler(Err(LlmError::MissingToolCall), 0.9);

        let output = run(&handler, "add three blue shirts to my cart", &Cart::new()).await;

        assert_eq!(output.cart.quantity(&ItemId::from("blue_shirt")), 3);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn view_leaves_cart_untouched_and_skips_catalog() {
        let call = Ok(ToolCall { name: "view_cart".to_string(), arguments: json!({}) });
        let (handler, catalog) = handler(call, 0.9);

        let output = run(&handler, "what's in my cart", &Cart::new()).await;

        assert_eq!(output.notes, "Your cart is empty.");
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
    }
}
