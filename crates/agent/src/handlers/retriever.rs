use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use aisle_core::domain::turn::{Capability, ProductHit};

use super::{CapabilityHandler, HandlerInput, HandlerOutput};
use crate::catalog::{CatalogClient, CatalogQuery};
use crate::llm::LlmClient;
use crate::prompts::PromptLibrary;
use crate::tools::{category_tool, selected_categories};

pub const NO_MATCHES_NOTE: &str =
    "Unfortunately there are no products closely matching the user's query.";
pub const CATALOG_UNAVAILABLE_NOTE: &str =
    "The catalog search could not find matches right now, so no products can be shown.";

#[derive(Clone, Debug)]
pub struct RetrieverSettings {
    pub categories: Vec<String>,
    pub top_k: usize,
    pub llm_timeout: Duration,
    pub catalog_timeout: Duration,
}

pub struct RetrieverHandler {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<dyn CatalogClient>,
    prompts: Arc<PromptLibrary>,
    settings: RetrieverSettings,
}

/// Renders ranked hits as the note handed to the generator.
pub fn describe_products(products: &[ProductHit]) -> String {
    if products.is_empty() {
        return NO_MATCHES_NOTE.to_string();
    }
    let lines = products
        .iter()
        .map(|hit| format!("{} (similarity: {:.2})", hit.description, hit.score))
        .collect::<Vec<_>>()
        .join("\n");
    format!("These products are available in the catalog:\n{lines}")
}

impl RetrieverHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        catalog: Arc<dyn CatalogClient>,
        prompts: Arc<PromptLibrary>,
        settings: RetrieverSettings,
    ) -> Self {
        Self { llm, catalog, prompts, settings }
    }

    /// Falls back to every configured category when the model picks none.
    async fn categories(&self, query: &str) -> Vec<String> {
        let all = self.settings.categories.clone();
        if query.trim().is_empty() {
            return all;
        }

        let messages = match self.prompts.categories(query, &self.settings.categories) {
            Ok(messages) => messages,
            Err(error) => {
                warn!(event_name = "turn.retriever.prompt_failed", error = %error, "using all categories");
                return all;
            }
        };
        let tool = [category_tool(&self.settings.categories)];

        match tokio::time::timeout(self.settings.llm_timeout, self.llm.call_tool(&messages, &tool))
            .await
        {
            Ok(Ok(call)) => {
                let selected = selected_categories(&call.arguments, &self.settings.categories);
                if selected.is_empty() {
                    all
                } else {
                    selected
                }
            }
            Ok(Err(error)) => {
                warn!(event_name = "turn.retriever.categories_failed", error = %error, "using all categories");
                all
            }
            Err(_) => {
                warn!(event_name = "turn.retriever.categories_timeout", "using all categories");
                all
            }
        }
    }
}

#[async_trait]
impl CapabilityHandler for RetrieverHandler {
    fn capability(&self) -> Capability {
        Capability::Retriever
    }

    async fn handle(&self, input: HandlerInput<'_>) -> HandlerOutput {
        let mut output = HandlerOutput::unchanged(input.cart);

        let query = match input.image {
            Some(image) => CatalogQuery::text(input.query, Vec::new(), self.settings.top_k)
                .with_image(image),
            None => {
                let categories = self.categories(input.query).await;
                CatalogQuery::text(input.query, categories, self.settings.top_k)
            }
        };

        let outcome =
            tokio::time::timeout(self.settings.catalog_timeout, self.catalog.search(&query)).await;
        match outcome {
            Ok(Ok(mut hits)) => {
                hits.truncate(self.settings.top_k);
                info!(
                    event_name = "turn.retriever.results",
                    user_id = input.user_id,
                    hits = hits.len(),
                    image = query.image.is_some(),
                    "catalog search completed"
                );
                output.notes = describe_products(&hits);
                output.products = hits;
            }
            Ok(Err(error)) => {
                warn!(event_name = "turn.retriever.catalog_failed", error = %error, "continuing without products");
                output.degraded = true;
                output.notes = CATALOG_UNAVAILABLE_NOTE.to_string();
            }
            Err(_) => {
                warn!(event_name = "turn.retriever.catalog_timeout", "continuing without products");
                output.degraded = true;
                output.notes = CATALOG_UNAVAILABLE_NOTE.to_string();
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use aisle_core::domain::cart::Cart;
    use aisle_core::domain::turn::ProductHit;

    use super::{describe_products, RetrieverHandler, RetrieverSettings, CATALOG_UNAVAILABLE_NOTE};
    use crate::catalog::{CatalogClient, CatalogError, CatalogQuery};
    use crate::handlers::{CapabilityHandler, HandlerInput};
    use crate::llm::{ChatMessage, FragmentStream, LlmClient, LlmError, ToolCall, ToolSpec};
    use crate::prompts::PromptLibrary;

    struct CategoryLlm;

    #[async_trait]
    impl LlmClient for CategoryLlm {
        async fn complete(&self, _: &[ChatMessage], _: u32) -> Result<String, LlmError> {
            Ok("retriever".to_string())
        }

        async fn call_tool(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ToolCall, LlmError> {
            Ok(ToolCall {
                name: "get_categories".to_string(),
                arguments: json!({"relevant_categories": ["dress"]}),
            })
        }

        async fn stream(&self, _: &[ChatMessage]) -> Result<FragmentStream, LlmError> {
            Err(LlmError::Transport("not used".to_string()))
        }
    }

    struct RecordingCatalog {
        result: Result<Vec<ProductHit>, CatalogError>,
        queries: Mutex<Vec<CatalogQuery>>,
    }

    #[async_trait]
    impl CatalogClient for RecordingCatalog {
        async fn search(&self, query: &CatalogQuery) -> Result<Vec<ProductHit>, CatalogError> {
            self.queries.lock().await.push(query.clone());
            self.result.clone()
        }
    }

    fn hit(name: &str, score: f32) -> ProductHit {
        ProductHit {
            id: name.to_lowercase(),
            name: name.to_string(),
            description: format!("{name}, flowing and bright"),
            image_url: format!("http://img/{}.png", name.to_lowercase()),
            score,
        }
    }

    fn handler(result: Result<Vec<ProductHit>, CatalogError>) -> (RetrieverHandler, Arc<RecordingCatalog>) {
        let catalog = Arc::new(RecordingCatalog { result, queries: Mutex::new(Vec::new()) });
        let handler = RetrieverHandler::new(
            Arc::new(CategoryLlm),
            catalog.clone(),
            Arc::new(PromptLibrary::new("route", "chat", "sum").expect("prompts")),
            RetrieverSettings {
                categories: vec!["bag".to_string(), "dress".to_string()],
                top_k: 4,
                llm_timeout: Duration::from_secs(1),
                catalog_timeout: Duration::from_secs(1),
            },
        );
        (handler, catalog)
    }

    async fn run(handler: &RetrieverHandler, query: &str, image: Option<&str>) -> super::HandlerOutput {
        let cart = Cart::new();
        let retrieved = BTreeMap::new();
        handler
            .handle(HandlerInput { user_id: 7, query, image, context: "", cart: &cart, retrieved: &retrieved })
            .await
    }

    #[test]
    fn product_note_lists_similarity_with_two_decimals() {
        let note = describe_products(&[hit("Red Dress", 0.934)]);
        assert_eq!(
            note,
            "These products are available in the catalog:\nRed Dress, flowing and bright (similarity: 0.93)"
        );
    }

    #[tokio::test]
    async fn text_query_uses_model_selected_categories() {
        let (handler, catalog) = handler(Ok(vec![hit("Red Dress", 0.9), hit("Crimson Gown", 0.85)]));

        let output = run(&handler, "show me red dresses", None).await;

        assert_eq!(output.products.len(), 2);
        assert_eq!(output.images().len(), 2);
        let queries = catalog.queries.lock().await;
        assert_eq!(queries[0].categories, vec!["dress".to_string()]);
        assert_eq!(queries[0].top_k, 4);
    }

    #[tokio::test]
    async fn image_query_ignores_categories() {
        let (handler, catalog) = handler(Ok(vec![hit("Tote", 0.7)]));

        run(&handler, "", Some("aGVsbG8=")).await;

        let queries = catalog.queries.lock().await;
        assert!(queries[0].categories.is_empty());
        assert_eq!(queries[0].image.as_deref(), Some("aGVsbG8="));
    }

    #[tokio::test]
    async fn catalog_failure_degrades_to_empty_products() {
        let (handler, _) = handler(Err(CatalogError::Status(503)));

        let output = run(&handler, "show me bags", None).await;

        assert!(output.degraded);
        assert!(output.products.is_empty());
        assert_eq!(output.notes, CATALOG_UNAVAILABLE_NOTE);
    }

    #[tokio::test]
    async fn empty_result_uses_no_match_note() {
        let (handler, _) = handler(Ok(Vec::new()));

        let output = run(&handler, "show me hats", None).await;

        assert!(!output.degraded);
        assert_eq!(
            output.notes,
            "Unfortunately there are no products closely matching the user's query."
        );
    }
}
