use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use aisle_core::domain::cart::Cart;
use aisle_core::domain::turn::{Capability, ProductHit, UserId};

pub mod cart;
pub mod chatter;
pub mod retriever;

pub use cart::CartHandler;
pub use chatter::ChatterHandler;
pub use retriever::RetrieverHandler;

/// Read-only view of the turn handed to a capability handler.
#[derive(Clone, Copy, Debug)]
pub struct HandlerInput<'a> {
    pub user_id: UserId,
    pub query: &'a str,
    pub image: Option<&'a str>,
    pub context: &'a str,
    pub cart: &'a Cart,
    pub retrieved: &'a BTreeMap<String, String>,
}

/// What a handler contributes to answer generation and persistence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandlerOutput {
    /// Facts for the generator, e.g. catalog matches or the cart change that was applied.
    pub notes: String,
    pub products: Vec<ProductHit>,
    pub cart: Cart,
    pub retrieved_hint: Option<String>,
    /// A collaborator failed and a fallback was used.
    pub degraded: bool,
}

impl HandlerOutput {
    pub fn unchanged(cart: &Cart) -> Self {
        Self { cart: cart.clone(), ..Self::default() }
    }

    /// Product name to image URL, as carried by the images stream event.
    pub fn images(&self) -> BTreeMap<String, String> {
        self.products.iter().map(|hit| (hit.name.clone(), hit.image_url.clone())).collect()
    }
}

/// Handlers degrade internally and never fail the turn.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    fn capability(&self) -> Capability;
    async fn handle(&self, input: HandlerInput<'_>) -> HandlerOutput;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Capability, Arc<dyn CapabilityHandler>>,
}

impl HandlerRegistry {
    pub fn register<H>(&mut self, handler: H)
    where
        H: CapabilityHandler + 'static,
    {
        self.handlers.insert(handler.capability(), Arc::new(handler));
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&capability).cloned()
    }

    pub fn is_complete(&self) -> bool {
        Capability::ALL.iter().all(|capability| self.handlers.contains_key(capability))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use aisle_core::domain::cart::Cart;
    use aisle_core::domain::turn::{Capability, ProductHit};

    use super::{ChatterHandler, HandlerInput, HandlerOutput, HandlerRegistry};

    #[test]
    fn registry_reports_completeness() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.is_empty());

        registry.register(ChatterHandler::new());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(Capability::Chatter).is_some());
        assert!(registry.get(Capability::Cart).is_none());
        assert!(!registry.is_complete());
    }

    #[test]
    fn images_map_names_to_urls() {
        let output = HandlerOutput {
            products: vec![ProductHit {
                id: "1".to_string(),
                name: "Red Dress".to_string(),
                description: "A red dress".to_string(),
                image_url: "http://img/1.png".to_string(),
                score: 0.9,
            }],
            ..HandlerOutput::default()
        };

        assert_eq!(output.images().get("Red Dress").map(String::as_str), Some("http://img/1.png"));
    }

    #[tokio::test]
    async fn chatter_forwards_hints_without_side_effects() {
        use super::CapabilityHandler;

        let mut cart = Cart::new();
        cart.add("tote_bag".into(), 1);
        let retrieved: BTreeMap<String, String> =
            [("Red Dress".to_string(), "http://img/1.png".to_string())].into_iter().collect();
        let input = HandlerInput {
            user_id: 7,
            query: "does it come in blue?",
            image: None,
            context: "",
            cart: &cart,
            retrieved: &retrieved,
        };

        let output = ChatterHandler::new().handle(input).await;

        assert_eq!(output.cart, cart);
        assert!(output.products.is_empty());
        assert_eq!(output.retrieved_hint.as_deref(), Some("Red Dress"));
    }
}
