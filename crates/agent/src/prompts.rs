use tera::{Context, Tera};
use thiserror::Error;

use aisle_core::domain::cart::Cart;

use crate::llm::ChatMessage;

const ROUTER: &str = "router";
const CART: &str = "cart";
const CATEGORIES: &str = "categories";
const CHATTER: &str = "chatter";
const SUMMARY: &str = "summary";

const ROUTER_TEMPLATE: &str = "USER QUERY: {{ query }}
CART: {{ cart }}
PREVIOUS CONTEXT: {{ context }}";

const CART_TEMPLATE: &str = "USER QUERY: {{ query }}
CONTEXT: {{ context }}";

const CATEGORIES_TEMPLATE: &str = "User Query: '{{ query }}'
Categories: '{{ categories }}'";

const CHATTER_TEMPLATE: &str = "QUERY: {% if image_only %}'You have been sent an image, and the \
retrieved items are the most similar items.'{% else %}{{ query }}{% endif %}
PREVIOUS CONTEXT: {{ context }}
{%- if notes %}
CURRENT TURN: {{ notes }}{% endif %}
{%- if cart %}
CART: {{ cart }}{% endif %}
{%- if retrieved %}
PREVIOUSLY SHOWN: {{ retrieved }}{% endif %}";

const SUMMARY_TEMPLATE: &str = "CONTEXT TO SUMMARIZE:
{{ context }}";

const CART_SYSTEM: &str = "You are a retail agent that assists shoppers with their cart.
Only use the tools provided to help them.";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template `{name}` failed: {source}")]
    Template { name: &'static str, source: tera::Error },
}

/// Inputs for the user message of the answer-generation call.
#[derive(Clone, Debug, Default)]
pub struct ChatterPrompt<'a> {
    pub query: &'a str,
    pub image_only: bool,
    pub context: &'a str,
    pub notes: &'a str,
    pub cart: Option<&'a Cart>,
    pub retrieved: Option<String>,
}

pub struct PromptLibrary {
    tera: Tera,
    routing_prompt: String,
    chatter_prompt: String,
    summary_prompt: String,
}

impl PromptLibrary {
    pub fn new(
        routing_prompt: impl Into<String>,
        chatter_prompt: impl Into<String>,
        summary_prompt: impl Into<String>,
    ) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        let templates = [
            (ROUTER, ROUTER_TEMPLATE),
            (CART, CART_TEMPLATE),
            (CATEGORIES, CATEGORIES_TEMPLATE),
            (CHATTER, CHATTER_TEMPLATE),
            (SUMMARY, SUMMARY_TEMPLATE),
        ];
        for (name, body) in templates {
            tera.add_raw_template(name, body)
                .map_err(|source| PromptError::Template { name, source })?;
        }

        Ok(Self {
            tera,
            routing_prompt: routing_prompt.into(),
            chatter_prompt: chatter_prompt.into(),
            summary_prompt: summary_prompt.into(),
        })
    }

    fn render(&self, name: &'static str, context: &Context) -> Result<String, PromptError> {
        self.tera.render(name, context).map_err(|source| PromptError::Template { name, source })
    }

    pub fn routing(
        &self,
        query: &str,
        cart: &Cart,
        context: &str,
    ) -> Result<Vec<ChatMessage>, PromptError> {
        let mut values = Context::new();
        values.insert("query", query);
        values.insert("cart", &cart.describe());
        values.insert("context", context);
        Ok(vec![
            ChatMessage::system(self.routing_prompt.clone()),
            ChatMessage::user(self.render(ROUTER, &values)?),
        ])
    }

    pub fn cart(&self, query: &str, context: &str) -> Result<Vec<ChatMessage>, PromptError> {
        let mut values = Context::new();
        values.insert("query", query);
        values.insert("context", context);
        Ok(vec![ChatMessage::system(CART_SYSTEM), ChatMessage::user(self.render(CART, &values)?)])
    }

    pub fn categories(
        &self,
        query: &str,
        categories: &[String],
    ) -> Result<Vec<ChatMessage>, PromptError> {
        let mut values = Context::new();
        values.insert("query", query);
        values.insert("categories", &categories.join(", "));
        Ok(vec![ChatMessage::user(self.render(CATEGORIES, &values)?)])
    }

    pub fn chatter(&self, prompt: &ChatterPrompt<'_>) -> Result<Vec<ChatMessage>, PromptError> {
        let mut values = Context::new();
        values.insert("query", prompt.query);
        values.insert("image_only", &prompt.image_only);
        values.insert("context", prompt.context);
        values.insert("notes", prompt.notes);
        let cart = prompt.cart.filter(|cart| !cart.is_empty()).map(Cart::describe);
        values.insert("cart", &cart.unwrap_or_default());
        values.insert("retrieved", &prompt.retrieved.clone().unwrap_or_default());
        Ok(vec![
            ChatMessage::system(self.chatter_prompt.clone()),
            ChatMessage::user(self.render(CHATTER, &values)?),
        ])
    }

    pub fn summary(&self, context: &str) -> Result<Vec<ChatMessage>, PromptError> {
        let mut values = Context::new();
        values.insert("context", context);
        Ok(vec![
            ChatMessage::system(self.summary_prompt.clone()),
            ChatMessage::user(self.render(SUMMARY, &values)?),
        ])
    }
}

#[cfg(test)]
mod tests {
    use aisle_core::domain::cart::{Cart, ItemId};

    use super::{ChatterPrompt, PromptLibrary};
    use crate::llm::Role;

    fn library() -> PromptLibrary {
        PromptLibrary::new("route", "chat", "summarize").expect("templates parse")
    }

    #[test]
    fn chatter_prompt_omits_empty_sections() {
        let messages = library()
            .chatter(&ChatterPrompt {
                query: "any scarves?",
                context: "USER QUERY: hi",
                ..ChatterPrompt::default()
            })
            .expect("render");

        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "chat");
        assert_eq!(messages[1].content, "QUERY: any scarves?\nPREVIOUS CONTEXT: USER QUERY: hi");
    }

    #[test]
    fn chatter_prompt_includes_notes_cart_and_image_phrase() {
        let mut cart = Cart::new();
        cart.add(ItemId::from("tote_bag"), 1);

        let messages = library()
            .chatter(&ChatterPrompt {
                query: "",
                image_only: true,
                context: "",
                notes: "These products are available in the catalog:",
                cart: Some(&cart),
                retrieved: Some("Red Dress".to_string()),
            })
            .expect("render");

        let user = &messages[1].content;
        assert!(user.starts_with("QUERY: 'You have been sent an image"));
        assert!(user.contains("\nCURRENT TURN: These products are available in the catalog:"));
        assert!(user.contains("\nCART: The user has (1 tote_bag) in their cart"));
        assert!(user.ends_with("\nPREVIOUSLY SHOWN: Red Dress"));
    }

    #[test]
    fn routing_prompt_describes_cart() {
        let messages = library().routing("what's in my cart", &Cart::new(), "").expect("render");
        assert_eq!(messages[0].content, "route");
        assert!(messages[1].content.contains("CART: Your cart is empty."));
    }

    #[test]
    fn category_prompt_lists_choices() {
        let messages = library()
            .categories("red dress", &["bag".to_string(), "dress".to_string()])
            .expect("render");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "User Query: 'red dress'\nCategories: 'bag, dress'");
    }
}
