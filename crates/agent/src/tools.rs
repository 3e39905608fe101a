use serde_json::{json, Value};

use crate::llm::ToolSpec;

pub const ADD_TO_CART: &str = "add_to_cart";
pub const REMOVE_FROM_CART: &str = "remove_from_cart";
pub const VIEW_CART: &str = "view_cart";
pub const GET_CATEGORIES: &str = "get_categories";
pub const SUMMARIZER: &str = "summarizer";

fn item_and_quantity(verb: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "item_name": {
                "type": "string",
                "description": "The name of the item. Must be from the chat history, or most recent user query."
            },
            "quantity": {
                "type": "integer",
                "description": format!("The number of items to {verb}.")
            }
        },
        "required": ["item_name", "quantity"]
    })
}

/// The three cart operations offered to the model in one call.
pub fn cart_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: ADD_TO_CART,
            description: "Tool to add items to the user's cart. These items must be proper nouns \
                          from the provided context."
                .to_string(),
            parameters: item_and_quantity("add to the cart"),
        },
        ToolSpec {
            name: REMOVE_FROM_CART,
            description: "Tool to remove items from the user's cart. These items must be proper \
                          nouns from the provided context."
                .to_string(),
            parameters: item_and_quantity("remove from the cart"),
        },
        ToolSpec {
            name: VIEW_CART,
            description: "Tool to report what is currently in the user's cart.".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        },
    ]
}

pub fn category_tool(categories: &[String]) -> ToolSpec {
    ToolSpec {
        name: GET_CATEGORIES,
        description: format!(
            "Identify the catalog categories relevant to the user's search. Available categories: {}.",
            categories.join(", ")
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "relevant_categories": {
                    "type": "array",
                    "description": "The most relevant categories that match the user's query from the provided list of categories.",
                    "items": {"type": "string", "enum": categories}
                }
            },
            "required": ["relevant_categories"]
        }),
    }
}

pub fn summary_tool() -> ToolSpec {
    ToolSpec {
        name: SUMMARIZER,
        description: "Tool that summarizes the context of the user's conversation.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "A short, but detailed summary of the provided context, including chat roles and item names."
                }
            },
            "required": ["summary"]
        }),
    }
}

/// Keeps only categories that are part of the configured set, preserving model order.
pub fn selected_categories(arguments: &Value, allowed: &[String]) -> Vec<String> {
    let mut selected = Vec::new();
    let requested = arguments.get("relevant_categories").and_then(Value::as_array);
    for value in requested.into_iter().flatten() {
        let Some(candidate) = value.as_str().map(|raw| raw.trim().to_ascii_lowercase()) else {
            continue;
        };
        if allowed.iter().any(|category| category.eq_ignore_ascii_case(&candidate))
            && !selected.contains(&candidate)
        {
            selected.push(candidate);
        }
    }
    selected
}

pub fn summary_text(arguments: &Value) -> Option<String> {
    arguments
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|summary| !summary.is_empty())
        .map(str::to_string)
}
