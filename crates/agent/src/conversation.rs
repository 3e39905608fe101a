use serde_json::Value;

use crate::llm::ToolCall;
use crate::tools::{ADD_TO_CART, REMOVE_FROM_CART, VIEW_CART};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CartOperation {
    Add,
    Remove,
}

impl CartOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Structured cart instruction decoded from a tool call or, failing that, from the raw text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CartIntent {
    Mutate { operation: CartOperation, item_reference: String, quantity: u32, confidence: u8 },
    View { confidence: u8 },
    Unrecognized { reason: String },
}

impl CartIntent {
    pub fn confidence(&self) -> u8 {
        match self {
            Self::Mutate { confidence, .. } | Self::View { confidence } => *confidence,
            Self::Unrecognized { .. } => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Mutate { operation, .. } => operation.as_str(),
            Self::View { .. } => "view",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn from_tool_call(call: &ToolCall) -> Self {
        let operation = match call.name.as_str() {
            ADD_TO_CART => CartOperation::Add,
            REMOVE_FROM_CART => CartOperation::Remove,
            VIEW_CART => return Self::View { confidence: 100 },
            other => return Self::Unrecognized { reason: format!("unknown tool `{other}`") },
        };

        let item_reference = call
            .arguments
            .get("item_name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|item| !item.is_empty());
        let Some(item_reference) = item_reference else {
            return Self::Unrecognized {
                reason: format!("`{}` call is missing item_name", call.name),
            };
        };

        let (quantity, quantity_given) = match parse_quantity(call.arguments.get("quantity")) {
            Some(quantity) => (quantity, true),
            None => (1, false),
        };

        Self::Mutate {
            operation,
            item_reference: item_reference.to_string(),
            quantity,
            confidence: confidence_score(true, true, quantity_given),
        }
    }
}

/// Quantities below one are treated as one.
fn parse_quantity(value: Option<&Value>) -> Option<u32> {
    let value = value?;
    let quantity = match value {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|f| f as i64))?,
        Value::String(raw) => raw.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Some(u32::try_from(quantity.max(1)).unwrap_or(u32::MAX))
}

/// Keyword extraction used when the model does not produce a usable tool call.
#[derive(Clone, Debug, Default)]
pub struct CartIntentExtractor;

impl CartIntentExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> CartIntent {
        let normalized_text = normalize_text(text);
        let tokens = tokenize(&normalized_text);

        let operation = detect_operation(&tokens);
        let quantity = extract_quantity(&tokens);

        match operation {
            None if is_view_request(&tokens) => CartIntent::View { confidence: 60 },
            None => CartIntent::Unrecognized {
                reason: "no cart verb found in the request".to_string(),
            },
            Some(operation) => {
                let item_reference = extract_item_phrase(&tokens);
                if item_reference.is_empty() {
                    return CartIntent::Unrecognized {
                        reason: format!("no item named for {}", operation.as_str()),
                    };
                }
                CartIntent::Mutate {
                    operation,
                    item_reference,
                    quantity: quantity.unwrap_or(1).max(1),
                    confidence: confidence_score(false, true, quantity.is_some()),
                }
            }
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() || matches!(character, '-' | '\'') {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

const ADD_VERBS: &[&str] = &["add", "put", "buy", "include", "get"];
const REMOVE_VERBS: &[&str] = &["remove", "delete", "drop", "take", "discard"];
const VIEW_WORDS: &[&str] = &["view", "show", "see", "what's", "whats", "list", "check"];
const FILLER_WORDS: &[&str] = &[
    "a", "an", "the", "my", "to", "from", "into", "in", "of", "out", "cart", "basket", "please",
    "can", "you", "could", "would", "i", "want", "some", "me", "pair", "pairs", "piece", "pieces",
];
const NUMBER_WORDS: &[(&str, u32)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
];

fn detect_operation(tokens: &[String]) -> Option<CartOperation> {
    tokens.iter().find_map(|token| {
        if ADD_VERBS.contains(&token.as_str()) {
            Some(CartOperation::Add)
        } else if REMOVE_VERBS.contains(&token.as_str()) {
            Some(CartOperation::Remove)
        } else {
            None
        }
    })
}

fn is_view_request(tokens: &[String]) -> bool {
    let mentions_cart = tokens.iter().any(|token| token == "cart" || token == "basket");
    mentions_cart && tokens.iter().any(|token| VIEW_WORDS.contains(&token.as_str()))
}

fn parse_quantity_token(token: &str) -> Option<u32> {
    token.parse::<u32>().ok().or_else(|| {
        NUMBER_WORDS.iter().find(|(word, _)| *word == token).map(|(_, value)| *value)
    })
}

fn extract_quantity(tokens: &[String]) -> Option<u32> {
    tokens.iter().find_map(|token| parse_quantity_token(token))
}

/// Everything after the verb that is not a quantity or filler, singularized naively.
fn extract_item_phrase(tokens: &[String]) -> String {
    let verb_position = tokens
        .iter()
        .position(|token| {
            ADD_VERBS.contains(&token.as_str()) || REMOVE_VERBS.contains(&token.as_str())
        })
        .map(|position| position + 1)
        .unwrap_or(0);

    tokens[verb_position..]
        .iter()
        .take_while(|token| !matches!(token.as_str(), "to" | "from" | "into" | "in"))
        .filter(|token| parse_quantity_token(token).is_none())
        .filter(|token| !FILLER_WORDS.contains(&token.as_str()))
        .map(|token| singularize(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn singularize(token: &str) -> String {
    if token.len() > 3 && token.ends_with("ses") {
        return token[..token.len() - 2].to_string();
    }
    if token.len() > 2 && token.ends_with('s') && !token.ends_with("ss") {
        return token[..token.len() - 1].to_string();
    }
    token.to_string()
}

fn confidence_score(from_tool_call: bool, has_item: bool, has_quantity: bool) -> u8 {
    let mut score = 20u8;
    if from_tool_call {
        score += 40;
    }
    if has_item {
        score += 25;
    }
    if has_quantity {
        score += 15;
    }
    score.min(100)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CartIntent, CartIntentExtractor, CartOperation};
    use crate::llm::ToolCall;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall { name: name.to_string(), arguments }
    }

    #[test]
    fn add_tool_call_becomes_mutation() {
        let intent = CartIntent::from_tool_call(&call(
            "add_to_cart",
            json!({"item_name": "blue shirt", "quantity": 2}),
        ));

        assert_eq!(
            intent,
            CartIntent::Mutate {
                operation: CartOperation::Add,
                item_reference: "blue shirt".to_string(),
                quantity: 2,
                confidence: 100,
            }
        );
    }

    #[test]
    fn non_positive_and_missing_quantities_become_one() {
        let zero = CartIntent::from_tool_call(&call(
            "remove_from_cart",
            json!({"item_name": "tote bag", "quantity": 0}),
        ));
        assert!(matches!(zero, CartIntent::Mutate { quantity: 1, .. }));

        let missing = CartIntent::from_tool_call(&call("add_to_cart", json!({"item_name": "hat"})));
        assert!(matches!(missing, CartIntent::Mutate { quantity: 1, confidence: 85, .. }));

        let textual = CartIntent::from_tool_call(&call(
            "add_to_cart",
            json!({"item_name": "hat", "quantity": "3"}),
        ));
        assert!(matches!(textual, CartIntent::Mutate { quantity: 3, .. }));
    }

    #[test]
    fn unknown_tool_or_missing_item_is_unrecognized() {
        let unknown = CartIntent::from_tool_call(&call("checkout", json!({})));
        assert!(matches!(unknown, CartIntent::Unrecognized { .. }));
        assert_eq!(unknown.confidence(), 0);

        let no_item = CartIntent::from_tool_call(&call("add_to_cart", json!({"quantity": 1})));
        assert!(matches!(no_item, CartIntent::Unrecognized { .. }));
    }

    #[test]
    fn view_tool_ignores_arguments() {
        let intent = CartIntent::from_tool_call(&call("view_cart", json!({"anything": true})));
        assert_eq!(intent, CartIntent::View { confidence: 100 });
        assert_eq!(intent.label(), "view");
    }

    #[test]
    fn extractor_reads_quantity_and_item_from_plain_text() {
        let extractor = CartIntentExtractor::new();

        let intent = extractor.extract("Add 2 blue shirts to my cart");
        assert_eq!(
            intent,
            CartIntent::Mutate {
                operation: CartOperation::Add,
                item_reference: "blue shirt".to_string(),
                quantity: 2,
                confidence: 60,
            }
        );

        let removal = extractor.extract("please remove the tote bag from the cart");
        assert!(matches!(
            removal,
            CartIntent::Mutate { operation: CartOperation::Remove, quantity: 1, ref item_reference, .. }
                if item_reference == "tote bag"
        ));
    }

    #[test]
    fn extractor_handles_number_words_and_views() {
        let extractor = CartIntentExtractor::new();

        assert!(matches!(
            extractor.extract("put three dresses in the basket"),
            CartIntent::Mutate { quantity: 3, ref item_reference, .. } if item_reference == "dress"
        ));
        assert_eq!(extractor.extract("what's in my cart?"), CartIntent::View { confidence: 60 });
        assert!(matches!(extractor.extract("hello there"), CartIntent::Unrecognized { .. }));
    }
}
