use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One entry of the wire representation used by the context store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub item: String,
    pub amount: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Decremented { remaining: u32 },
    /// The entry is gone; `removed` is what it held.
    Removed { removed: u32 },
    Absent,
}

/// Multiset of catalog items keyed by item id. Every stored quantity is at least one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CartWire", into = "CartWire")]
pub struct Cart {
    items: BTreeMap<ItemId, u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CartWire {
    #[serde(default)]
    contents: Vec<CartLine>,
}

impl From<CartWire> for Cart {
    fn from(wire: CartWire) -> Self {
        Cart::from_lines(wire.contents)
    }
}

impl From<Cart> for CartWire {
    fn from(cart: Cart) -> Self {
        CartWire { contents: cart.lines() }
    }
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cart from stored lines, merging duplicates and dropping zero amounts.
    pub fn from_lines<I>(lines: I) -> Self
    where
        I: IntoIterator<Item = CartLine>,
    {
        let mut cart = Self::new();
        for line in lines {
            cart.add(ItemId(line.item), line.amount);
        }
        cart
    }

    pub fn lines(&self) -> Vec<CartLine> {
        self.items
            .iter()
            .map(|(item, amount)| CartLine { item: item.0.clone(), amount: *amount })
            .collect()
    }

    pub fn quantity(&self, item: &ItemId) -> u32 {
        self.items.get(item).copied().unwrap_or(0)
    }

    /// Returns the quantity held after the addition.
    pub fn add(&mut self, item: ItemId, amount: u32) -> u32 {
        if amount == 0 {
            return self.quantity(&item);
        }
        let entry = self.items.entry(item).or_insert(0);
        *entry = entry.saturating_add(amount);
        *entry
    }

    /// Removing at least the held quantity deletes the entry; removing an absent item is a no-op.
    pub fn remove(&mut self, item: &ItemId, amount: u32) -> RemoveOutcome {
        let Some(current) = self.items.get_mut(item) else {
            return RemoveOutcome::Absent;
        };

        if amount >= *current {
            let removed = *current;
            self.items.remove(item);
            return RemoveOutcome::Removed { removed };
        }

        *current -= amount;
        RemoveOutcome::Decremented { remaining: *current }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn describe(&self) -> String {
        if self.is_empty() {
            return "Your cart is empty.".to_string();
        }

        self.items
            .iter()
            .map(|(item, amount)| format!("The user has ({amount} {item}) in their cart"))
            .collect::<Vec<_>>()
            .join(". ")
    }
}
