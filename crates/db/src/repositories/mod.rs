use async_trait::async_trait;
use thiserror::Error;

use aisle_core::domain::cart::Cart;
use aisle_core::domain::turn::UserId;

pub mod context;
pub mod memory;

pub use context::SqlContextRepository;
pub use memory::InMemoryContextRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Per-user conversation summary and cart, as persisted between turns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredContext {
    pub context: String,
    pub cart: Cart,
}

impl StoredContext {
    pub fn new(context: impl Into<String>, cart: Cart) -> Self {
        Self { context: context.into(), cart }
    }
}

/// Keyed storage for [`StoredContext`]. Unknown users read back as empty.
#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn get(&self, user_id: UserId) -> Result<StoredContext, RepositoryError>;
    /// Replaces both the context text and the full cart for `user_id`.
    async fn put(&self, user_id: UserId, stored: &StoredContext) -> Result<(), RepositoryError>;
    async fn clear(&self, user_id: UserId) -> Result<(), RepositoryError>;
}
