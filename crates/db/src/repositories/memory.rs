use std::collections::HashMap;

use tokio::sync::RwLock;

use aisle_core::domain::turn::UserId;

use super::{ContextRepository, RepositoryError, StoredContext};

#[derive(Default)]
pub struct InMemoryContextRepository {
    entries: RwLock<HashMap<UserId, StoredContext>>,
}

impl InMemoryContextRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn get(&self, user_id: UserId) -> Result<StoredContext, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&user_id).cloned().unwrap_or_default())
    }

    async fn put(&self, user_id: UserId, stored: &StoredContext) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert(user_id, stored.clone());
        Ok(())
    }

    async fn clear(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.remove(&user_id);
        Ok(())
    }
}
