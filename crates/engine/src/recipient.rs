//! Recipient directory: where delivery addresses come from.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::Recipient;

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Recipient>, AppError>;
}

/// Directory backed by the `recipients` table.
#[derive(Clone)]
pub struct PgRecipientDirectory {
    pool: PgPool,
}

impl PgRecipientDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for PgRecipientDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Recipient>, AppError> {
        let recipient: Option<Recipient> = sqlx::query_as("SELECT * FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(recipient)
    }
}

/// Directory held in memory.
#[derive(Default)]
pub struct MemoryRecipientDirectory {
    recipients: RwLock<HashMap<Uuid, Recipient>>,
}

impl MemoryRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recipient: Recipient) {
        self.recipients.write().insert(recipient.id, recipient);
    }
}

#[async_trait]
impl RecipientDirectory for MemoryRecipientDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Recipient>, AppError> {
        Ok(self.recipients.read().get(&id).cloned())
    }
}
