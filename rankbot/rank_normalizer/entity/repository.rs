use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::model::{Claim, EntityItem};

/// Errors raised while reading or editing entities. All of them end a run.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The request never produced a response.
    #[error("repository transport failed: {0}")]
    Transport(String),
    /// The API answered with an error object.
    #[error("repository api error {code}: {info}")]
    Api {
        /// Machine-readable error code.
        code: String,
        /// Human-readable description.
        info: String,
    },
    /// Replication lag did not clear within the allowed waits.
    #[error("repository still lagged after {waits} waits")]
    Lagged {
        /// Waits already spent.
        waits: u32,
    },
    /// The response did not have the expected shape.
    #[error("unexpected repository response: {0}")]
    Decode(String),
    /// Editing was attempted without credentials.
    #[error("editing requires an access token")]
    Unauthenticated,
}

/// One edit transaction: every demoted statement of one (entity, property) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEdit {
    /// Edited entity.
    pub entity_id: String,
    /// Revision the edit was computed against.
    pub base_revision: Option<u64>,
    /// Statement JSON to write.
    pub claims: Vec<Value>,
    /// Edit summary.
    pub summary: String,
}

impl EntityEdit {
    /// The `data` object submitted to the repository.
    #[must_use]
    pub fn payload(&self) -> Value {
        json!({ "claims": self.claims })
    }
}

/// What the repository reported after an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EditReceipt {
    /// Revision created by the edit.
    pub revision: Option<u64>,
}

/// Read/write access to entities.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Reads the current state of `id`. A missing entity is not an error.
    async fn load(&self, id: &str) -> Result<EntityItem, RepositoryError>;

    /// Submits `edit` as a single transaction.
    async fn submit(&self, edit: &EntityEdit) -> Result<EditReceipt, RepositoryError>;
}

/// In-memory repository applying edits to stored items; used by tests and
/// dry rehearsals.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    items: Mutex<HashMap<String, EntityItem>>,
    edits: Mutex<Vec<EntityEdit>>,
    loads: Mutex<Vec<String>>,
    reject_with: Option<String>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository whose edits all fail with API error `code`.
    #[must_use]
    pub fn rejecting(code: impl Into<String>) -> Self {
        Self {
            reject_with: Some(code.into()),
            ..Self::default()
        }
    }

    /// Stores or replaces an item.
    pub fn insert(&self, item: EntityItem) {
        self.items.lock().insert(item.id.clone(), item);
    }

    /// Current stored state of `id`.
    #[must_use]
    pub fn item(&self, id: &str) -> Option<EntityItem> {
        self.items.lock().get(id).cloned()
    }

    /// Edits accepted so far, in order.
    #[must_use]
    pub fn edits(&self) -> Vec<EntityEdit> {
        self.edits.lock().clone()
    }

    /// Identifiers loaded so far, in order.
    #[must_use]
    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().clone()
    }
}

#[async_trait]
impl EntityRepository for MemoryRepository {
    async fn load(&self, id: &str) -> Result<EntityItem, RepositoryError> {
        self.loads.lock().push(id.to_string());
        Ok(self
            .items
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| EntityItem::missing(id)))
    }

    async fn submit(&self, edit: &EntityEdit) -> Result<EditReceipt, RepositoryError> {
        if let Some(code) = &self.reject_with {
            return Err(RepositoryError::Api {
                code: code.clone(),
                info: "edit rejected by memory repository".into(),
            });
        }
        let mut items = self.items.lock();
        let item = items
            .get_mut(&edit.entity_id)
            .filter(|item| item.exists && !item.redirect)
            .ok_or_else(|| RepositoryError::Api {
                code: "no-such-entity".into(),
                info: format!("could not find entity {}", edit.entity_id),
            })?;
        if edit.base_revision.is_some() && edit.base_revision != item.last_revision {
            return Err(RepositoryError::Api {
                code: "editconflict".into(),
                info: format!("{} changed since revision {:?}", edit.entity_id, edit.base_revision),
            });
        }
        let mut updated = item.clone();
        for json in &edit.claims {
            let claim = Claim::from_json(json.clone())
                .map_err(|err| RepositoryError::Decode(err.to_string()))?;
            if !updated.replace_claim(claim) {
                return Err(RepositoryError::Api {
                    code: "no-such-claim".into(),
                    info: format!("statement not found on {}", edit.entity_id),
                });
            }
        }
        let revision = updated.last_revision.unwrap_or(0) + 1;
        updated.last_revision = Some(revision);
        *item = updated;
        drop(items);
        self.edits.lock().push(edit.clone());
        Ok(EditReceipt {
            revision: Some(revision),
        })
    }
}
