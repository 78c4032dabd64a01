//! In-memory item store that reports every committed mutation

use super::models::{Item, ItemCreate, ItemUpdate};
use crate::events::EventEmitter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Failures surfaced to the CRUD caller only; none of them produce events
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ItemError {
    #[error("{0}")]
    Validation(String),
    #[error("Item {0} not found")]
    NotFound(u64),
}

#[derive(Debug, Default)]
struct StoreState {
    items: BTreeMap<u64, Item>,
    last_id: u64,
}

/// Keyed item store
///
/// Every mutation is reported to the emitter while the write lock is still
/// held: the new state is already readable once the lock drops, and events
/// leave in the same order the mutations were committed.
pub struct ItemStore {
    state: RwLock<StoreState>,
    emitter: Arc<dyn EventEmitter>,
}

impl ItemStore {
    pub fn new(emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            emitter,
        }
    }

    /// Store pre-seeded with `Item 1`..`Item 3`; seeding emits nothing
    pub fn with_seed_data(emitter: Arc<dyn EventEmitter>) -> Self {
        let mut state = StoreState::default();
        for i in 1..=3u64 {
            state.items.insert(
                i,
                Item {
                    id: i,
                    name: format!("Item {}", i),
                    price: i as f64 * 10.0,
                    is_active: true,
                },
            );
            state.last_id = i;
        }
        Self {
            state: RwLock::new(state),
            emitter,
        }
    }

    pub async fn list(&self) -> Vec<Item> {
        self.state.read().await.items.values().cloned().collect()
    }

    pub async fn get(&self, id: u64) -> Result<Item, ItemError> {
        self.state
            .read()
            .await
            .items
            .get(&id)
            .cloned()
            .ok_or(ItemError::NotFound(id))
    }

    pub async fn create(&self, req: ItemCreate) -> Result<Item, ItemError> {
        req.validate().map_err(ItemError::Validation)?;

        let mut state = self.state.write().await;
        state.last_id += 1;
        let item = Item::from_create(state.last_id, req);
        state.items.insert(item.id, item.clone());
        self.emitter
            .emit_created(&item.id.to_string(), item.snapshot());
        drop(state);

        debug!(item_id = item.id, "Item created");
        Ok(item)
    }

    /// Full replacement (PUT)
    pub async fn replace(&self, id: u64, req: ItemCreate) -> Result<Item, ItemError> {
        req.validate().map_err(ItemError::Validation)?;

        let mut state = self.state.write().await;
        if !state.items.contains_key(&id) {
            return Err(ItemError::NotFound(id));
        }
        let item = Item::from_create(id, req);
        state.items.insert(id, item.clone());
        self.emitter.emit_updated(&id.to_string(), item.snapshot());
        drop(state);

        debug!(item_id = id, "Item replaced");
        Ok(item)
    }

    /// Partial update (PATCH)
    pub async fn patch(&self, id: u64, req: ItemUpdate) -> Result<Item, ItemError> {
        req.validate().map_err(ItemError::Validation)?;

        let mut state = self.state.write().await;
        let current = state.items.get(&id).ok_or(ItemError::NotFound(id))?;
        let item = current.apply(&req);
        state.items.insert(id, item.clone());
        self.emitter.emit_updated(&id.to_string(), item.snapshot());
        drop(state);

        debug!(item_id = id, "Item patched");
        Ok(item)
    }

    pub async fn delete(&self, id: u64) -> Result<Item, ItemError> {
        let mut state = self.state.write().await;
        let removed = state.items.remove(&id).ok_or(ItemError::NotFound(id))?;
        self.emitter.emit_deleted(&id.to_string());
        drop(state);

        debug!(item_id = id, "Item deleted");
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
