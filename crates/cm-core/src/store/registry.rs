//! Store registry for rebuilding serialized stores

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::store::{InMemoryStore, MessageStore, SqliteStore, StoreRecord};
use crate::{Error, Result};

/// Constructor that turns a record back into a live store
pub type StoreFactory = fn(&StoreRecord) -> Result<Arc<dyn MessageStore>>;

/// Maps `class_name` tags to store constructors
///
/// Only consulted when deserializing; memories hold their store directly.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry that knows the built-in stores
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(InMemoryStore::CLASS_NAME, build_in_memory);
        registry.register(SqliteStore::CLASS_NAME, build_sqlite);
        registry
    }

    /// Register a constructor
    ///
    /// If a constructor with the same tag already exists, it will be replaced.
    pub fn register(&mut self, class_name: impl Into<String>, factory: StoreFactory) {
        self.factories.insert(class_name.into(), factory);
    }

    /// Check if a tag is registered
    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Rebuild the store described by a record
    pub fn build(&self, record: &StoreRecord) -> Result<Arc<dyn MessageStore>> {
        let factory = self
            .factories
            .get(&record.class_name)
            .ok_or_else(|| Error::UnknownStore(record.class_name.clone()))?;
        debug!("Rebuilding {} store from record", record.class_name);
        factory(record)
    }
}

fn build_in_memory(record: &StoreRecord) -> Result<Arc<dyn MessageStore>> {
    Ok(Arc::new(InMemoryStore::from_record(record)?))
}

fn build_sqlite(record: &StoreRecord) -> Result<Arc<dyn MessageStore>> {
    Ok(Arc::new(SqliteStore::from_record(record)?))
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
