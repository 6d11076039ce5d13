//! In-process message store

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::message::Message;
use crate::store::{MessageStore, StoreRecord};
use crate::{Error, Result};

/// Map-backed message store
///
/// State lives in this process only unless written out with
/// [`InMemoryStore::persist`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    store: RwLock<HashMap<String, Vec<Message>>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InMemoryState {
    #[serde(default)]
    store: HashMap<String, Vec<Message>>,
}

#[derive(Serialize)]
struct InMemoryStateRef<'a> {
    store: &'a HashMap<String, Vec<Message>>,
}

impl InMemoryStore {
    pub const CLASS_NAME: &'static str = "in_memory";

    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store ready to be shared between memories
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a store pre-filled with messages
    ///
    /// Keys are only kept while they hold at least one message.
    pub fn with_messages(mut messages: HashMap<String, Vec<Message>>) -> Self {
        messages.retain(|_, messages| !messages.is_empty());
        Self {
            store: RwLock::new(messages),
        }
    }

    /// Rebuild a store from its serialized record
    pub fn from_record(record: &StoreRecord) -> Result<Self> {
        let state: InMemoryState = record.state_as()?;
        Ok(Self::with_messages(state.store))
    }

    /// Write the full store as JSON
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = self.store.read().map_err(Error::poisoned)?;
        let json = serde_json::to_string(&*store)?;
        std::fs::write(path, json)?;
        info!("Persisted {} chat keys to {}", store.len(), path.display());
        Ok(())
    }

    /// Load a store previously written with [`InMemoryStore::persist`]
    ///
    /// A missing file yields an empty store.
    pub fn from_persist_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No persisted store at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let store: HashMap<String, Vec<Message>> = serde_json::from_str(&content)?;
        Ok(Self::with_messages(store))
    }
}

impl MessageStore for InMemoryStore {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn set_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        let mut store = self.store.write().map_err(Error::poisoned)?;
        debug!("Set {} messages for key: {}", messages.len(), key);
        if messages.is_empty() {
            store.remove(key);
        } else {
            store.insert(key.to_string(), messages);
        }
        Ok(())
    }

    fn get_messages(&self, key: &str) -> Result<Vec<Message>> {
        let store = self.store.read().map_err(Error::poisoned)?;
        Ok(store.get(key).cloned().unwrap_or_default())
    }

    fn add_message(&self, key: &str, message: Message) -> Result<()> {
        let mut store = self.store.write().map_err(Error::poisoned)?;
        store.entry(key.to_string()).or_default().push(message);
        Ok(())
    }

    fn add_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut store = self.store.write().map_err(Error::poisoned)?;
        debug!("Appending {} messages to key: {}", messages.len(), key);
        store.entry(key.to_string()).or_default().extend(messages);
        Ok(())
    }

    fn delete_messages(&self, key: &str) -> Result<Option<Vec<Message>>> {
        let mut store = self.store.write().map_err(Error::poisoned)?;
        Ok(store.remove(key))
    }

    fn delete_message(&self, key: &str, idx: usize) -> Result<Option<Message>> {
        let mut store = self.store.write().map_err(Error::poisoned)?;
        let Some(messages) = store.get_mut(key) else {
            return Ok(None);
        };
        if idx >= messages.len() {
            return Ok(None);
        }
        let removed = messages.remove(idx);
        if messages.is_empty() {
            store.remove(key);
        }
        Ok(Some(removed))
    }

    fn delete_last_message(&self, key: &str) -> Result<Option<Message>> {
        let mut store = self.store.write().map_err(Error::poisoned)?;
        let Some(messages) = store.get_mut(key) else {
            return Ok(None);
        };
        let removed = messages.pop();
        if messages.is_empty() {
            store.remove(key);
        }
        Ok(removed)
    }

    fn get_keys(&self) -> Result<Vec<String>> {
        let store = self.store.read().map_err(Error::poisoned)?;
        let mut keys: Vec<String> = store.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn to_record(&self) -> Result<StoreRecord> {
        let store = self.store.read().map_err(Error::poisoned)?;
        StoreRecord::new(Self::CLASS_NAME, &InMemoryStateRef { store: &*store })
    }
}
