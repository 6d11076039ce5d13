//! Message store trait definition
//!
//! A message store maps a string key to an ordered list of messages.
//! Every operation is atomic with respect to its key; locking and
//! transactions are the backend's business.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::message::Message;
use crate::{Error, Result};

/// Serialized form of a store: its state plus the `class_name` discriminator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreRecord {
    /// Identifies which backend can rebuild this state
    pub class_name: String,
    /// Backend-specific state, flattened next to `class_name`
    #[serde(flatten)]
    pub state: Map<String, JsonValue>,
}

impl StoreRecord {
    /// Build a record from any serializable state object
    pub fn new<S: Serialize>(class_name: impl Into<String>, state: &S) -> Result<Self> {
        let class_name = class_name.into();
        match serde_json::to_value(state)? {
            JsonValue::Object(mut state) => {
                state.remove("class_name");
                Ok(Self { class_name, state })
            }
            other => Err(Error::Other(format!(
                "Store state for {} must be an object, got {}",
                class_name, other
            ))),
        }
    }

    /// Decode the backend-specific state
    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(JsonValue::Object(self.state.clone()))?)
    }
}

/// Keyed, ordered message storage
///
/// Reads on an unknown key return an empty list; writes to an unknown key
/// create it. The async methods default to running the blocking variant on
/// the calling task; backends with real I/O may override them.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Discriminator written into [`StoreRecord::class_name`]
    fn class_name(&self) -> &'static str;

    /// Replace the full message list for a key
    fn set_messages(&self, key: &str, messages: Vec<Message>) -> Result<()>;

    /// Get the full message list for a key, in insertion order
    fn get_messages(&self, key: &str) -> Result<Vec<Message>>;

    /// Append one message
    fn add_message(&self, key: &str, message: Message) -> Result<()>;

    /// Append a batch of messages; all of them land, in order, or none do
    fn add_messages(&self, key: &str, messages: Vec<Message>) -> Result<()>;

    /// Delete every message for a key, returning what was removed
    fn delete_messages(&self, key: &str) -> Result<Option<Vec<Message>>>;

    /// Delete the message at `idx`; `None` when out of range
    fn delete_message(&self, key: &str, idx: usize) -> Result<Option<Message>>;

    /// Delete the most recent message for a key
    fn delete_last_message(&self, key: &str) -> Result<Option<Message>>;

    /// All keys that currently hold at least one message
    fn get_keys(&self) -> Result<Vec<String>>;

    /// Serialize this store so it can be rebuilt through a registry
    fn to_record(&self) -> Result<StoreRecord>;

    async fn async_set_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        self.set_messages(key, messages)
    }

    async fn async_get_messages(&self, key: &str) -> Result<Vec<Message>> {
        self.get_messages(key)
    }

    async fn async_add_message(&self, key: &str, message: Message) -> Result<()> {
        self.add_message(key, message)
    }

    async fn async_add_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        self.add_messages(key, messages)
    }

    async fn async_delete_messages(&self, key: &str) -> Result<Option<Vec<Message>>> {
        self.delete_messages(key)
    }

    async fn async_delete_message(&self, key: &str, idx: usize) -> Result<Option<Message>> {
        self.delete_message(key, idx)
    }

    async fn async_delete_last_message(&self, key: &str) -> Result<Option<Message>> {
        self.delete_last_message(key)
    }

    async fn async_get_keys(&self) -> Result<Vec<String>> {
        self.get_keys()
    }
}
