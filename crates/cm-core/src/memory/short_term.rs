//! Short-term memory over a message store

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::memory::ChatMemory;
use crate::message::{estimate_tokens, Message, MessageRole};
use crate::store::{InMemoryStore, MessageStore, StoreRecord, StoreRegistry};
use crate::Result;

/// Key used when no conversation key is given
pub const DEFAULT_CHAT_STORE_KEY: &str = "chat_history";

fn default_chat_store_key() -> String {
    DEFAULT_CHAT_STORE_KEY.to_string()
}

/// Serialized configuration of a [`ShortTermMemory`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    /// The bound store, tagged with its `class_name`
    pub chat_store: StoreRecord,
    #[serde(default = "default_chat_store_key")]
    pub chat_store_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<usize>,
}

/// Chat history for one conversation key
///
/// Holds a shared store reference plus the bound key and nothing else, so
/// it needs no locking of its own. Several memories may share one store
/// as long as they use different keys.
#[derive(Clone)]
pub struct ShortTermMemory {
    store: Arc<dyn MessageStore>,
    key: String,
    /// Token budget for [`ChatMemory::get`] (None = whole history)
    token_limit: Option<usize>,
    /// Model handle kept for summarization; never serialized
    llm: Option<LlmConfig>,
}

impl ShortTermMemory {
    /// Bind a memory to a store and key
    pub fn new(store: Arc<dyn MessageStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            token_limit: None,
            llm: None,
        }
    }

    /// Create a memory over a fresh in-memory store and the default key
    pub fn in_memory() -> Self {
        Self::new(InMemoryStore::shared(), DEFAULT_CHAT_STORE_KEY)
    }

    /// Create an in-memory memory seeded with an initial history
    pub fn from_defaults(chat_history: Option<Vec<Message>>, llm: Option<LlmConfig>) -> Result<Self> {
        let memory = Self::in_memory();
        if let Some(history) = chat_history {
            memory.set(history)?;
        }
        Ok(memory.with_llm(llm))
    }

    /// Limit what [`ChatMemory::get`] returns to a token budget
    pub fn with_token_limit(mut self, token_limit: usize) -> Self {
        self.token_limit = Some(token_limit);
        self
    }

    /// Attach (or clear) the model handle
    pub fn with_llm(mut self, llm: Option<LlmConfig>) -> Self {
        self.llm = llm;
        self
    }

    /// The bound conversation key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn token_limit(&self) -> Option<usize> {
        self.token_limit
    }

    pub fn llm(&self) -> Option<&LlmConfig> {
        self.llm.as_ref()
    }

    /// Serialize the configuration, including the store's own state
    pub fn to_record(&self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            chat_store: self.store.to_record()?,
            chat_store_key: self.key.clone(),
            token_limit: self.token_limit,
        })
    }

    /// Rebuild a memory from a record, constructing its store via `registry`
    pub fn from_record(record: &MemoryRecord, registry: &StoreRegistry) -> Result<Self> {
        let store = registry.build(&record.chat_store)?;
        Ok(Self {
            store,
            key: record.chat_store_key.clone(),
            token_limit: record.token_limit,
            llm: None,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_record()?)?)
    }

    pub fn from_json(json: &str, registry: &StoreRegistry) -> Result<Self> {
        let record: MemoryRecord = serde_json::from_str(json)?;
        Self::from_record(&record, registry)
    }

    /// Trim the history to the newest messages that fit the budget
    fn window(&self, messages: Vec<Message>, input: Option<&str>, limit: usize) -> Vec<Message> {
        let initial = input.map(estimate_tokens).unwrap_or(0);
        if initial > limit {
            warn!(
                "Input alone ({} tokens) exceeds token limit {} for key: {}",
                initial, limit, self.key
            );
            return Vec::new();
        }

        let mut budget = limit - initial;
        let mut start = messages.len();
        while start > 0 {
            let cost = messages[start - 1].estimated_tokens();
            if cost > budget {
                break;
            }
            budget -= cost;
            start -= 1;
        }

        // Never open the window on a reply
        while start < messages.len()
            && matches!(
                messages[start].role,
                MessageRole::Assistant | MessageRole::Tool | MessageRole::Function
            )
        {
            start += 1;
        }

        let mut messages = messages;
        let window = messages.split_off(start);
        debug!(
            "Token window kept {} of {} messages for key: {}",
            window.len(),
            messages.len() + window.len(),
            self.key
        );
        window
    }
}

impl std::fmt::Debug for ShortTermMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShortTermMemory")
            .field("store", &self.store.class_name())
            .field("key", &self.key)
            .field("token_limit", &self.token_limit)
            .field("llm", &self.llm.as_ref().map(|l| l.model.as_str()))
            .finish()
    }
}

#[async_trait]
impl ChatMemory for ShortTermMemory {
    fn get(&self, input: Option<&str>) -> Result<Vec<Message>> {
        let messages = self.get_all()?;
        match self.token_limit {
            Some(limit) => Ok(self.window(messages, input, limit)),
            None => Ok(messages),
        }
    }

    fn get_all(&self) -> Result<Vec<Message>> {
        self.store.get_messages(&self.key)
    }

    fn put(&self, message: Message) -> Result<()> {
        self.store.add_message(&self.key, message)
    }

    async fn async_put(&self, message: Message) -> Result<()> {
        self.store.async_add_message(&self.key, message).await
    }

    fn put_messages(&self, messages: Vec<Message>) -> Result<()> {
        self.store.add_messages(&self.key, messages)
    }

    fn set(&self, messages: Vec<Message>) -> Result<()> {
        self.store.set_messages(&self.key, messages)
    }

    fn reset(&self) -> Result<()> {
        self.store.delete_messages(&self.key)?;
        info!("Reset chat history for key: {}", self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text_content()).collect()
    }

    #[test]
    fn test_put_then_reset() {
        let memory = ShortTermMemory::in_memory();
        memory.put(Message::user("hi")).unwrap();
        memory.put(Message::assistant("hello")).unwrap();

        assert_eq!(
            memory.get_all().unwrap(),
            vec![Message::user("hi"), Message::assistant("hello")]
        );

        memory.reset().unwrap();
        assert!(memory.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_keys_are_isolated() {
        let store = InMemoryStore::shared();
        let first = ShortTermMemory::new(store.clone(), "first");
        let second = ShortTermMemory::new(store.clone(), "second");

        first.put(Message::user("one")).unwrap();
        second.put(Message::user("other")).unwrap();
        first.put(Message::user("two")).unwrap();

        assert_eq!(texts(&first.get_all().unwrap()), vec!["one", "two"]);

        second.reset().unwrap();
        assert_eq!(texts(&first.get_all().unwrap()), vec!["one", "two"]);
        assert!(second.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_set_is_idempotent() {
        let memory = ShortTermMemory::in_memory();
        memory.put(Message::user("discarded")).unwrap();

        let history = vec![Message::system("be brief"), Message::user("hi")];
        memory.set(history.clone()).unwrap();
        let once = memory.get_all().unwrap();
        memory.set(history.clone()).unwrap();
        assert_eq!(memory.get_all().unwrap(), once);
        assert_eq!(once, history);
    }

    #[test]
    fn test_put_messages_appends_batch() {
        let memory = ShortTermMemory::in_memory();
        memory.put(Message::user("first")).unwrap();
        memory
            .put_messages(vec![Message::assistant("second"), Message::user("third")])
            .unwrap();
        assert_eq!(texts(&memory.get_all().unwrap()), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_get_without_limit_ignores_input() {
        let memory = ShortTermMemory::in_memory();
        memory.put(Message::user("hi")).unwrap();
        assert_eq!(memory.get(Some("anything")).unwrap(), memory.get_all().unwrap());
    }

    #[test]
    fn test_get_with_token_limit_keeps_newest() {
        // Each message below costs 3 estimated tokens (8 chars + 1)
        let memory = ShortTermMemory::in_memory().with_token_limit(7);
        memory.put(Message::user("user-001")).unwrap();
        memory.put(Message::assistant("asst-001")).unwrap();
        memory.put(Message::user("user-002")).unwrap();
        memory.put(Message::assistant("asst-002")).unwrap();

        let window = memory.get(None).unwrap();
        assert_eq!(texts(&window), vec!["user-002", "asst-002"]);

        // Full history is untouched
        assert_eq!(memory.get_all().unwrap().len(), 4);
    }

    #[test]
    fn test_token_window_does_not_start_with_reply() {
        let memory = ShortTermMemory::in_memory().with_token_limit(9);
        memory.put(Message::user("user-001")).unwrap();
        memory.put(Message::assistant("asst-001")).unwrap();
        memory.put(Message::user("user-002")).unwrap();
        memory.put(Message::assistant("asst-002")).unwrap();

        // Budget fits three messages but the oldest of those is a reply
        let window = memory.get(None).unwrap();
        assert_eq!(texts(&window), vec!["user-002", "asst-002"]);
    }

    #[test]
    fn test_token_window_counts_input() {
        let memory = ShortTermMemory::in_memory().with_token_limit(4);
        memory.put(Message::user("user-001")).unwrap();

        assert_eq!(memory.get(None).unwrap().len(), 1);
        // "12345678" costs 2 tokens, leaving too little for the message
        assert!(memory.get(Some("12345678")).unwrap().is_empty());
        // Input larger than the whole budget
        assert!(memory.get(Some(&"x".repeat(40))).unwrap().is_empty());
    }

    #[test]
    fn test_from_defaults_seeds_history() {
        let llm = LlmConfig {
            model: "summary-model".to_string(),
            ..LlmConfig::default()
        };
        let memory = ShortTermMemory::from_defaults(Some(vec![Message::user("seed")]), Some(llm)).unwrap();
        assert_eq!(memory.key(), DEFAULT_CHAT_STORE_KEY);
        assert_eq!(texts(&memory.get_all().unwrap()), vec!["seed"]);
        assert_eq!(memory.llm().unwrap().model, "summary-model");
    }

    #[test]
    fn test_record_roundtrip_in_memory() {
        let memory = ShortTermMemory::new(InMemoryStore::shared(), "session-1").with_token_limit(500);
        memory.put(Message::user("hi")).unwrap();
        memory.put(Message::assistant("hello")).unwrap();

        let json = memory.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["chat_store"]["class_name"], "in_memory");
        assert_eq!(value["chat_store_key"], "session-1");

        let rebuilt = ShortTermMemory::from_json(&json, &StoreRegistry::with_defaults()).unwrap();
        assert_eq!(rebuilt.key(), "session-1");
        assert_eq!(rebuilt.token_limit(), Some(500));
        assert_eq!(rebuilt.get_all().unwrap(), memory.get_all().unwrap());
    }

    #[test]
    fn test_record_roundtrip_sqlite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chat.db");
        let store = Arc::new(SqliteStore::new(path.to_str().unwrap()).unwrap());
        let memory = ShortTermMemory::new(store, "k");
        memory.put(Message::user("stored on disk")).unwrap();

        let record = memory.to_record().unwrap();
        assert_eq!(record.chat_store.class_name, "sqlite");

        let rebuilt = ShortTermMemory::from_record(&record, &StoreRegistry::with_defaults()).unwrap();
        assert_eq!(rebuilt.get_all().unwrap(), memory.get_all().unwrap());
    }

    #[test]
    fn test_record_roundtrip_sqlite_in_memory() {
        let memory = ShortTermMemory::new(Arc::new(SqliteStore::in_memory().unwrap()), "k")
            .with_token_limit(64);
        memory.put(Message::user("kept in the record")).unwrap();

        let json = memory.to_json().unwrap();
        let rebuilt = ShortTermMemory::from_json(&json, &StoreRegistry::with_defaults()).unwrap();
        assert_eq!(rebuilt.store().class_name(), "sqlite");
        assert_eq!(rebuilt.token_limit(), Some(64));
        assert_eq!(rebuilt.get_all().unwrap(), vec![Message::user("kept in the record")]);
    }

    #[test]
    fn test_record_defaults_key() {
        let json = r#"{"chat_store": {"class_name": "in_memory"}}"#;
        let memory = ShortTermMemory::from_json(json, &StoreRegistry::with_defaults()).unwrap();
        assert_eq!(memory.key(), DEFAULT_CHAT_STORE_KEY);
        assert!(memory.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_async_put_read_your_writes() {
        let memory = ShortTermMemory::new(Arc::new(SqliteStore::in_memory().unwrap()), "k");
        memory.async_put(Message::user("one")).await.unwrap();
        memory.put(Message::assistant("two")).unwrap();
        memory.async_put(Message::user("three")).await.unwrap();
        assert_eq!(texts(&memory.get_all().unwrap()), vec!["one", "two", "three"]);
    }
}
