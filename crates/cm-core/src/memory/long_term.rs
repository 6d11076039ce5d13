//! In-process long-term memory

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info};

use crate::memory::traits::{check_bound, check_timestamp};
use crate::memory::LongTermMemory;
use crate::message::{Message, TimestampedMessage};
use crate::{Error, Result};

/// Long-term memory kept in a map of sorted vectors
///
/// Each conversation is kept sorted by timestamp; entries with equal
/// timestamps stay in insertion order. Filter clauses are not supported.
#[derive(Debug, Default)]
pub struct InMemoryLongTermMemory {
    conversations: RwLock<HashMap<String, Vec<TimestampedMessage>>>,
}

impl InMemoryLongTermMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored for a conversation
    pub fn entry_count(&self, conversation_id: &str) -> Result<usize> {
        let conversations = self.conversations.read().map_err(Error::poisoned)?;
        Ok(conversations.get(conversation_id).map_or(0, Vec::len))
    }
}

impl LongTermMemory for InMemoryLongTermMemory {
    fn add_message(&self, message: Message, conversation_id: &str, timestamp: f64) -> Result<()> {
        let timestamp = check_timestamp(timestamp)?;
        let mut conversations = self.conversations.write().map_err(Error::poisoned)?;
        let entries = conversations.entry(conversation_id.to_string()).or_default();
        // After every entry with timestamp <= ours
        let at = entries.partition_point(|e| e.timestamp <= timestamp);
        entries.insert(at, TimestampedMessage::new(message, timestamp));
        Ok(())
    }

    fn get_recent_memories(
        &self,
        conversation_id: &str,
        before_timestamp: f64,
        max_memories: usize,
    ) -> Result<Vec<Message>> {
        let before_timestamp = check_bound(before_timestamp)?;
        let conversations = self.conversations.read().map_err(Error::poisoned)?;
        let Some(entries) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let end = entries.partition_point(|e| e.timestamp < before_timestamp);
        let recent: Vec<Message> = entries[..end]
            .iter()
            .rev()
            .take(max_memories)
            .map(|e| e.message.clone())
            .collect();
        debug!(
            "Recalled {} memories before {} for conversation: {}",
            recent.len(),
            before_timestamp,
            conversation_id
        );
        Ok(recent)
    }

    fn get_sorted_entries(
        &self,
        conversation_id: &str,
        filter_clause: Option<&str>,
        max_entries: usize,
    ) -> Result<Vec<TimestampedMessage>> {
        if let Some(filter) = filter_clause {
            return Err(Error::UnsupportedCapability(format!(
                "in-memory long-term memory cannot filter (got {:?})",
                filter
            )));
        }
        let conversations = self.conversations.read().map_err(Error::poisoned)?;
        Ok(conversations
            .get(conversation_id)
            .map(|entries| entries.iter().take(max_entries).cloned().collect())
            .unwrap_or_default())
    }

    fn set_entries(&self, conversation_id: &str, entries: Vec<TimestampedMessage>) -> Result<()> {
        for entry in &entries {
            check_timestamp(entry.timestamp)?;
        }
        let mut entries = entries;
        // Stable: equal timestamps keep the given order
        entries.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        let mut conversations = self.conversations.write().map_err(Error::poisoned)?;
        debug!("Set {} entries for conversation: {}", entries.len(), conversation_id);
        conversations.insert(conversation_id.to_string(), entries);
        Ok(())
    }

    fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conversations = self.conversations.read().map_err(Error::poisoned)?;
        Ok(conversations
            .get(conversation_id)
            .map(|entries| entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default())
    }

    fn reset(&self, conversation_id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().map_err(Error::poisoned)?;
        if conversations.remove(conversation_id).is_some() {
            info!("Reset long-term memory for conversation: {}", conversation_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DEFAULT_MAX_ENTRIES;

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text_content()).collect()
    }

    #[test]
    fn test_recent_memories_respects_bound() {
        let memory = InMemoryLongTermMemory::new();
        memory.add_message(Message::user("t1"), "c", 100.0).unwrap();
        memory.add_message(Message::user("t3"), "c", 300.0).unwrap();

        let recent = memory.get_recent_memories("c", 200.0, 10).unwrap();
        assert_eq!(texts(&recent), vec!["t1"]);

        let recent = memory.get_recent_memories("c", 301.0, 10).unwrap();
        assert_eq!(texts(&recent), vec!["t3", "t1"]);

        // Strictly before
        let recent = memory.get_recent_memories("c", 300.0, 10).unwrap();
        assert_eq!(texts(&recent), vec!["t1"]);
    }

    #[test]
    fn test_recent_memories_limit_and_unknown() {
        let memory = InMemoryLongTermMemory::new();
        for i in 0..5 {
            memory.add_message(Message::user(format!("m{}", i)), "c", i as f64).unwrap();
        }

        let recent = memory.get_recent_memories("c", f64::INFINITY, 3).unwrap();
        assert_eq!(texts(&recent), vec!["m4", "m3", "m2"]);
        assert_eq!(memory.get_recent_memories("c", f64::INFINITY, 10).unwrap().len(), 5);
        assert!(memory.get_recent_memories("c", 10.0, 0).unwrap().is_empty());
        assert!(memory.get_recent_memories("unknown", 10.0, 3).unwrap().is_empty());
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let memory = InMemoryLongTermMemory::new();
        memory.add_message(Message::user("a"), "c", 5.0).unwrap();
        memory.add_message(Message::user("b"), "c", 5.0).unwrap();
        memory.add_message(Message::user("early"), "c", 1.0).unwrap();

        assert_eq!(texts(&memory.get_messages("c").unwrap()), vec!["early", "a", "b"]);
        let recent = memory.get_recent_memories("c", 10.0, 10).unwrap();
        assert_eq!(texts(&recent), vec!["b", "a", "early"]);
    }

    #[test]
    fn test_sorted_entries_rejects_filter() {
        let memory = InMemoryLongTermMemory::new();
        memory.add_message(Message::user("x"), "c", 1.0).unwrap();

        let err = memory.get_sorted_entries("c", Some("x"), 10).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCapability(_)));
    }

    #[test]
    fn test_sorted_entries_ascending() {
        let memory = InMemoryLongTermMemory::new();
        for ts in [30.0, 10.0, 20.0] {
            memory.add_message(Message::user(format!("{}", ts)), "c", ts).unwrap();
        }
        for i in 0..20 {
            memory.add_message(Message::user("late"), "c", 100.0 + i as f64).unwrap();
        }

        let entries = memory.get_sorted_entries("c", None, DEFAULT_MAX_ENTRIES).unwrap();
        assert_eq!(entries.len(), DEFAULT_MAX_ENTRIES);
        assert_eq!(entries[0].timestamp, 10.0);
        assert_eq!(entries[1].timestamp, 20.0);
        assert_eq!(entries[2].timestamp, 30.0);
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_set_messages_uses_ordinals() {
        let memory = InMemoryLongTermMemory::new();
        memory.add_message(Message::user("old"), "c", 1000.0).unwrap();
        memory
            .set_messages("c", vec![Message::user("first"), Message::user("second")])
            .unwrap();

        let entries = memory.get_sorted_entries("c", None, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, 0.0);
        assert_eq!(entries[1].timestamp, 1.0);
        assert_eq!(entries[1].message.text_content(), "second");
    }

    #[test]
    fn test_set_entries_sorts_stably() {
        let memory = InMemoryLongTermMemory::new();
        memory
            .set_entries(
                "c",
                vec![
                    TimestampedMessage::new(Message::user("late"), 9.0),
                    TimestampedMessage::new(Message::user("tie-1"), 3.0),
                    TimestampedMessage::new(Message::user("tie-2"), 3.0),
                ],
            )
            .unwrap();
        assert_eq!(texts(&memory.get_messages("c").unwrap()), vec!["tie-1", "tie-2", "late"]);
    }

    #[test]
    fn test_reset_scoped_to_conversation() {
        let memory = InMemoryLongTermMemory::new();
        memory.add_message(Message::user("a"), "one", 1.0).unwrap();
        memory.add_message(Message::user("b"), "two", 1.0).unwrap();

        memory.reset("one").unwrap();
        memory.reset("never-existed").unwrap();
        assert_eq!(memory.entry_count("one").unwrap(), 0);
        assert_eq!(memory.entry_count("two").unwrap(), 1);
    }

    #[test]
    fn test_invalid_timestamps_rejected() {
        let memory = InMemoryLongTermMemory::new();
        assert!(matches!(
            memory.add_message(Message::user("x"), "c", f64::NAN),
            Err(Error::InvalidTimestamp(_))
        ));
        assert!(memory.get_recent_memories("c", f64::NAN, 1).is_err());
        assert_eq!(memory.entry_count("c").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_async_add_defaults_to_blocking() {
        let memory = InMemoryLongTermMemory::new();
        memory.async_add_message(Message::user("x"), "c", 1.0).await.unwrap();
        assert_eq!(memory.entry_count("c").unwrap(), 1);
    }
}
