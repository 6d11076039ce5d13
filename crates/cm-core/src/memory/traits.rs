//! Memory trait definitions
//!
//! [`ChatMemory`] is the single-conversation view used during a session.
//! [`LongTermMemory`] is keyed per call and timestamp-indexed, for history
//! that outlives sessions and may not fit in RAM.

use async_trait::async_trait;

use crate::message::{Message, TimestampedMessage};
use crate::{Error, Result};

/// Default `max_entries` for [`LongTermMemory::get_sorted_entries`]
pub const DEFAULT_MAX_ENTRIES: usize = 10;

/// Chat history bound to one conversation
#[async_trait]
pub trait ChatMemory: Send + Sync {
    /// Get the history to show a model for the next turn
    ///
    /// `input` is the pending user input; implementations may use it to
    /// size a window and ignore it otherwise.
    fn get(&self, input: Option<&str>) -> Result<Vec<Message>>;

    /// Get the complete history in insertion order
    fn get_all(&self) -> Result<Vec<Message>>;

    /// Append one message
    fn put(&self, message: Message) -> Result<()>;

    /// Append one message without blocking the scheduler
    async fn async_put(&self, message: Message) -> Result<()> {
        self.put(message)
    }

    /// Append messages in order
    ///
    /// The default calls [`ChatMemory::put`] once per message and is not
    /// atomic: an error partway leaves the earlier messages stored.
    /// Memories backed by an atomic batch write should override it.
    fn put_messages(&self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.put(message)?;
        }
        Ok(())
    }

    /// Replace the whole history
    fn set(&self, messages: Vec<Message>) -> Result<()>;

    /// Delete the whole history
    fn reset(&self) -> Result<()>;
}

/// Timestamped memory partitioned by conversation
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// Append an entry to a conversation
    ///
    /// Equal timestamps are allowed and keep insertion order.
    fn add_message(&self, message: Message, conversation_id: &str, timestamp: f64) -> Result<()>;

    async fn async_add_message(
        &self,
        message: Message,
        conversation_id: &str,
        timestamp: f64,
    ) -> Result<()> {
        self.add_message(message, conversation_id, timestamp)
    }

    /// Up to `max_memories` entries strictly before `before_timestamp`,
    /// most recent first
    fn get_recent_memories(
        &self,
        conversation_id: &str,
        before_timestamp: f64,
        max_memories: usize,
    ) -> Result<Vec<Message>>;

    /// Up to `max_entries` entries in ascending timestamp order
    ///
    /// `filter_clause` is backend-defined. Backends that cannot filter
    /// return [`Error::UnsupportedCapability`] for any `Some` clause.
    fn get_sorted_entries(
        &self,
        conversation_id: &str,
        filter_clause: Option<&str>,
        max_entries: usize,
    ) -> Result<Vec<TimestampedMessage>>;

    /// Overwrite a conversation, keeping explicit timestamps
    fn set_entries(&self, conversation_id: &str, entries: Vec<TimestampedMessage>) -> Result<()>;

    /// Overwrite a conversation
    ///
    /// Prior timestamps are lost; entry `i` is stamped with `i as f64`.
    fn set_messages(&self, conversation_id: &str, messages: Vec<Message>) -> Result<()> {
        let entries = messages
            .into_iter()
            .enumerate()
            .map(|(ordinal, message)| TimestampedMessage::new(message, ordinal as f64))
            .collect();
        self.set_entries(conversation_id, entries)
    }

    /// All entries of a conversation, ascending by timestamp
    fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Delete all entries of one conversation
    fn reset(&self, conversation_id: &str) -> Result<()>;
}

/// Reject timestamps that cannot be ordered
pub(crate) fn check_timestamp(timestamp: f64) -> Result<f64> {
    if timestamp.is_finite() {
        Ok(timestamp)
    } else {
        Err(Error::InvalidTimestamp(timestamp))
    }
}

/// Upper bounds may be infinite but never NaN
pub(crate) fn check_bound(before_timestamp: f64) -> Result<f64> {
    if before_timestamp.is_nan() {
        Err(Error::InvalidTimestamp(before_timestamp))
    } else {
        Ok(before_timestamp)
    }
}
