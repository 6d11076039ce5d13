//! cm-core: Conversation Memory Core Library
//!
//! 会話履歴の短期メモリ（トークン窓付き）と長期メモリ（タイムスタンプ索引）、
//! およびそれらを支えるメッセージストアのコア機能を提供します。

pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod store;

pub use config::{BackendKind, Config, LlmConfig, LlmProvider, LongTermConfig, ShortTermConfig};
pub use error::{Error, Result};
pub use memory::{
    ChatMemory, InMemoryLongTermMemory, LongTermMemory, MemoryRecord, ShortTermMemory,
    SqliteLongTermMemory,
};
pub use message::{ImageSource, Message, MessageContent, MessageRole, TimestampedMessage};
pub use store::{InMemoryStore, MessageStore, SqliteStore, StoreRecord, StoreRegistry};
