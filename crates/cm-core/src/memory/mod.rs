//! Memory tiers
//!
//! Short-term memory wraps one key of a [`crate::store::MessageStore`].
//! Long-term memory is conversation-indexed and timestamped, with an
//! in-process and a SQLite implementation.

mod long_term;
mod long_term_sqlite;
mod short_term;
mod traits;

pub use long_term::InMemoryLongTermMemory;
pub use long_term_sqlite::SqliteLongTermMemory;
pub use short_term::{MemoryRecord, ShortTermMemory, DEFAULT_CHAT_STORE_KEY};
pub use traits::{ChatMemory, LongTermMemory, DEFAULT_MAX_ENTRIES};
