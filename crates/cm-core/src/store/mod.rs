//! Message store backends
//!
//! Short-term memory talks to one of these through the [`MessageStore`]
//! trait and never needs to know which one it holds.

mod in_memory;
mod registry;
mod sqlite;
mod traits;

pub use in_memory::InMemoryStore;
pub use registry::{StoreFactory, StoreRegistry};
pub use sqlite::{SqliteStore, IN_MEMORY_PATH};
pub use traits::{MessageStore, StoreRecord};
