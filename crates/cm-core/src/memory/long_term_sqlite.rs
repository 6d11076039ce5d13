//! Long-term memory storage using SQLite
//!
//! Entries live in one table indexed by (conversation_id, timestamp), so
//! recency lookups never load a whole conversation.
//!
//! Filter clauses for [`LongTermMemory::get_sorted_entries`] are plain
//! text: an entry matches when its text content contains the clause,
//! ignoring ASCII case. `%`, `_` and `\` in the clause match literally.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::memory::traits::{check_bound, check_timestamp};
use crate::memory::LongTermMemory;
use crate::message::{Message, TimestampedMessage};
use crate::store::IN_MEMORY_PATH;
use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based long-term memory
pub struct SqliteLongTermMemory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLongTermMemory {
    /// Open (or create) long-term memory at the given database path
    pub fn new(db_path: &str) -> Result<Self> {
        debug!("Opening long-term memory database at: {}", db_path);
        if db_path != IN_MEMORY_PATH {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(db_path).map_err(|e| {
            Error::BackendUnavailable(format!("cannot open {}: {}", db_path, e))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let memory = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        memory.init_tables()?;
        info!("SqliteLongTermMemory initialized at {}", db_path);
        Ok(memory)
    }

    /// Create an in-memory instance (useful for testing)
    pub fn in_memory() -> Result<Self> {
        Self::new(IN_MEMORY_PATH)
    }

    /// Initialize database tables
    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(Error::poisoned)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS long_term_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                timestamp REAL NOT NULL,
                message TEXT NOT NULL,
                text_content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Covers both recency scans and sorted scans
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_long_term_conversation_ts
             ON long_term_entries(conversation_id, timestamp, seq)",
            [],
        )?;

        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(Error::poisoned)?;
        f(&mut conn)
    }

    /// Conversations that currently hold entries
    pub fn conversation_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT conversation_id FROM long_term_entries ORDER BY conversation_id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }
}

fn insert_entry(
    conn: &Connection,
    conversation_id: &str,
    message: &Message,
    timestamp: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO long_term_entries
             (id, conversation_id, timestamp, message, text_content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::now_v7().to_string(),
            conversation_id,
            timestamp,
            serde_json::to_string(message)?,
            message.text_content(),
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimestampedMessage> {
    let json: String = row.get(0)?;
    let timestamp: f64 = row.get(1)?;
    let message = serde_json::from_str(&json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(TimestampedMessage::new(message, timestamp))
}

/// Escape a filter clause for `LIKE ... ESCAPE '\'`
fn like_pattern(clause: &str) -> String {
    let mut pattern = String::with_capacity(clause.len() + 2);
    pattern.push('%');
    for c in clause.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn limit_param(max: usize) -> i64 {
    i64::try_from(max).unwrap_or(i64::MAX)
}

#[async_trait]
impl LongTermMemory for SqliteLongTermMemory {
    fn add_message(&self, message: Message, conversation_id: &str, timestamp: f64) -> Result<()> {
        let timestamp = check_timestamp(timestamp)?;
        self.with_conn(|conn| insert_entry(conn, conversation_id, &message, timestamp))
    }

    async fn async_add_message(
        &self,
        message: Message,
        conversation_id: &str,
        timestamp: f64,
    ) -> Result<()> {
        let timestamp = check_timestamp(timestamp)?;
        let conn = Arc::clone(&self.conn);
        let conversation_id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(Error::poisoned)?;
            insert_entry(&conn, &conversation_id, &message, timestamp)
        })
        .await
        .map_err(|e| Error::BackendUnavailable(format!("memory task failed: {}", e)))?
    }

    fn get_recent_memories(
        &self,
        conversation_id: &str,
        before_timestamp: f64,
        max_memories: usize,
    ) -> Result<Vec<Message>> {
        let before_timestamp = check_bound(before_timestamp)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message, timestamp FROM long_term_entries
                 WHERE conversation_id = ?1 AND timestamp < ?2
                 ORDER BY timestamp DESC, seq DESC
                 LIMIT ?3",
            )?;
            let messages = stmt
                .query_map(
                    params![conversation_id, before_timestamp, limit_param(max_memories)],
                    row_to_entry,
                )?
                .map(|entry| entry.map(|e| e.message))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            debug!(
                "Recalled {} memories before {} for conversation: {}",
                messages.len(),
                before_timestamp,
                conversation_id
            );
            Ok(messages)
        })
    }

    fn get_sorted_entries(
        &self,
        conversation_id: &str,
        filter_clause: Option<&str>,
        max_entries: usize,
    ) -> Result<Vec<TimestampedMessage>> {
        self.with_conn(|conn| {
            let entries = match filter_clause {
                Some(clause) => {
                    let mut stmt = conn.prepare(
                        "SELECT message, timestamp FROM long_term_entries
                         WHERE conversation_id = ?1 AND text_content LIKE ?2 ESCAPE '\\'
                         ORDER BY timestamp ASC, seq ASC
                         LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(
                            params![conversation_id, like_pattern(clause), limit_param(max_entries)],
                            row_to_entry,
                        )?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT message, timestamp FROM long_term_entries
                         WHERE conversation_id = ?1
                         ORDER BY timestamp ASC, seq ASC
                         LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![conversation_id, limit_param(max_entries)], row_to_entry)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(entries)
        })
    }

    fn set_entries(&self, conversation_id: &str, entries: Vec<TimestampedMessage>) -> Result<()> {
        for entry in &entries {
            check_timestamp(entry.timestamp)?;
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM long_term_entries WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            for entry in &entries {
                insert_entry(&tx, conversation_id, &entry.message, entry.timestamp)?;
            }
            tx.commit()?;
            debug!("Set {} entries for conversation: {}", entries.len(), conversation_id);
            Ok(())
        })
    }

    fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message, timestamp FROM long_term_entries
                 WHERE conversation_id = ?1
                 ORDER BY timestamp ASC, seq ASC",
            )?;
            let messages = stmt
                .query_map(params![conversation_id], row_to_entry)?
                .map(|entry| entry.map(|e| e.message))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(messages)
        })
    }

    fn reset(&self, conversation_id: &str) -> Result<()> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM long_term_entries WHERE conversation_id = ?1",
                params![conversation_id],
            )?)
        })?;
        if removed > 0 {
            info!(
                "Reset long-term memory for conversation: {} ({} entries)",
                conversation_id, removed
            );
        }
        Ok(())
    }
}
