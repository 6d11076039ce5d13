//! Message store persistence using SQLite

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::message::Message;
use crate::store::{MessageStore, StoreRecord};
use crate::{Error, Result};

/// Path SQLite treats as a private in-memory database
pub const IN_MEMORY_PATH: &str = ":memory:";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based message store
///
/// Each operation runs in its own transaction, so a batch append is
/// all-or-nothing. The connection is shared behind a mutex so the store
/// can be cloned into blocking tasks.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SqliteState {
    db_path: String,
    /// Rows of a `:memory:` database, which has no file to reopen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    messages: Option<BTreeMap<String, Vec<Message>>>,
}

impl SqliteStore {
    pub const CLASS_NAME: &'static str = "sqlite";

    /// Open (or create) a store at the given database path
    pub fn new(db_path: &str) -> Result<Self> {
        debug!("Opening chat store database at: {}", db_path);
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
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_string(),
        };
        store.init_tables()?;
        info!("SqliteStore initialized at {}", db_path);
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    ///
    /// The data dies with the connection, so records of this store carry
    /// every row.
    pub fn in_memory() -> Result<Self> {
        Self::new(IN_MEMORY_PATH)
    }

    /// Rebuild a store from its serialized record
    pub fn from_record(record: &StoreRecord) -> Result<Self> {
        let state: SqliteState = record.state_as()?;
        let store = Self::new(&state.db_path)?;
        if let Some(messages) = state.messages {
            store.with_conn(|conn| {
                for (key, messages) in &messages {
                    replace_messages(conn, key, messages)?;
                }
                Ok(())
            })?;
        }
        Ok(store)
    }

    /// Database path this store was opened with
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Initialize database tables
    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(Error::poisoned)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                key TEXT NOT NULL,
                position INTEGER NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (key, position)
            )",
            [],
        )?;
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(Error::poisoned)?;
        f(&mut conn)
    }

    /// Run a closure against the connection on the blocking pool
    ///
    /// The task runs to completion even if the returned future is dropped.
    async fn spawn_with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(Error::poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::BackendUnavailable(format!("store task failed: {}", e)))?
    }
}

fn decode_message(json: &str, column: usize) -> rusqlite::Result<Message> {
    serde_json::from_str(json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn load_messages(conn: &Connection, key: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT message FROM chat_messages WHERE key = ?1 ORDER BY position ASC",
    )?;
    let messages = stmt
        .query_map(params![key], |row| {
            let json: String = row.get(0)?;
            decode_message(&json, 0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(messages)
}

fn dump_messages(conn: &Connection) -> Result<BTreeMap<String, Vec<Message>>> {
    let mut stmt = conn.prepare(
        "SELECT key, message FROM chat_messages ORDER BY key ASC, position ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let key: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((key, decode_message(&json, 1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut messages: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for (key, message) in rows {
        messages.entry(key).or_default().push(message);
    }
    Ok(messages)
}

fn append_messages(conn: &mut Connection, key: &str, messages: &[Message]) -> Result<()> {
    let tx = conn.transaction()?;
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM chat_messages WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )?;
    let now = chrono::Utc::now().to_rfc3339();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO chat_messages (key, position, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (offset, message) in messages.iter().enumerate() {
            let json = serde_json::to_string(message)?;
            stmt.execute(params![key, next + offset as i64, json, now])?;
        }
    }
    tx.commit()?;
    debug!("Appended {} messages to key: {}", messages.len(), key);
    Ok(())
}

fn replace_messages(conn: &mut Connection, key: &str, messages: &[Message]) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM chat_messages WHERE key = ?1", params![key])?;
    let now = chrono::Utc::now().to_rfc3339();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO chat_messages (key, position, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, message) in messages.iter().enumerate() {
            let json = serde_json::to_string(message)?;
            stmt.execute(params![key, position as i64, json, now])?;
        }
    }
    tx.commit()?;
    debug!("Set {} messages for key: {}", messages.len(), key);
    Ok(())
}

/// Remove one row chosen by `select_sql`, which must yield (position, message)
fn remove_one(
    conn: &mut Connection,
    key: &str,
    select_sql: &str,
    offset: i64,
) -> Result<Option<Message>> {
    let tx = conn.transaction()?;
    let row = tx
        .query_row(select_sql, params![key, offset], |row| {
            let position: i64 = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((position, decode_message(&json, 1)?))
        })
        .optional()?;

    let Some((position, message)) = row else {
        return Ok(None);
    };
    tx.execute(
        "DELETE FROM chat_messages WHERE key = ?1 AND position = ?2",
        params![key, position],
    )?;
    tx.commit()?;
    Ok(Some(message))
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn set_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        self.with_conn(|conn| replace_messages(conn, key, &messages))
    }

    fn get_messages(&self, key: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| load_messages(conn, key))
    }

    fn add_message(&self, key: &str, message: Message) -> Result<()> {
        self.with_conn(|conn| append_messages(conn, key, std::slice::from_ref(&message)))
    }

    fn add_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        self.with_conn(|conn| append_messages(conn, key, &messages))
    }

    fn delete_messages(&self, key: &str) -> Result<Option<Vec<Message>>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let messages = load_messages(&tx, key)?;
            if messages.is_empty() {
                return Ok(None);
            }
            tx.execute("DELETE FROM chat_messages WHERE key = ?1", params![key])?;
            tx.commit()?;
            info!("Deleted {} messages for key: {}", messages.len(), key);
            Ok(Some(messages))
        })
    }

    fn delete_message(&self, key: &str, idx: usize) -> Result<Option<Message>> {
        let offset = i64::try_from(idx).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            remove_one(
                conn,
                key,
                "SELECT position, message FROM chat_messages WHERE key = ?1
                 ORDER BY position ASC LIMIT 1 OFFSET ?2",
                offset,
            )
        })
    }

    fn delete_last_message(&self, key: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            remove_one(
                conn,
                key,
                "SELECT position, message FROM chat_messages WHERE key = ?1
                 ORDER BY position DESC LIMIT 1 OFFSET ?2",
                0,
            )
        })
    }

    fn get_keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT key FROM chat_messages ORDER BY key ASC")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    fn to_record(&self) -> Result<StoreRecord> {
        let messages = if self.db_path == IN_MEMORY_PATH {
            Some(self.with_conn(|conn| dump_messages(conn))?)
        } else {
            None
        };
        StoreRecord::new(
            Self::CLASS_NAME,
            &SqliteState {
                db_path: self.db_path.clone(),
                messages,
            },
        )
    }

    async fn async_add_message(&self, key: &str, message: Message) -> Result<()> {
        let key = key.to_string();
        self.spawn_with_conn(move |conn| {
            append_messages(conn, &key, std::slice::from_ref(&message))
        })
        .await
    }

    async fn async_add_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        let key = key.to_string();
        self.spawn_with_conn(move |conn| append_messages(conn, &key, &messages))
            .await
    }

    async fn async_set_messages(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        let key = key.to_string();
        self.spawn_with_conn(move |conn| replace_messages(conn, &key, &messages))
            .await
    }
}
