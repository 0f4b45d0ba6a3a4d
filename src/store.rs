//! Durable persistence for mysis records, conversational memory, broadcasts,
//! and the shared account pool.
//!
//! Backed by `rusqlite` rather than the hash-chained JSONL memory the rest
//! of this codebase's lineage uses — the swarm needs indexed substring
//! search and an atomically-claimable account pool, neither of which a
//! flat append log gives you for free. `stencila-db` is the only repo in
//! the retrieval pack with a real embedded relational store; the
//! migration-table-plus-transaction shape here follows it.
//!
//! Every public operation takes `&self` and is safe to call concurrently:
//! the single [`rusqlite::Connection`] is owned by a blocking-friendly
//! mutex and each call is dispatched to the blocking thread pool via
//! `spawn_blocking`, so a slow query never stalls the async runtime.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mysis::MysisState;

/// Forward-only migrations, applied in order inside a single transaction
/// on open. `schema_version` tracks how many have been applied.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE schema_version (version INTEGER NOT NULL);
    INSERT INTO schema_version (version) VALUES (0);

    CREATE TABLE myses (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        provider_name TEXT NOT NULL,
        model_name TEXT NOT NULL,
        temperature REAL NOT NULL,
        state TEXT NOT NULL,
        last_error TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE memories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mysis_id TEXT NOT NULL,
        role TEXT NOT NULL,
        source TEXT NOT NULL,
        content TEXT NOT NULL,
        reasoning TEXT,
        sender_id TEXT,
        tool_call_id TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_memories_mysis_time ON memories (mysis_id, created_at);
    CREATE INDEX idx_memories_content ON memories (content);

    CREATE TABLE broadcasts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE accounts (
        username TEXT PRIMARY KEY,
        password TEXT NOT NULL,
        in_use INTEGER NOT NULL DEFAULT 0,
        in_use_by TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_accounts_in_use ON accounts (in_use);
    "#,
];

/// A persisted mysis record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysisRecord {
    pub id: Uuid,
    pub name: String,
    pub provider_name: String,
    pub model_name: String,
    pub temperature: f32,
    pub state: MysisState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Role of a single memory entry, mirroring the provider message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MemoryRole {
    fn as_str(&self) -> &'static str {
        match self {
            MemoryRole::System => "system",
            MemoryRole::User => "user",
            MemoryRole::Assistant => "assistant",
            MemoryRole::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "system" => Ok(MemoryRole::System),
            "user" => Ok(MemoryRole::User),
            "assistant" => Ok(MemoryRole::Assistant),
            "tool" => Ok(MemoryRole::Tool),
            other => Err(StoreError::Corrupt(format!("unknown memory role {:?}", other))),
        }
    }
}

/// Where a memory entry originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemorySource {
    Direct,
    Broadcast,
    System,
    ToolCall,
    ToolResult,
}

impl MemorySource {
    fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Direct => "direct",
            MemorySource::Broadcast => "broadcast",
            MemorySource::System => "system",
            MemorySource::ToolCall => "tool_call",
            MemorySource::ToolResult => "tool_result",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "direct" => Ok(MemorySource::Direct),
            "broadcast" => Ok(MemorySource::Broadcast),
            "system" => Ok(MemorySource::System),
            "tool_call" => Ok(MemorySource::ToolCall),
            "tool_result" => Ok(MemorySource::ToolResult),
            other => Err(StoreError::Corrupt(format!("unknown memory source {:?}", other))),
        }
    }
}

/// A single entry in a mysis's conversational memory stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub mysis_id: Uuid,
    pub role: MemoryRole,
    pub source: MemorySource,
    pub content: String,
    pub reasoning: Option<String>,
    pub sender_id: Option<Uuid>,
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A fresh entry to append; `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMemoryEntry {
    pub role: MemoryRole,
    pub source: MemorySource,
    pub content: String,
    pub reasoning: Option<String>,
    pub sender_id: Option<Uuid>,
    pub tool_call_id: Option<String>,
}

/// A global broadcast record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub id: i64,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A shared game-account credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub in_use: bool,
    pub in_use_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Typed failure modes surfaced by [`Store`] operations.
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    NoAccountsAvailable,
    Corrupt(String),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Conflict(what) => write!(f, "conflict: {}", what),
            StoreError::NoAccountsAvailable => write!(f, "no accounts available"),
            StoreError::Corrupt(what) => write!(f, "corrupt store: {}", what),
            StoreError::Backend(what) => write!(f, "store backend error: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// The persistence layer. Cheaply cloneable; clones share the same
/// connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) a sqlite database file, applying any
    /// pending migrations inside a transaction.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database. Useful for tests and the CLI's
    /// offline mode.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        Self::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
        let has_version_table: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?
            > 0;

        let current_version: i64 = if has_version_table {
            conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                .map_err(|e| StoreError::Backend(e.to_string()))?
        } else {
            -1
        };

        for (index, migration) in MIGRATIONS.iter().enumerate() {
            if (index as i64) <= current_version {
                continue;
            }
            let tx = conn.transaction().map_err(|e| StoreError::Backend(e.to_string()))?;
            tx.execute_batch(migration)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if has_version_table || index > 0 {
                tx.execute("UPDATE schema_version SET version = ?1", params![index as i64])
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            tx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task panicked: {}", e)))?
    }

    // --- Myses -------------------------------------------------------

    pub async fn create_mysis(
        &self,
        name: String,
        provider_name: String,
        model_name: String,
        temperature: f32,
    ) -> Result<MysisRecord, StoreError> {
        self.with_conn(move |conn| {
            let id = Uuid::new_v4();
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO myses (id, name, provider_name, model_name, temperature, state, last_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
                params![
                    id.to_string(),
                    name,
                    provider_name,
                    model_name,
                    temperature,
                    MysisState::Idle.as_str(),
                    created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    StoreError::Conflict(format!("mysis name already exists: {}", e))
                } else {
                    StoreError::Backend(e.to_string())
                }
            })?;
            Ok(MysisRecord {
                id,
                name,
                provider_name,
                model_name,
                temperature,
                state: MysisState::Idle,
                last_error: None,
                created_at,
            })
        })
        .await
    }

    pub async fn get_mysis(&self, id: Uuid) -> Result<MysisRecord, StoreError> {
        self.with_conn(move |conn| row_to_mysis(conn, id)).await
    }

    pub async fn list_myses(&self) -> Result<Vec<MysisRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, provider_name, model_name, temperature, state, last_error, created_at FROM myses")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([], map_mysis_row)
                .map_err(StoreError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(StoreError::from)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn update_mysis_state(
        &self,
        id: Uuid,
        state: MysisState,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE myses SET state = ?1, last_error = ?2 WHERE id = ?3",
                    params![state.as_str(), last_error, id.to_string()],
                )
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("mysis {}", id)));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_mysis(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute("DELETE FROM myses WHERE id = ?1", params![id.to_string()])
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("mysis {}", id)));
            }
            Ok(())
        })
        .await
    }

    // --- Memories ------------------------------------------------------

    pub async fn append_memory(&self, mysis_id: Uuid, entry: NewMemoryEntry) -> Result<MemoryEntry, StoreError> {
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO memories (mysis_id, role, source, content, reasoning, sender_id, tool_call_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    mysis_id.to_string(),
                    entry.role.as_str(),
                    entry.source.as_str(),
                    entry.content,
                    entry.reasoning,
                    entry.sender_id.map(|id| id.to_string()),
                    entry.tool_call_id,
                    created_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::from)?;
            let id = conn.last_insert_rowid();
            Ok(MemoryEntry {
                id,
                mysis_id,
                role: entry.role,
                source: entry.source,
                content: entry.content,
                reasoning: entry.reasoning,
                sender_id: entry.sender_id,
                tool_call_id: entry.tool_call_id,
                created_at,
            })
        })
        .await
    }

    pub async fn recent_memories(&self, mysis_id: Uuid, n: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, mysis_id, role, source, content, reasoning, sender_id, tool_call_id, created_at
                     FROM memories WHERE mysis_id = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![mysis_id.to_string(), n as i64], map_memory_row)
                .map_err(StoreError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(StoreError::from)?);
            }
            out.reverse();
            Ok(out)
        })
        .await
    }

    pub async fn search_memories(
        &self,
        mysis_id: Uuid,
        substring: String,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.with_conn(move |conn| {
            let pattern = format!("%{}%", substring);
            let mut stmt = conn
                .prepare(
                    "SELECT id, mysis_id, role, source, content, reasoning, sender_id, tool_call_id, created_at
                     FROM memories
                     WHERE mysis_id = ?1 AND role IN ('user','assistant','tool') AND content LIKE ?2
                     ORDER BY id DESC LIMIT ?3",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![mysis_id.to_string(), pattern, limit as i64], map_memory_row)
                .map_err(StoreError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(StoreError::from)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn search_reasoning(
        &self,
        mysis_id: Uuid,
        substring: String,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.with_conn(move |conn| {
            let pattern = format!("%{}%", substring);
            let mut stmt = conn
                .prepare(
                    "SELECT id, mysis_id, role, source, content, reasoning, sender_id, tool_call_id, created_at
                     FROM memories
                     WHERE mysis_id = ?1 AND reasoning LIKE ?2
                     ORDER BY id DESC LIMIT ?3",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![mysis_id.to_string(), pattern, limit as i64], map_memory_row)
                .map_err(StoreError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(StoreError::from)?);
            }
            Ok(out)
        })
        .await
    }

    // --- Broadcasts ------------------------------------------------------

    pub async fn record_broadcast(&self, sender_id: Uuid, content: String) -> Result<BroadcastRecord, StoreError> {
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO broadcasts (sender_id, content, created_at) VALUES (?1, ?2, ?3)",
                params![sender_id.to_string(), content, created_at.to_rfc3339()],
            )
            .map_err(StoreError::from)?;
            Ok(BroadcastRecord {
                id: conn.last_insert_rowid(),
                sender_id,
                content,
                created_at,
            })
        })
        .await
    }

    pub async fn search_broadcasts(&self, substring: String, limit: usize) -> Result<Vec<BroadcastRecord>, StoreError> {
        self.with_conn(move |conn| {
            let pattern = format!("%{}%", substring);
            let mut stmt = conn
                .prepare(
                    "SELECT id, sender_id, content, created_at FROM broadcasts
                     WHERE content LIKE ?1 ORDER BY id DESC LIMIT ?2",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![pattern, limit as i64], |row| {
                    Ok(BroadcastRecord {
                        id: row.get(0)?,
                        sender_id: parse_uuid(row.get::<_, String>(1)?)?,
                        content: row.get(2)?,
                        created_at: parse_timestamp(row.get::<_, String>(3)?)?,
                    })
                })
                .map_err(StoreError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(StoreError::from)?);
            }
            Ok(out)
        })
        .await
    }

    // --- Accounts --------------------------------------------------------

    pub async fn create_account(&self, username: String, password: String) -> Result<Account, StoreError> {
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO accounts (username, password, in_use, in_use_by, created_at)
                 VALUES (?1, ?2, 0, NULL, ?3)",
                params![username, password, created_at.to_rfc3339()],
            )
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    StoreError::Conflict(format!("account already exists: {}", username))
                } else {
                    StoreError::Backend(e.to_string())
                }
            })?;
            Ok(Account {
                username,
                password,
                in_use: false,
                in_use_by: None,
                created_at,
            })
        })
        .await
    }

    /// Atomically claim any unused account for `mysis_id`. The select and
    /// the mutation happen inside one transaction so no two concurrent
    /// callers can observe the same row as available.
    pub async fn claim_account(&self, mysis_id: Uuid) -> Result<Account, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let found: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT username, password, created_at FROM accounts WHERE in_use = 0 LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let (username, password, created_at) = found.ok_or(StoreError::NoAccountsAvailable)?;
            tx.execute(
                "UPDATE accounts SET in_use = 1, in_use_by = ?1 WHERE username = ?2 AND in_use = 0",
                params![mysis_id.to_string(), username],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            tx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(Account {
                username,
                password,
                in_use: true,
                in_use_by: Some(mysis_id),
                created_at: parse_timestamp(created_at)?,
            })
        })
        .await
    }

    pub async fn assign_account(&self, username: String, mysis_id: Uuid) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE accounts SET in_use = 1, in_use_by = ?1 WHERE username = ?2",
                    params![mysis_id.to_string(), username],
                )
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("account {}", username)));
            }
            Ok(())
        })
        .await
    }

    pub async fn release_account(&self, username: String) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE accounts SET in_use = 0, in_use_by = NULL WHERE username = ?1",
                params![username],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    pub async fn release_all_accounts(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE accounts SET in_use = 0, in_use_by = NULL", [])
                .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    pub async fn get_account_by_mysis(&self, mysis_id: Uuid) -> Result<Account, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT username, password, in_use, in_use_by, created_at FROM accounts WHERE in_use_by = ?1",
                params![mysis_id.to_string()],
                |row| {
                    Ok(Account {
                        username: row.get(0)?,
                        password: row.get(1)?,
                        in_use: row.get::<_, i64>(2)? != 0,
                        in_use_by: Some(mysis_id),
                        created_at: row.get::<_, String>(4).map(|s| parse_timestamp_infallible(&s))?,
                    })
                },
            )
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT username, password, in_use, in_use_by, created_at FROM accounts")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Account {
                        username: row.get(0)?,
                        password: row.get(1)?,
                        in_use: row.get::<_, i64>(2)? != 0,
                        in_use_by: row
                            .get::<_, Option<String>>(3)?
                            .map(|s| Uuid::parse_str(&s))
                            .transpose()
                            .map_err(|e| rusqlite::Error::InvalidColumnType(3, e.to_string(), rusqlite::types::Type::Text))?,
                        created_at: row.get::<_, String>(4).map(|s| parse_timestamp_infallible(&s))?,
                    })
                })
                .map_err(StoreError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(StoreError::from)?);
            }
            Ok(out)
        })
        .await
    }
}

fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn parse_timestamp(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn parse_timestamp_infallible(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn map_mysis_row(row: &rusqlite::Row) -> rusqlite::Result<MysisRecord> {
    let state: String = row.get(5)?;
    Ok(MysisRecord {
        id: parse_uuid(row.get::<_, String>(0)?)?,
        name: row.get(1)?,
        provider_name: row.get(2)?,
        model_name: row.get(3)?,
        temperature: row.get(4)?,
        state: MysisState::parse(&state)
            .map_err(|e| rusqlite::Error::InvalidColumnType(5, e.to_string(), rusqlite::types::Type::Text))?,
        last_error: row.get(6)?,
        created_at: parse_timestamp(row.get::<_, String>(7)?)?,
    })
}

fn map_memory_row(row: &rusqlite::Row) -> rusqlite::Result<MemoryEntry> {
    let role: String = row.get(2)?;
    let source: String = row.get(3)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        mysis_id: parse_uuid(row.get::<_, String>(1)?)?,
        role: MemoryRole::parse(&role)
            .map_err(|e| rusqlite::Error::InvalidColumnType(2, e.to_string(), rusqlite::types::Type::Text))?,
        source: MemorySource::parse(&source)
            .map_err(|e| rusqlite::Error::InvalidColumnType(3, e.to_string(), rusqlite::types::Type::Text))?,
        content: row.get(4)?,
        reasoning: row.get(5)?,
        sender_id: row
            .get::<_, Option<String>>(6)?
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| rusqlite::Error::InvalidColumnType(6, e.to_string(), rusqlite::types::Type::Text))?,
        tool_call_id: row.get(7)?,
        created_at: parse_timestamp(row.get::<_, String>(8)?)?,
    })
}

fn row_to_mysis(conn: &Connection, id: Uuid) -> Result<MysisRecord, StoreError> {
    conn.query_row(
        "SELECT id, name, provider_name, model_name, temperature, state, last_error, created_at FROM myses WHERE id = ?1",
        params![id.to_string()],
        map_mysis_row,
    )
    .map_err(StoreError::from)
}

/// Metadata about accounts currently in use, used by tests and the CLI's
/// status display.
pub fn in_use_summary(accounts: &[Account]) -> HashMap<bool, usize> {
    let mut counts = HashMap::new();
    for account in accounts {
        *counts.entry(account.in_use).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_mysis_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let created = store
            .create_mysis("alpha".into(), "local".into(), "local-model".into(), 0.7)
            .await
            .unwrap();
        let fetched = store.get_mysis(created.id).await.unwrap();
        assert_eq!(fetched.name, "alpha");
        assert_eq!(fetched.state, MysisState::Idle);
    }

    #[tokio::test]
    async fn duplicate_mysis_name_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_mysis("dup".into(), "local".into(), "m".into(), 0.5)
            .await
            .unwrap();
        let err = store
            .create_mysis("dup".into(), "local".into(), "m".into(), 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn memory_append_preserves_order() {
        let store = Store::open_in_memory().unwrap();
        let mysis = store
            .create_mysis("bravo".into(), "local".into(), "m".into(), 0.5)
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_memory(
                    mysis.id,
                    NewMemoryEntry {
                        role: MemoryRole::User,
                        source: MemorySource::Direct,
                        content: format!("entry-{}", i),
                        reasoning: None,
                        sender_id: None,
                        tool_call_id: None,
                    },
                )
                .await
                .unwrap();
        }
        let recent = store.recent_memories(mysis.id, 3).await.unwrap();
        assert_eq!(
            recent.iter().map(|m| m.content.clone()).collect::<Vec<_>>(),
            vec!["entry-2", "entry-3", "entry-4"]
        );
    }

    #[tokio::test]
    async fn search_memories_matches_substring() {
        let store = Store::open_in_memory().unwrap();
        let mysis = store
            .create_mysis("charlie".into(), "local".into(), "m".into(), 0.5)
            .await
            .unwrap();
        store
            .append_memory(
                mysis.id,
                NewMemoryEntry {
                    role: MemoryRole::Assistant,
                    source: MemorySource::Direct,
                    content: "the treasure is buried".into(),
                    reasoning: None,
                    sender_id: None,
                    tool_call_id: None,
                },
            )
            .await
            .unwrap();
        let hits = store.search_memories(mysis.id, "treasure".into(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn claim_account_is_exclusive_under_concurrency() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "p1".into()).await.unwrap();
        store.create_account("u2".into(), "p2".into()).await.unwrap();

        let mysis_ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut handles = Vec::new();
        for id in mysis_ids {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_account(id).await }));
        }
        let mut successes = 0;
        let mut failures = 0;
        let mut usernames = std::collections::HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(account) => {
                    successes += 1;
                    usernames.insert(account.username);
                }
                Err(StoreError::NoAccountsAvailable) => failures += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(successes, 2);
        assert_eq!(failures, 1);
        assert_eq!(usernames.len(), 2);
    }

    #[tokio::test]
    async fn release_account_clears_ownership() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "p1".into()).await.unwrap();
        let mysis_id = Uuid::new_v4();
        store.claim_account(mysis_id).await.unwrap();
        store.release_account("u1".into()).await.unwrap();
        let err = store.get_account_by_mysis(mysis_id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_accounts_and_in_use_summary_reflect_claims() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "p1".into()).await.unwrap();
        store.create_account("u2".into(), "p2".into()).await.unwrap();
        store.claim_account(Uuid::new_v4()).await.unwrap();

        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);

        let counts = in_use_summary(&accounts);
        assert_eq!(counts.get(&true).copied().unwrap_or(0), 1);
        assert_eq!(counts.get(&false).copied().unwrap_or(0), 1);
    }

    #[tokio::test]
    async fn broadcast_search_finds_recorded_content() {
        let store = Store::open_in_memory().unwrap();
        let sender = Uuid::new_v4();
        store.record_broadcast(sender, "rally at the gate".into()).await.unwrap();
        let hits = store.search_broadcasts("rally".into(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sender_id, sender);
    }
}
