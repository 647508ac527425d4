// Credential persistence
// One record per external system, replaced atomically on every save

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::types::{CredentialRecord, System};

/// Durable storage for the single credential record of each system
///
/// `load` returns `Ok(None)` when the system has never been authorized.
/// `save` replaces the record (or creates it) in one atomic step.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, system: System) -> Result<Option<CredentialRecord>>;

    async fn save(&self, system: System, record: &CredentialRecord) -> Result<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS oauth_credentials (
    system TEXT PRIMARY KEY NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// SQLite-backed credential store
///
/// rusqlite is blocking, so every statement runs on the blocking pool.
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory for {}", path.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// Non-durable database, used by tests and `CREDENTIALS_DB_FILE=:memory:`
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create oauth_credentials table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("Credential database lock poisoned"))?;
            f(&guard)
        })
        .await
        .context("Credential store task failed")?
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self, system: System) -> Result<Option<CredentialRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT access_token, refresh_token, expires_at, updated_at \
                 FROM oauth_credentials WHERE system = ?1",
                [system.as_str()],
                |row| {
                    Ok(CredentialRecord {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        expires_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("Failed to load {} credentials", system))
        })
        .await
    }

    async fn save(&self, system: System, record: &CredentialRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO oauth_credentials (system, access_token, refresh_token, expires_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(system) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    system.as_str(),
                    record.access_token,
                    record.refresh_token,
                    record.expires_at,
                    record.updated_at,
                ],
            )
            .with_context(|| format!("Failed to save {} credentials", system))?;
            Ok(())
        })
        .await
    }
}

/// In-process credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<System, CredentialRecord>>,
    saves: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one record
    pub fn with_record(system: System, record: CredentialRecord) -> Self {
        let mut records = HashMap::new();
        records.insert(system, record);
        Self {
            records: RwLock::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, system: System) -> Result<Option<CredentialRecord>> {
        Ok(self.records.read().await.get(&system).cloned())
    }

    async fn save(&self, system: System, record: &CredentialRecord) -> Result<()> {
        self.records.write().await.insert(system, record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
