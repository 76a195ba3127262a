//! Storage backend trait with SQLite and in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::entry::RawEntry;
use crate::db;

/// Trait for key/value storage backends.
///
/// Backends deal in JSON entries; typing happens in [`super::KvStore`].
pub trait StorageBackend: Send + Sync {
  /// Short name for logs.
  fn name(&self) -> &'static str;

  /// Get an entry by key, expired or not.
  fn get(&self, key: &str) -> Result<Option<RawEntry>>;

  /// Insert or replace an entry.
  fn put(&self, entry: &RawEntry) -> Result<()>;

  /// Delete an entry. Missing keys are not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// All entries, expired or not.
  fn get_all(&self) -> Result<Vec<RawEntry>>;

  fn get_all_keys(&self) -> Result<Vec<String>>;

  fn clear(&self) -> Result<()>;

  /// Delete every entry expired at `now`, returning how many were removed.
  ///
  /// The default walks every entry; backends with an expiration index override it.
  fn delete_expired(&self, now: i64) -> Result<usize> {
    let mut removed = 0;
    for entry in self.get_all()? {
      if entry.is_expired_at(now) {
        self.delete(&entry.key)?;
        removed += 1;
      }
    }
    Ok(removed)
  }
}

/// Fallback storage used when the database cannot be opened.
///
/// A bounded string map holding serialized entries, with no expiration index.
pub struct MemoryBackend {
  entries: Mutex<HashMap<String, String>>,
  max_entries: usize,
}

impl MemoryBackend {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      max_entries,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl StorageBackend for MemoryBackend {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn get(&self, key: &str) -> Result<Option<RawEntry>> {
    let entries = self.lock()?;
    entries
      .get(key)
      .map(|raw| {
        serde_json::from_str(raw).map_err(|e| eyre!("Failed to deserialize entry {}: {}", key, e))
      })
      .transpose()
  }

  fn put(&self, entry: &RawEntry) -> Result<()> {
    let raw =
      serde_json::to_string(entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    let mut entries = self.lock()?;

    if !entries.contains_key(&entry.key) && entries.len() >= self.max_entries {
      return Err(eyre!(
        "Fallback storage quota exceeded ({} entries)",
        self.max_entries
      ));
    }

    entries.insert(entry.key.clone(), raw);
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn get_all(&self) -> Result<Vec<RawEntry>> {
    let entries = self.lock()?;
    // Skip rows that no longer deserialize rather than failing the whole listing
    Ok(
      entries
        .values()
        .filter_map(|raw| serde_json::from_str(raw).ok())
        .collect(),
    )
  }

  fn get_all_keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn clear(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }
}

/// SQLite-based storage implementation.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open the store database at `path`, creating it if needed.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open(path)?),
    })
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory()?),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// key, data, created_at, ttl_ms, expires_at
type EntryRow = (String, String, i64, Option<i64>, Option<i64>);

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_entry((key, data, created_at, ttl, expires_at): EntryRow) -> Result<RawEntry> {
  let data =
    serde_json::from_str(&data).map_err(|e| eyre!("Failed to deserialize entry {}: {}", key, e))?;
  Ok(RawEntry {
    key,
    data,
    created_at,
    ttl,
    expires_at,
  })
}

impl StorageBackend for SqliteBackend {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn get(&self, key: &str) -> Result<Option<RawEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT key, data, created_at, ttl_ms, expires_at FROM kv_store
         WHERE key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![key], row_to_entry)
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    row.map(decode_entry).transpose()
  }

  fn put(&self, entry: &RawEntry) -> Result<()> {
    let conn = self.lock()?;
    let data =
      serde_json::to_string(&entry.data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, data, created_at, ttl_ms, expires_at)
         VALUES (?, ?, ?, ?, ?)",
        params![entry.key, data, entry.created_at, entry.ttl, entry.expires_at],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key, e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
    Ok(())
  }

  fn get_all(&self) -> Result<Vec<RawEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, data, created_at, ttl_ms, expires_at FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let entries = stmt
      .query_map([], row_to_entry)
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|row| decode_entry(row).ok())
      .collect();

    Ok(entries)
  }

  fn get_all_keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store", [])
      .map_err(|e| eyre!("Failed to clear store: {}", e))?;
    Ok(())
  }

  fn delete_expired(&self, now: i64) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?",
        params![now],
      )
      .map_err(|e| eyre!("Failed to delete expired entries: {}", e))?;
    Ok(removed)
  }
}
