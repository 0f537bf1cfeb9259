//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{CachedEntry, GenerationInfo, RequestKey, ResponseType, StoredResponse};
use crate::error::{CacheError, Result};

/// Trait for cache storage backends.
///
/// A backend holds named generations, each mapping request keys to stored
/// responses, plus the persisted active-generation marker.
pub trait CacheStorage: Send + Sync {
  /// Allocate a generation if absent. Returns `true` if it was created.
  fn create_generation(&self, name: &str) -> Result<bool>;

  /// Metadata for a single generation.
  fn generation(&self, name: &str) -> Result<Option<GenerationInfo>>;

  /// Metadata for all generations in creation order.
  fn generations(&self) -> Result<Vec<GenerationInfo>>;

  /// Mark a generation as fully populated from the manifest with `digest`.
  fn mark_ready(&self, name: &str, digest: &str) -> Result<()>;

  /// Make `name` the only active generation. It must be ready.
  fn set_active(&self, name: &str) -> Result<()>;

  /// Name of the persisted active generation, if any.
  fn active_generation(&self) -> Result<Option<String>>;

  /// Store entries into an existing generation as one unit, overwriting keys.
  fn put_entries(&self, generation: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()>;

  /// Exact-match lookup of a key within a generation.
  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Remove a generation and all its entries. Returns `false` if it was absent.
  fn delete_generation(&self, name: &str) -> Result<bool>;
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Storage that lives only as long as the process.
/// Used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<Vec<MemoryGeneration>>,
}

struct MemoryGeneration {
  name: String,
  digest: Option<String>,
  ready: bool,
  active: bool,
  created_at: DateTime<Utc>,
  entries: HashMap<RequestKey, CachedEntry>,
}

impl MemoryGeneration {
  fn info(&self) -> GenerationInfo {
    GenerationInfo {
      name: self.name.clone(),
      digest: self.digest.clone(),
      ready: self.ready,
      active: self.active,
      created_at: self.created_at,
      entries: self.entries.len(),
    }
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<MemoryGeneration>>> {
    self
      .generations
      .lock()
      .map_err(|e| CacheError::storage("Lock poisoned", e))
  }
}

fn missing_generation(name: &str) -> CacheError {
  CacheError::storage(
    format!("Generation {name}"),
    "no such generation in storage",
  )
}

impl CacheStorage for MemoryStorage {
  fn create_generation(&self, name: &str) -> Result<bool> {
    let mut generations = self.lock()?;
    if generations.iter().any(|g| g.name == name) {
      return Ok(false);
    }
    generations.push(MemoryGeneration {
      name: name.to_string(),
      digest: None,
      ready: false,
      active: false,
      created_at: Utc::now(),
      entries: HashMap::new(),
    });
    Ok(true)
  }

  fn generation(&self, name: &str) -> Result<Option<GenerationInfo>> {
    let generations = self.lock()?;
    Ok(generations.iter().find(|g| g.name == name).map(MemoryGeneration::info))
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let generations = self.lock()?;
    Ok(generations.iter().map(MemoryGeneration::info).collect())
  }

  fn mark_ready(&self, name: &str, digest: &str) -> Result<()> {
    let mut generations = self.lock()?;
    let generation = generations
      .iter_mut()
      .find(|g| g.name == name)
      .ok_or_else(|| missing_generation(name))?;
    generation.ready = true;
    generation.digest = Some(digest.to_string());
    Ok(())
  }

  fn set_active(&self, name: &str) -> Result<()> {
    let mut generations = self.lock()?;
    match generations.iter().find(|g| g.name == name) {
      Some(g) if g.ready => {}
      Some(_) => return Err(CacheError::NotReady(name.to_string())),
      None => return Err(missing_generation(name)),
    }
    for generation in generations.iter_mut() {
      generation.active = generation.name == name;
    }
    Ok(())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let generations = self.lock()?;
    Ok(generations.iter().find(|g| g.active).map(|g| g.name.clone()))
  }

  fn put_entries(&self, generation: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let mut generations = self.lock()?;
    let target = generations
      .iter_mut()
      .find(|g| g.name == generation)
      .ok_or_else(|| missing_generation(generation))?;
    let now = Utc::now();
    for (key, response) in entries {
      target.entries.insert(
        key.clone(),
        CachedEntry {
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find(|g| g.name == generation)
        .and_then(|g| g.entries.get(key).cloned()),
    )
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut generations = self.lock()?;
    let before = generations.len();
    generations.retain(|g| g.name != name);
    Ok(generations.len() != before)
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| CacheError::storage("Failed to create cache directory", e))?;
      }
    }

    let conn = Connection::open(&path).map_err(|e| {
      CacheError::storage(
        format!("Failed to open cache database at {}", path.display()),
        e,
      )
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory SQLite database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| CacheError::storage("Failed to open in-memory database", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("precache").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::storage("Lock poisoned", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::storage("Failed to run cache migrations", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    digest TEXT,
    ready INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (generation, request key); response snapshot inline
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, method, url),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);
"#;

const GENERATION_COLUMNS: &str = "g.name, g.digest, g.ready, g.active, g.created_at,
  (SELECT COUNT(*) FROM entries e WHERE e.generation = g.name)";

type GenerationRow = (String, Option<String>, bool, bool, String, i64);

fn read_generation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GenerationRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn generation_info(row: GenerationRow) -> Result<GenerationInfo> {
  let (name, digest, ready, active, created_at, entries) = row;
  Ok(GenerationInfo {
    name,
    digest,
    ready,
    active,
    created_at: parse_datetime(&created_at)?,
    entries: usize::try_from(entries).unwrap_or(0),
  })
}

fn generation_exists(conn: &Connection, name: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT 1 FROM generations WHERE name = ?",
      params![name],
      |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| CacheError::storage("Failed to query generation", e))
}

impl CacheStorage for SqliteStorage {
  fn create_generation(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?, datetime('now'))",
        params![name],
      )
      .map_err(|e| CacheError::storage("Failed to create generation", e))?;
    Ok(inserted > 0)
  }

  fn generation(&self, name: &str) -> Result<Option<GenerationInfo>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        &format!("SELECT {GENERATION_COLUMNS} FROM generations g WHERE g.name = ?"),
        params![name],
        read_generation_row,
      )
      .optional()
      .map_err(|e| CacheError::storage("Failed to query generation", e))?;

    row.map(generation_info).transpose()
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {GENERATION_COLUMNS} FROM generations g ORDER BY g.rowid"
      ))
      .map_err(|e| CacheError::storage("Failed to prepare generation query", e))?;

    let rows = stmt
      .query_map([], read_generation_row)
      .map_err(|e| CacheError::storage("Failed to query generations", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| CacheError::storage("Failed to read generation row", e))?;

    rows.into_iter().map(generation_info).collect()
  }

  fn mark_ready(&self, name: &str, digest: &str) -> Result<()> {
    let conn = self.lock()?;
    let updated = conn
      .execute(
        "UPDATE generations SET ready = 1, digest = ? WHERE name = ?",
        params![digest, name],
      )
      .map_err(|e| CacheError::storage("Failed to mark generation ready", e))?;
    if updated == 0 {
      return Err(missing_generation(name));
    }
    Ok(())
  }

  fn set_active(&self, name: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| CacheError::storage("Failed to begin transaction", e))?;

    let ready: Option<bool> = tx
      .query_row(
        "SELECT ready FROM generations WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| CacheError::storage("Failed to query generation", e))?;

    match ready {
      Some(true) => {}
      Some(false) => return Err(CacheError::NotReady(name.to_string())),
      None => return Err(missing_generation(name)),
    }

    tx.execute(
      "UPDATE generations SET active = (name = ?)",
      params![name],
    )
    .map_err(|e| CacheError::storage("Failed to set active generation", e))?;

    tx.commit()
      .map_err(|e| CacheError::storage("Failed to commit transaction", e))
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT name FROM generations WHERE active = 1 LIMIT 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| CacheError::storage("Failed to query active generation", e))
  }

  fn put_entries(&self, generation: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| CacheError::storage("Failed to begin transaction", e))?;

    if !generation_exists(&tx, generation)? {
      return Err(missing_generation(generation));
    }

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| CacheError::storage("Failed to serialize headers", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries
           (generation, method, url, response_url, status, response_type, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation,
          key.method,
          key.url,
          response.url,
          response.status,
          response.response_type.as_str(),
          headers,
          response.body,
        ],
      )
      .map_err(|e| CacheError::storage(format!("Failed to store entry {key}"), e))?;
    }

    tx.commit()
      .map_err(|e| CacheError::storage("Failed to commit transaction", e))
  }

  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<(String, u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT response_url, status, response_type, headers, body, cached_at FROM entries
         WHERE generation = ? AND method = ? AND url = ?",
        params![generation, key.method, key.url],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| CacheError::storage("Failed to query entry", e))?;

    let Some((url, status, response_type, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let response_type = ResponseType::parse(&response_type).ok_or_else(|| {
      CacheError::storage(
        format!("Entry {key}"),
        format!("unknown response type '{response_type}'"),
      )
    })?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| CacheError::storage("Failed to deserialize headers", e))?;

    Ok(Some(CachedEntry {
      response: StoredResponse {
        url,
        status,
        headers,
        body,
        response_type,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| CacheError::storage(format!("Failed to delete generation {name}"), e))?;
    Ok(deleted > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| CacheError::storage(format!("Failed to parse datetime '{s}'"), e))
}
