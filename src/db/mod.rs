pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Local database handle, migrated and ready for the store.
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    debug!(path = %path.display(), "opening local database");
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Private, non-persistent database
  pub fn open_in_memory() -> Result<Self> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Default database path under the user's data directory
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("shiftsync").join("offline.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  pub fn into_connection(self) -> Connection {
    self.conn
  }
}
