//! SQLite implementation of the local store, transaction log and metadata.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::cipher::RecordCipher;
use super::traits::{KeyCheck, LocalStore, MetaStore, TransactionLog};
use crate::db::schema::CACHE_TABLE_PREFIX;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::transaction::{ErrorClass, Method, NewTransaction, Transaction, TransactionState};

const KEY_CHECK_META: &str = "cipher_check";
const KEY_CHECK_PLAINTEXT: &[u8] = b"shiftsync-key-check";

const TRANSACTION_COLUMNS: &str = "id, collection, key, data, timestamp, method, endpoint, payload, \
   id_field, pending_identity, depends_on, state, error_class, last_error, attempts";

fn valid_name(name: &str) -> bool {
  !name.is_empty()
    && name.len() <= 64
    && name
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Map a resource path to a collection name.
///
/// `/people` becomes `people`, `/time-off-requests` becomes
/// `time_off_requests`. Paths are single lowercase segments of `[a-z0-9-]`;
/// anything else is rejected rather than folded, so two different paths can
/// never land in the same table.
pub fn collection_name(path: &str) -> Result<String> {
  let segment = path.trim_matches('/');
  let valid = segment
    .chars()
    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
  let name = segment.replace('-', "_");

  if valid && valid_name(&name) {
    Ok(name)
  } else {
    Err(Error::InvalidCollection(path.to_string()))
  }
}

fn table_for(collection: &str) -> Result<String> {
  if !valid_name(collection) {
    return Err(Error::InvalidCollection(collection.to_string()));
  }
  Ok(format!("\"{}{}\"", CACHE_TABLE_PREFIX, collection))
}

/// Store backed by a single SQLite connection.
///
/// Every operation takes the connection lock for its whole duration, so each
/// single-record write is atomic with respect to every other caller.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  cipher: RecordCipher,
}

impl SqliteStore {
  pub fn open(path: &Path, cipher: RecordCipher) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self::from_database(db, cipher))
  }

  pub fn open_in_memory(cipher: RecordCipher) -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self::from_database(db, cipher))
  }

  fn from_database(db: Database, cipher: RecordCipher) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
      cipher,
    }
  }

  fn encrypt(&self, value: &Value) -> Result<Vec<u8>> {
    let plaintext = serde_json::to_vec(value)?;
    self.cipher.seal(&plaintext)
  }

  /// Decrypt and parse one stored blob. Corruption is logged and reported as `None`.
  fn decrypt(&self, collection: &str, key: &str, blob: &[u8]) -> Option<Value> {
    let plaintext = match self.cipher.open(blob) {
      Ok(p) => p,
      Err(e) => {
        warn!(collection, key, error = %e, "cached record could not be decrypted");
        return None;
      }
    };
    match serde_json::from_slice(&plaintext) {
      Ok(v) => Some(v),
      Err(e) => {
        warn!(collection, key, error = %e, "cached record is not valid JSON");
        None
      }
    }
  }
}

fn ensure_table(conn: &Connection, table: &str) -> rusqlite::Result<()> {
  conn.execute_batch(&format!(
    "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value BLOB NOT NULL)",
    table
  ))
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
  let bare = table.trim_matches('"');
  conn.query_row(
    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
    params![bare],
    |row| row.get(0),
  )
}

fn cache_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
  let mut stmt = conn.prepare(
    "SELECT name FROM sqlite_master
     WHERE type = 'table' AND name LIKE 'cache\\_%' ESCAPE '\\'
     ORDER BY name",
  )?;
  let names = stmt
    .query_map([], |row| row.get::<_, String>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(names)
}

fn conversion_failure(
  column: usize,
  e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(column, Type::Text, e.into())
}

fn json_column(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<Value>> {
  let text: Option<String> = row.get(column)?;
  text
    .map(|t| serde_json::from_str(&t).map_err(|e| conversion_failure(column, e)))
    .transpose()
}

fn json_text(value: &Option<Value>) -> Result<Option<String>> {
  value
    .as_ref()
    .map(serde_json::to_string)
    .transpose()
    .map_err(Error::from)
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
  let timestamp: String = row.get(4)?;
  let timestamp = DateTime::parse_from_rfc3339(&timestamp)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|e| conversion_failure(4, e))?;

  let method: String = row.get(5)?;
  let method = method.parse::<Method>().map_err(|e| conversion_failure(5, e))?;

  let state: String = row.get(11)?;
  let state = TransactionState::parse(&state)
    .ok_or_else(|| conversion_failure(11, format!("unknown state {}", state)))?;

  let error_class: Option<String> = row.get(12)?;

  Ok(Transaction {
    id: row.get(0)?,
    collection: row.get(1)?,
    key: row.get(2)?,
    data: json_column(row, 3)?,
    timestamp,
    method,
    endpoint: row.get(6)?,
    payload: json_column(row, 7)?,
    id_field: row.get(8)?,
    pending_identity: row.get(9)?,
    depends_on: row.get(10)?,
    state,
    error_class: error_class.as_deref().and_then(ErrorClass::parse),
    last_error: row.get(13)?,
    attempts: row.get(14)?,
  })
}

impl LocalStore for SqliteStore {
  fn put_value(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
    let table = table_for(collection)?;
    let blob = self.encrypt(value)?;

    let conn = self.conn.lock()?;
    ensure_table(&conn, &table)?;
    conn.execute(
      &format!(
        "INSERT INTO {} (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        table
      ),
      params![key, blob],
    )?;

    debug!(collection, key, "cached record");
    Ok(())
  }

  fn get_value(&self, collection: &str, key: &str) -> Result<Option<Value>> {
    let table = table_for(collection)?;
    let conn = self.conn.lock()?;
    if !table_exists(&conn, &table)? {
      return Ok(None);
    }

    let blob: Option<Vec<u8>> = conn
      .query_row(
        &format!("SELECT value FROM {} WHERE key = ?1", table),
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    drop(conn);

    Ok(blob.and_then(|b| self.decrypt(collection, key, &b)))
  }

  fn delete(&self, collection: &str, key: &str) -> Result<()> {
    let table = table_for(collection)?;
    let conn = self.conn.lock()?;
    if table_exists(&conn, &table)? {
      conn.execute(&format!("DELETE FROM {} WHERE key = ?1", table), params![key])?;
    }
    Ok(())
  }

  fn clear(&self, collection: &str) -> Result<()> {
    let table = table_for(collection)?;
    let conn = self.conn.lock()?;
    if table_exists(&conn, &table)? {
      conn.execute(&format!("DELETE FROM {}", table), [])?;
    }
    Ok(())
  }

  fn put_many(&self, collection: &str, entries: &[(String, Value)]) -> Result<()> {
    let table = table_for(collection)?;
    let blobs = entries
      .iter()
      .map(|(key, value)| self.encrypt(value).map(|blob| (key.as_str(), blob)))
      .collect::<Result<Vec<_>>>()?;

    let conn = self.conn.lock()?;
    ensure_table(&conn, &table)?;
    let tx = conn.unchecked_transaction()?;
    {
      let mut stmt = tx.prepare(&format!(
        "INSERT INTO {} (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        table
      ))?;
      for (key, blob) in &blobs {
        stmt.execute(params![key, blob])?;
      }
    }
    tx.commit()?;

    debug!(collection, count = entries.len(), "cached records");
    Ok(())
  }

  fn entries(&self, collection: &str) -> Result<Vec<(String, Value)>> {
    let table = table_for(collection)?;
    let conn = self.conn.lock()?;
    if !table_exists(&conn, &table)? {
      return Ok(Vec::new());
    }

    let rows: Vec<(String, Vec<u8>)> = conn
      .prepare(&format!("SELECT key, value FROM {} ORDER BY key", table))?
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<rusqlite::Result<_>>()?;
    drop(conn);

    Ok(
      rows
        .into_iter()
        .filter_map(|(key, blob)| {
          let value = self.decrypt(collection, &key, &blob)?;
          Some((key, value))
        })
        .collect(),
    )
  }

  fn collections(&self) -> Result<Vec<String>> {
    let conn = self.conn.lock()?;
    Ok(
      cache_tables(&conn)?
        .into_iter()
        .filter_map(|t| t.strip_prefix(CACHE_TABLE_PREFIX).map(String::from))
        .collect(),
    )
  }
}

impl TransactionLog for SqliteStore {
  fn enqueue(&self, tx: NewTransaction) -> Result<i64> {
    let data = json_text(&tx.data)?;
    let payload = json_text(&tx.payload)?;

    let conn = self.conn.lock()?;
    conn.execute(
      "INSERT INTO transactions (collection, key, data, timestamp, method, endpoint, payload,
         id_field, pending_identity, depends_on, state, error_class, last_error)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
      params![
        tx.collection,
        tx.key,
        data,
        Utc::now().to_rfc3339(),
        tx.method.as_str(),
        tx.endpoint,
        payload,
        tx.id_field,
        tx.pending_identity,
        tx.depends_on,
        tx.state.as_str(),
        tx.error_class.map(|c| c.as_str()),
        tx.last_error,
      ],
    )?;
    let id = conn.last_insert_rowid();

    info!(
      id,
      collection = %tx.collection,
      method = %tx.method,
      state = tx.state.as_str(),
      "queued transaction"
    );
    Ok(id)
  }

  fn drain(&self) -> Result<Vec<Transaction>> {
    self.list(Some(TransactionState::Pending))
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.conn.lock()?;
    conn.execute("DELETE FROM transactions WHERE id = ?1", params![id])?;
    Ok(())
  }

  fn transaction(&self, id: i64) -> Result<Option<Transaction>> {
    let conn = self.conn.lock()?;
    let tx = conn
      .query_row(
        &format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLUMNS),
        params![id],
        row_to_transaction,
      )
      .optional()?;
    Ok(tx)
  }

  fn list(&self, state: Option<TransactionState>) -> Result<Vec<Transaction>> {
    let conn = self.conn.lock()?;
    let txs = match state {
      Some(state) => conn
        .prepare(&format!(
          "SELECT {} FROM transactions WHERE state = ?1 ORDER BY id",
          TRANSACTION_COLUMNS
        ))?
        .query_map(params![state.as_str()], row_to_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?,
      None => conn
        .prepare(&format!(
          "SELECT {} FROM transactions ORDER BY id",
          TRANSACTION_COLUMNS
        ))?
        .query_map([], row_to_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(txs)
  }

  fn count(&self, state: TransactionState) -> Result<usize> {
    let conn = self.conn.lock()?;
    let n: i64 = conn.query_row(
      "SELECT COUNT(*) FROM transactions WHERE state = ?1",
      params![state.as_str()],
      |row| row.get(0),
    )?;
    Ok(n as usize)
  }

  fn record_failure(
    &self,
    id: i64,
    class: ErrorClass,
    message: &str,
    quarantine: bool,
  ) -> Result<()> {
    let quarantined = quarantine && class == ErrorClass::Permanent;
    let conn = self.conn.lock()?;
    conn.execute(
      "UPDATE transactions
       SET attempts = attempts + 1,
           error_class = ?2,
           last_error = ?3,
           state = CASE WHEN ?4 THEN 'failed' ELSE state END
       WHERE id = ?1",
      params![id, class.as_str(), message, quarantined],
    )?;
    Ok(())
  }

  fn retry(&self, id: i64) -> Result<bool> {
    let conn = self.conn.lock()?;
    let changed = conn.execute(
      "UPDATE transactions SET state = 'pending' WHERE id = ?1 AND state = 'failed'",
      params![id],
    )?;
    Ok(changed > 0)
  }

  fn pending_create(&self, collection: &str, key: &str) -> Result<Option<i64>> {
    let conn = self.conn.lock()?;
    let id = conn
      .query_row(
        "SELECT id FROM transactions
         WHERE collection = ?1 AND key = ?2 AND method = 'POST'
           AND pending_identity = 1 AND state != 'audit'
         ORDER BY id DESC LIMIT 1",
        params![collection, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(id)
  }

  fn resolve_identity(&self, collection: &str, client_key: &str, server_id: &Value) -> Result<()> {
    let server_id = serde_json::to_string(server_id)?;
    let conn = self.conn.lock()?;
    conn.execute(
      "INSERT INTO identity_map (collection, client_key, server_id) VALUES (?1, ?2, ?3)
       ON CONFLICT(collection, client_key) DO UPDATE SET server_id = excluded.server_id",
      params![collection, client_key, server_id],
    )?;
    Ok(())
  }

  fn resolved_identity(&self, collection: &str, client_key: &str) -> Result<Option<Value>> {
    let conn = self.conn.lock()?;
    let text: Option<String> = conn
      .query_row(
        "SELECT server_id FROM identity_map WHERE collection = ?1 AND client_key = ?2",
        params![collection, client_key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
  }
}

impl MetaStore for SqliteStore {
  fn meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM app_meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO app_meta (key, value) VALUES (?1, ?2)",
      params![key, value],
    )?;
    Ok(())
  }

  fn is_empty(&self) -> Result<bool> {
    let conn = self.conn.lock()?;
    let queued: bool = conn.query_row(
      "SELECT EXISTS(SELECT 1 FROM transactions)",
      [],
      |row| row.get(0),
    )?;
    if queued {
      return Ok(false);
    }
    for table in cache_tables(&conn)? {
      let has_rows: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM \"{}\")", table),
        [],
        |row| row.get(0),
      )?;
      if has_rows {
        return Ok(false);
      }
    }
    Ok(true)
  }

  fn wipe_collections(&self) -> Result<()> {
    let conn = self.conn.lock()?;
    let tx = conn.unchecked_transaction()?;
    let tables = cache_tables(&tx)?;
    for table in &tables {
      tx.execute(&format!("DELETE FROM \"{}\"", table), [])?;
    }
    tx.commit()?;
    info!(tables = tables.len(), "wiped cached collections");
    Ok(())
  }

  fn wipe_transactions(&self) -> Result<()> {
    let conn = self.conn.lock()?;
    conn.execute_batch("DELETE FROM transactions; DELETE FROM identity_map;")?;
    info!("wiped transaction log");
    Ok(())
  }

  fn check_key(&self) -> Result<KeyCheck> {
    let Some(stored) = self.meta(KEY_CHECK_META)? else {
      return Ok(KeyCheck::Missing);
    };
    let opened = hex::decode(stored)
      .ok()
      .and_then(|sealed| self.cipher.open(&sealed).ok());
    Ok(match opened {
      Some(plaintext) if plaintext == KEY_CHECK_PLAINTEXT => KeyCheck::Valid,
      _ => KeyCheck::Mismatch,
    })
  }

  fn write_key_check(&self) -> Result<()> {
    let sealed = self.cipher.seal(KEY_CHECK_PLAINTEXT)?;
    self.set_meta(KEY_CHECK_META, &hex::encode(sealed))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::traits::LocalStoreExt;
  use serde_json::json;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory(RecordCipher::embedded()).unwrap()
  }

  fn post(collection: &str, key: &str) -> NewTransaction {
    NewTransaction::new(collection, Method::Post, &format!("http://api/{}", collection))
      .key(key)
      .data(json!({"id": key}))
  }

  #[test]
  fn test_collection_name_from_path() {
    assert_eq!(collection_name("/people").unwrap(), "people");
    assert_eq!(collection_name("/time-off-requests").unwrap(), "time_off_requests");
    assert_eq!(collection_name("locations/").unwrap(), "locations");
    assert!(collection_name("/").is_err());
    assert!(collection_name("people; DROP TABLE x").is_err());
  }

  #[test]
  fn test_distinct_paths_never_share_a_collection() {
    assert!(collection_name("/time_off").is_err());
    assert!(collection_name("/Time-Off").is_err());
    assert!(collection_name("/time.off").is_err());
    assert!(collection_name("/time/off").is_err());
    assert_eq!(collection_name("/time-off").unwrap(), "time_off");
  }

  #[test]
  fn test_collection_labels_are_not_folded() {
    let store = store();
    assert!(matches!(
      store.put_value("People", "1", &json!(1)),
      Err(Error::InvalidCollection(_))
    ));
    assert!(store.put_value("time-off", "1", &json!(1)).is_err());
    store.put_value("time_off", "1", &json!(1)).unwrap();
    assert_eq!(store.collections().unwrap(), vec!["time_off"]);
  }

  #[test]
  fn test_put_then_get_round_trips() {
    let store = store();
    let value = json!({"name": "Alice", "tags": ["a", "b"], "age": 31});
    store.put_value("people", "1", &value).unwrap();
    assert_eq!(store.get_value("people", "1").unwrap(), Some(value));
  }

  #[test]
  fn test_value_is_stored_encrypted() {
    let store = store();
    store.put_value("people", "1", &json!({"name": "Alice"})).unwrap();
    let conn = store.conn.lock().unwrap();
    let blob: Vec<u8> = conn
      .query_row("SELECT value FROM cache_people WHERE key = '1'", [], |row| row.get(0))
      .unwrap();
    assert!(!String::from_utf8_lossy(&blob).contains("Alice"));
  }

  #[test]
  fn test_last_put_wins() {
    let store = store();
    store.put_value("people", "1", &json!({"name": "Alice", "role": "admin"})).unwrap();
    store.put_value("people", "1", &json!({"name": "Bob"})).unwrap();
    assert_eq!(store.get_value("people", "1").unwrap(), Some(json!({"name": "Bob"})));
  }

  #[test]
  fn test_collections_are_namespaced() {
    let store = store();
    store.put_value("people", "7", &json!("person")).unwrap();
    store.put_value("locations", "7", &json!("location")).unwrap();
    assert_eq!(store.get_value("people", "7").unwrap(), Some(json!("person")));
    assert_eq!(store.get_value("locations", "7").unwrap(), Some(json!("location")));
    assert_eq!(store.collections().unwrap(), vec!["locations", "people"]);
  }

  #[test]
  fn test_missing_record_and_table_are_none() {
    let store = store();
    assert_eq!(store.get_value("locations", "7").unwrap(), None);
    store.put_value("locations", "1", &json!(1)).unwrap();
    assert_eq!(store.get_value("locations", "7").unwrap(), None);
  }

  #[test]
  fn test_corrupted_ciphertext_reads_as_none() {
    let store = store();
    store.put_value("people", "1", &json!({"name": "Alice"})).unwrap();
    {
      let conn = store.conn.lock().unwrap();
      conn
        .execute(
          "UPDATE cache_people SET value = X'00112233445566778899AABBCCDDEEFF' WHERE key = '1'",
          [],
        )
        .unwrap();
    }
    assert_eq!(store.get_value("people", "1").unwrap(), None);
  }

  #[test]
  fn test_typed_get_with_wrong_shape_is_none() {
    #[derive(serde::Deserialize)]
    struct Person {
      #[allow(dead_code)]
      name: String,
    }
    let store = store();
    store.put("people", "1", &json!([1, 2, 3])).unwrap();
    assert!(store.get::<Person>("people", "1").unwrap().is_none());
  }

  #[test]
  fn test_delete_is_idempotent() {
    let store = store();
    store.delete("people", "missing").unwrap();
    store.put_value("people", "1", &json!(1)).unwrap();
    store.delete("people", "1").unwrap();
    store.delete("people", "1").unwrap();
    assert_eq!(store.get_value("people", "1").unwrap(), None);
  }

  #[test]
  fn test_put_many_and_entries() {
    let store = store();
    store
      .put_many(
        "tasks",
        &[("b".into(), json!({"n": 2})), ("a".into(), json!({"n": 1}))],
      )
      .unwrap();
    assert_eq!(
      store.entries("tasks").unwrap(),
      vec![("a".into(), json!({"n": 1})), ("b".into(), json!({"n": 2}))]
    );
    store.clear("tasks").unwrap();
    assert!(store.entries("tasks").unwrap().is_empty());
    assert!(store.entries("never_written").unwrap().is_empty());
  }

  #[test]
  fn test_drain_is_oldest_first_and_non_destructive() {
    let store = store();
    let a = store.enqueue(post("people", "a")).unwrap();
    let b = store.enqueue(post("locations", "b")).unwrap();
    let c = store.enqueue(post("people", "c")).unwrap();
    assert!(a < b && b < c);

    let ids: Vec<i64> = store.drain().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![a, b, c]);
    assert_eq!(store.drain().unwrap().len(), 3);
  }

  #[test]
  fn test_enqueue_preserves_fields() {
    let store = store();
    let id = store
      .enqueue(
        NewTransaction::new("people", Method::Put, "http://api/people/1")
          .key("1")
          .data(json!({"name": "Alice"}))
          .payload(json!({"name": "Alice"}))
          .id_field("personId"),
      )
      .unwrap();
    let tx = store.transaction(id).unwrap().unwrap();
    assert_eq!(tx.method, Method::Put);
    assert_eq!(tx.key.as_deref(), Some("1"));
    assert_eq!(tx.endpoint, "http://api/people/1");
    assert_eq!(tx.payload, Some(json!({"name": "Alice"})));
    assert_eq!(tx.id_field.as_deref(), Some("personId"));
    assert_eq!(tx.state, TransactionState::Pending);
    assert_eq!(tx.attempts, 0);
  }

  #[test]
  fn test_remove_absent_id_is_noop() {
    let store = store();
    store.remove(999).unwrap();
    let id = store.enqueue(post("people", "a")).unwrap();
    store.remove(id).unwrap();
    store.remove(id).unwrap();
    assert!(store.drain().unwrap().is_empty());
  }

  #[test]
  fn test_ids_are_never_reused() {
    let store = store();
    let first = store.enqueue(post("people", "a")).unwrap();
    store.remove(first).unwrap();
    let second = store.enqueue(post("people", "b")).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_drain_skips_failed_and_audit() {
    let store = store();
    store
      .enqueue(NewTransaction::new("people", Method::Get, "http://api/people/1"))
      .unwrap();
    let bad = store.enqueue(post("people", "bad")).unwrap();
    let good = store.enqueue(post("people", "good")).unwrap();

    store
      .record_failure(bad, ErrorClass::Permanent, "400 Bad Request", true)
      .unwrap();

    let ids: Vec<i64> = store.drain().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![good]);
    assert_eq!(store.count(TransactionState::Audit).unwrap(), 1);

    let failed = store.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_class, Some(ErrorClass::Permanent));
    assert_eq!(failed[0].last_error.as_deref(), Some("400 Bad Request"));
    assert_eq!(failed[0].attempts, 1);
  }

  #[test]
  fn test_transient_failure_stays_pending() {
    let store = store();
    let id = store.enqueue(post("people", "a")).unwrap();
    store.record_failure(id, ErrorClass::Transient, "503", true).unwrap();
    store.record_failure(id, ErrorClass::Transient, "503", true).unwrap();
    let tx = store.transaction(id).unwrap().unwrap();
    assert_eq!(tx.state, TransactionState::Pending);
    assert_eq!(tx.attempts, 2);
  }

  #[test]
  fn test_retry_returns_failed_entry_to_queue() {
    let store = store();
    let id = store.enqueue(post("people", "a")).unwrap();
    assert!(!store.retry(id).unwrap());
    store.record_failure(id, ErrorClass::Permanent, "422", true).unwrap();
    assert!(store.retry(id).unwrap());
    assert_eq!(store.drain().unwrap().len(), 1);
  }

  #[test]
  fn test_pending_create_lookup() {
    let store = store();
    assert_eq!(store.pending_create("people", "tmp-1").unwrap(), None);
    let id = store.enqueue(post("people", "tmp-1").pending_identity()).unwrap();
    store.enqueue(post("people", "tmp-2")).unwrap();
    assert_eq!(store.pending_create("people", "tmp-1").unwrap(), Some(id));
    assert_eq!(store.pending_create("people", "tmp-2").unwrap(), None);
    assert_eq!(store.pending_create("locations", "tmp-1").unwrap(), None);
  }

  #[test]
  fn test_identity_map() {
    let store = store();
    assert_eq!(store.resolved_identity("people", "tmp-1").unwrap(), None);
    store.resolve_identity("people", "tmp-1", &json!(42)).unwrap();
    assert_eq!(store.resolved_identity("people", "tmp-1").unwrap(), Some(json!(42)));
  }

  #[test]
  fn test_emptiness_and_wipes() {
    let store = store();
    assert!(store.is_empty().unwrap());

    store.put_value("people", "1", &json!(1)).unwrap();
    store.enqueue(post("people", "a")).unwrap();
    assert!(!store.is_empty().unwrap());

    store.wipe_collections().unwrap();
    assert_eq!(store.get_value("people", "1").unwrap(), None);
    assert!(!store.is_empty().unwrap());

    store.wipe_transactions().unwrap();
    assert!(store.is_empty().unwrap());
  }

  #[test]
  fn test_key_check_detects_new_secret() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let store = SqliteStore::open(&path, RecordCipher::embedded()).unwrap();
    assert_eq!(store.check_key().unwrap(), KeyCheck::Missing);
    store.write_key_check().unwrap();
    assert_eq!(store.check_key().unwrap(), KeyCheck::Valid);
    drop(store);

    let store = SqliteStore::open(&path, RecordCipher::from_secret("rotated")).unwrap();
    assert_eq!(store.check_key().unwrap(), KeyCheck::Mismatch);
  }

  #[test]
  fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    {
      let store = SqliteStore::open(&path, RecordCipher::embedded()).unwrap();
      store.put_value("people", "1", &json!({"name": "Alice"})).unwrap();
      store.enqueue(post("people", "a")).unwrap();
    }
    let store = SqliteStore::open(&path, RecordCipher::embedded()).unwrap();
    assert_eq!(store.get_value("people", "1").unwrap(), Some(json!({"name": "Alice"})));
    assert_eq!(store.drain().unwrap().len(), 1);
  }
}
