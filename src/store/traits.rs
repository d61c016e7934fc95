//! Storage-and-queue interface.
//!
//! Feature code only ever sees these traits, usually as `Arc<dyn OfflineStore>`,
//! so the backing store can be swapped without touching callers.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::transaction::{ErrorClass, NewTransaction, Transaction, TransactionState};

/// Encrypted, per-collection key/value cache.
///
/// Keys are namespaced by collection, so the same key in two collections
/// never collides. A write to an existing key replaces the whole value.
pub trait LocalStore: Send + Sync {
  /// Serialize, encrypt and upsert a record.
  fn put_value(&self, collection: &str, key: &str, value: &Value) -> Result<()>;

  /// Look up a record. Absent, undecryptable and unparseable records are all
  /// `Ok(None)`; only an unavailable store is an error.
  fn get_value(&self, collection: &str, key: &str) -> Result<Option<Value>>;

  /// Remove one record. Removing an absent key succeeds.
  fn delete(&self, collection: &str, key: &str) -> Result<()>;

  /// Remove every record in a collection.
  fn clear(&self, collection: &str) -> Result<()>;

  /// Upsert many records at once, atomically.
  fn put_many(&self, collection: &str, entries: &[(String, Value)]) -> Result<()>;

  /// Every readable record of a collection, ordered by key.
  fn entries(&self, collection: &str) -> Result<Vec<(String, Value)>>;

  /// Names of all collections that have a backing table.
  fn collections(&self) -> Result<Vec<String>>;
}

/// Typed helpers over [`LocalStore`].
pub trait LocalStoreExt: LocalStore {
  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    self.put_value(collection, key, &value)
  }

  fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
    let Some(value) = self.get_value(collection, key)? else {
      return Ok(None);
    };
    match serde_json::from_value(value) {
      Ok(entity) => Ok(Some(entity)),
      Err(e) => {
        warn!(collection, key, error = %e, "cached record has unexpected shape, ignoring");
        Ok(None)
      }
    }
  }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}

/// Durable, ordered queue of unconfirmed mutations.
pub trait TransactionLog: Send + Sync {
  /// Append an entry and return its id. No network I/O.
  fn enqueue(&self, tx: NewTransaction) -> Result<i64>;

  /// Snapshot of pending entries, oldest first. Does not remove anything.
  fn drain(&self) -> Result<Vec<Transaction>>;

  /// Delete an entry. Removing an absent id succeeds.
  fn remove(&self, id: i64) -> Result<()>;

  fn transaction(&self, id: i64) -> Result<Option<Transaction>>;

  /// Entries in the given state (or all entries), oldest first.
  fn list(&self, state: Option<TransactionState>) -> Result<Vec<Transaction>>;

  fn count(&self, state: TransactionState) -> Result<usize>;

  /// Record a failed replay. Increments the attempt counter and, when
  /// `quarantine` is set and the failure is permanent, moves the entry to
  /// [`TransactionState::Failed`].
  fn record_failure(
    &self,
    id: i64,
    class: ErrorClass,
    message: &str,
    quarantine: bool,
  ) -> Result<()>;

  /// Return a quarantined entry to the pending queue. False if `id` was not failed.
  fn retry(&self, id: i64) -> Result<bool>;

  /// The still-queued create that introduced `key`, if any.
  fn pending_create(&self, collection: &str, key: &str) -> Result<Option<i64>>;

  /// Remember the server identity assigned to a client-generated key.
  fn resolve_identity(&self, collection: &str, client_key: &str, server_id: &Value) -> Result<()>;

  fn resolved_identity(&self, collection: &str, client_key: &str) -> Result<Option<Value>>;

  /// Quarantined entries awaiting manual resolution.
  fn failed(&self) -> Result<Vec<Transaction>> {
    self.list(Some(TransactionState::Failed))
  }

  /// Pending entries waiting on `parent`.
  fn dependents(&self, parent: i64) -> Result<Vec<Transaction>> {
    Ok(
      self
        .list(Some(TransactionState::Pending))?
        .into_iter()
        .filter(|tx| tx.depends_on == Some(parent))
        .collect(),
    )
  }
}

/// Outcome of checking the configured cipher key against the stored canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
  Missing,
  Valid,
  Mismatch,
}

/// Bootstrap metadata used by the installation guard.
pub trait MetaStore: Send + Sync {
  fn meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;

  /// True when no collection holds a record and the log is empty.
  fn is_empty(&self) -> Result<bool>;

  /// Empty every collection table.
  fn wipe_collections(&self) -> Result<()>;

  /// Empty the transaction log and the identity map.
  fn wipe_transactions(&self) -> Result<()>;

  fn check_key(&self) -> Result<KeyCheck>;

  /// Store a canary sealed with the current key.
  fn write_key_check(&self) -> Result<()>;
}

/// Everything the engine needs from its backing store.
pub trait OfflineStore: LocalStore + TransactionLog + MetaStore {}

impl<S: LocalStore + TransactionLog + MetaStore> OfflineStore for S {}
