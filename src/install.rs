//! Installation guard: decides at boot whether cached state can be trusted.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{KeyCheck, MetaStore};

/// `app_meta` key holding the installation identity.
pub const INSTALLATION_KEY: &str = "installation_id";

/// What the guard concluded about this boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
  /// Empty database; a new identity was written.
  Fresh,
  /// Identity present and the cache readable; nothing touched.
  Continuing,
  /// Data present without a readable identity; the cache was wiped.
  Reinstalled,
  /// Identity present but the cipher key changed; the cache was wiped.
  KeyChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
  pub id: String,
  pub boot: BootKind,
}

/// Runs the boot-time checks against a [`MetaStore`].
#[derive(Debug, Clone, Default)]
pub struct InstallationGuard {
  wipe_transactions: bool,
}

impl InstallationGuard {
  pub fn new() -> Self {
    Self::default()
  }

  /// Also empty the transaction log when a reinstall is detected. Off by
  /// default: queued writes survive a reinstall.
  pub fn wipe_transactions(mut self, wipe: bool) -> Self {
    self.wipe_transactions = wipe;
    self
  }

  pub fn boot<S: MetaStore + ?Sized>(&self, store: &S) -> Result<Installation> {
    let existing = store
      .meta(INSTALLATION_KEY)?
      .filter(|id| Uuid::parse_str(id).is_ok());

    if let Some(id) = existing {
      return match store.check_key()? {
        KeyCheck::Valid => Ok(Installation {
          id,
          boot: BootKind::Continuing,
        }),
        KeyCheck::Missing => {
          store.write_key_check()?;
          Ok(Installation {
            id,
            boot: BootKind::Continuing,
          })
        }
        KeyCheck::Mismatch => {
          warn!("cipher key changed since last boot, wiping unreadable cache");
          store.wipe_collections()?;
          store.write_key_check()?;
          Ok(Installation {
            id,
            boot: BootKind::KeyChanged,
          })
        }
      };
    }

    let boot = if store.is_empty()? {
      info!("fresh installation");
      BootKind::Fresh
    } else {
      warn!(
        wipe_transactions = self.wipe_transactions,
        "local data without installation identity, treating as reinstall"
      );
      store.wipe_collections()?;
      if self.wipe_transactions {
        store.wipe_transactions()?;
      }
      BootKind::Reinstalled
    };

    let id = Uuid::new_v4().to_string();
    store.set_meta(INSTALLATION_KEY, &id)?;
    store.write_key_check()?;
    info!(installation_id = %id, "wrote installation identity");

    Ok(Installation { id, boot })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{LocalStore, RecordCipher, SqliteStore, TransactionLog};
  use crate::transaction::{Method, NewTransaction};
  use serde_json::json;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory(RecordCipher::embedded()).unwrap()
  }

  fn queued(store: &SqliteStore) {
    store
      .enqueue(NewTransaction::new("people", Method::Post, "http://api/people").data(json!({})))
      .unwrap();
  }

  #[test]
  fn test_fresh_install_writes_identity() {
    let store = store();
    let install = InstallationGuard::new().boot(&store).unwrap();
    assert_eq!(install.boot, BootKind::Fresh);
    assert_eq!(store.meta(INSTALLATION_KEY).unwrap(), Some(install.id.clone()));
    assert!(store.is_empty().unwrap());
  }

  #[test]
  fn test_continuing_install_keeps_cache() {
    let store = store();
    let first = InstallationGuard::new().boot(&store).unwrap();
    store.put_value("people", "1", &json!({"name": "Alice"})).unwrap();

    let second = InstallationGuard::new().boot(&store).unwrap();
    assert_eq!(second.boot, BootKind::Continuing);
    assert_eq!(second.id, first.id);
    assert!(store.get_value("people", "1").unwrap().is_some());
  }

  #[test]
  fn test_reinstall_wipes_cache_but_keeps_log() {
    let store = store();
    store.put_value("people", "1", &json!({"name": "Alice"})).unwrap();
    queued(&store);

    let install = InstallationGuard::new().boot(&store).unwrap();
    assert_eq!(install.boot, BootKind::Reinstalled);
    assert!(store.get_value("people", "1").unwrap().is_none());
    assert_eq!(store.drain().unwrap().len(), 1);
  }

  #[test]
  fn test_reinstall_can_wipe_log() {
    let store = store();
    queued(&store);

    let install = InstallationGuard::new()
      .wipe_transactions(true)
      .boot(&store)
      .unwrap();
    assert_eq!(install.boot, BootKind::Reinstalled);
    assert!(store.drain().unwrap().is_empty());
  }

  #[test]
  fn test_unreadable_identity_counts_as_missing() {
    let store = store();
    store.set_meta(INSTALLATION_KEY, "not-a-uuid").unwrap();
    store.put_value("people", "1", &json!(1)).unwrap();

    let install = InstallationGuard::new().boot(&store).unwrap();
    assert_eq!(install.boot, BootKind::Reinstalled);
    assert_ne!(install.id, "not-a-uuid");
  }

  #[test]
  fn test_changed_key_wipes_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    {
      let store = SqliteStore::open(&path, RecordCipher::embedded()).unwrap();
      InstallationGuard::new().boot(&store).unwrap();
      store.put_value("people", "1", &json!(1)).unwrap();
    }

    let store = SqliteStore::open(&path, RecordCipher::from_secret("per-device")).unwrap();
    let install = InstallationGuard::new().boot(&store).unwrap();
    assert_eq!(install.boot, BootKind::KeyChanged);
    assert!(store.entries("people").unwrap().is_empty());

    let again = InstallationGuard::new().boot(&store).unwrap();
    assert_eq!(again.boot, BootKind::Continuing);
  }
}
