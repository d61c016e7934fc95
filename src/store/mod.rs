//! Encrypted local store and transaction log.
//!
//! Both live in one embedded SQLite database:
//! - `app_meta` holds the installation identity and the key canary
//! - `transactions` is the replay queue
//! - one `cache_<collection>` table per collection holds encrypted records

mod cipher;
mod sqlite;
mod traits;

pub use cipher::{RecordCipher, EMBEDDED_SECRET};
pub use sqlite::{collection_name, SqliteStore};
pub use traits::{KeyCheck, LocalStore, LocalStoreExt, MetaStore, OfflineStore, TransactionLog};
