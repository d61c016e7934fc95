//! Offline-first local cache and mutation replay for the ShiftWork API.
//!
//! Feature services read and write through [`Resource`]: reads go to the
//! network first and fall back to an encrypted local cache, writes that
//! cannot be confirmed are queued in a durable transaction log. The
//! [`SyncCoordinator`] replays that log, oldest first, whenever connectivity
//! comes back.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod install;
pub mod remote;
pub mod resource;
pub mod store;
pub mod sync;
pub mod transaction;

pub use config::Config;
pub use connectivity::Connectivity;
pub use engine::{Engine, EngineOptions};
pub use error::{Error, Result};
pub use install::{BootKind, Installation, InstallationGuard};
pub use remote::{HttpRemote, Remote, RemoteError, RemoteRequest};
pub use resource::{ClientState, ListQuery, Resource};
pub use store::{LocalStore, LocalStoreExt, OfflineStore, RecordCipher, SqliteStore, TransactionLog};
pub use sync::{SyncCoordinator, SyncReport};
pub use transaction::{ErrorClass, Method, NewTransaction, Transaction, TransactionState};
