//! Error type shared by the store, the façade and the sync coordinator.

use thiserror::Error;

use crate::remote::RemoteError;

/// Errors surfaced by the offline engine.
#[derive(Debug, Error)]
pub enum Error {
  /// The local database could not be read or written. Write failures are
  /// fatal because durability can no longer be guaranteed.
  #[error("local storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("encryption error: {0}")]
  Crypto(String),

  /// The network call failed. For writes the mutation has already been
  /// queued by the time this is returned.
  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error("no active company selected")]
  NoActiveCompany,

  #[error("invalid collection name: {0:?}")]
  InvalidCollection(String),

  #[error("entity payload must be a JSON object")]
  NotAnObject,

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),
}

impl Error {
  /// The remote error behind this error, if the failure came from the network.
  pub fn as_remote(&self) -> Option<&RemoteError> {
    match self {
      Error::Remote(e) => Some(e),
      _ => None,
    }
  }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
  fn from(e: std::sync::PoisonError<T>) -> Self {
    Error::LockPoisoned(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
