//! Queued mutation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// HTTP verb captured with a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  /// Read-through audit record; never replayed.
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unknown method {}", other)),
    }
  }
}

/// Failure class assigned by the retry classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
  /// Might succeed later: timeouts, unreachable host, 5xx, 408/425/429.
  Transient,
  /// Will fail on every replay: any other 4xx.
  Permanent,
}

impl ErrorClass {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorClass::Transient => "transient",
      ErrorClass::Permanent => "permanent",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "transient" => Some(ErrorClass::Transient),
      "permanent" => Some(ErrorClass::Permanent),
      _ => None,
    }
  }
}

/// Where a queue entry sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
  /// Waiting for replay.
  Pending,
  /// Quarantined after a permanent failure; needs manual resolution.
  Failed,
  /// Read-through record of a successful GET.
  Audit,
}

impl TransactionState {
  pub fn as_str(&self) -> &'static str {
    match self {
      TransactionState::Pending => "pending",
      TransactionState::Failed => "failed",
      TransactionState::Audit => "audit",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(TransactionState::Pending),
      "failed" => Some(TransactionState::Failed),
      "audit" => Some(TransactionState::Audit),
      _ => None,
    }
  }
}

/// A persisted queue entry.
///
/// The replayed tuple (`method`, `endpoint`, `payload`) never changes after
/// enqueue. Only the bookkeeping fields (`state`, `error_class`,
/// `last_error`, `attempts`) are updated by the sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  /// Store-assigned, strictly increasing. This is the replay order.
  pub id: i64,
  pub collection: String,
  pub key: Option<String>,
  pub data: Option<Value>,
  pub method: Method,
  /// Fully-resolved absolute URL captured at enqueue time.
  pub endpoint: String,
  pub payload: Option<Value>,
  pub timestamp: DateTime<Utc>,
  /// Field of the server response that carries the entity identity.
  pub id_field: Option<String>,
  /// A create whose server-assigned identity is not known yet.
  pub pending_identity: bool,
  /// Queue entry this one must wait for (update or delete after an unconfirmed create).
  pub depends_on: Option<i64>,
  pub state: TransactionState,
  pub error_class: Option<ErrorClass>,
  pub last_error: Option<String>,
  pub attempts: u32,
}

impl Transaction {
  /// Body sent on replay. Falls back to `data` for entries queued without an
  /// explicit payload.
  pub fn body(&self) -> Option<&Value> {
    match self.method {
      Method::Get | Method::Delete => None,
      Method::Post | Method::Put => self.payload.as_ref().or(self.data.as_ref()),
    }
  }
}

/// A queue entry before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
  pub collection: String,
  pub key: Option<String>,
  pub data: Option<Value>,
  pub method: Method,
  pub endpoint: String,
  pub payload: Option<Value>,
  pub id_field: Option<String>,
  pub pending_identity: bool,
  pub depends_on: Option<i64>,
  pub state: TransactionState,
  pub error_class: Option<ErrorClass>,
  pub last_error: Option<String>,
}

impl NewTransaction {
  pub fn new(collection: &str, method: Method, endpoint: &str) -> Self {
    Self {
      collection: collection.to_string(),
      key: None,
      data: None,
      method,
      endpoint: endpoint.to_string(),
      payload: None,
      id_field: None,
      pending_identity: false,
      depends_on: None,
      state: if method == Method::Get {
        TransactionState::Audit
      } else {
        TransactionState::Pending
      },
      error_class: None,
      last_error: None,
    }
  }

  pub fn key(mut self, key: impl Into<String>) -> Self {
    self.key = Some(key.into());
    self
  }

  pub fn data(mut self, data: Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn payload(mut self, payload: Value) -> Self {
    self.payload = Some(payload);
    self
  }

  pub fn id_field(mut self, field: impl Into<String>) -> Self {
    self.id_field = Some(field.into());
    self
  }

  pub fn pending_identity(mut self) -> Self {
    self.pending_identity = true;
    self
  }

  pub fn depends_on(mut self, parent: Option<i64>) -> Self {
    self.depends_on = parent;
    self
  }

  /// Tag the entry with the failure that caused it to be queued. A permanent
  /// failure quarantines it immediately when `quarantine` is set.
  pub fn failed_with(mut self, class: ErrorClass, message: String, quarantine: bool) -> Self {
    if quarantine && class == ErrorClass::Permanent {
      self.state = TransactionState::Failed;
    }
    self.error_class = Some(class);
    self.last_error = Some(message);
    self
  }
}
