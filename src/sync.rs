//! Sync coordinator: replays the transaction log when connectivity returns.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::remote::{Remote, RemoteRequest};
use crate::resource::{entity_identity, identity_key, substitute_identity};
use crate::store::OfflineStore;
use crate::transaction::{ErrorClass, Method, Transaction, TransactionState};

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Confirmed by the server and removed from the log.
  pub replayed: usize,
  /// Failed transiently; still pending.
  pub failed: usize,
  /// Failed permanently; moved out of the pending queue.
  pub quarantined: usize,
  /// Waiting on an earlier entry that is still queued.
  pub skipped: usize,
  /// Waiting on an earlier entry the server rejected; held until that entry
  /// is retried or discarded.
  pub blocked: usize,
}

/// A queue entry resolved into the exact call to make.
struct Replay {
  request: RemoteRequest,
  key: Option<String>,
}

/// Drains the transaction log against the network.
///
/// Passes are serialised: a pass started while another runs waits for it, then
/// takes a fresh snapshot.
#[derive(Clone)]
pub struct SyncCoordinator {
  store: Arc<dyn OfflineStore>,
  remote: Arc<dyn Remote>,
  quarantine: bool,
  pass: Arc<Mutex<()>>,
}

impl SyncCoordinator {
  pub fn new(store: Arc<dyn OfflineStore>, remote: Arc<dyn Remote>) -> Self {
    Self {
      store,
      remote,
      quarantine: true,
      pass: Arc::new(Mutex::new(())),
    }
  }

  /// With `false`, permanently failing entries are retried forever.
  pub fn quarantine_permanent(mut self, quarantine: bool) -> Self {
    self.quarantine = quarantine;
    self
  }

  /// Replay every pending entry once, oldest first. Failures leave the entry
  /// in place and move on to the next one.
  pub async fn replay(&self) -> Result<SyncReport> {
    let _pass = self.pass.lock().await;
    let pending = self.store.drain()?;
    let mut report = SyncReport::default();

    if pending.is_empty() {
      return Ok(report);
    }
    info!(count = pending.len(), "replaying queued transactions");

    for tx in pending {
      if let Some(parent) = tx.depends_on {
        match self.store.transaction(parent)?.map(|p| p.state) {
          Some(TransactionState::Failed) => {
            warn!(id = tx.id, parent, "parent was rejected by server, holding");
            report.blocked += 1;
            continue;
          }
          Some(_) => {
            debug!(id = tx.id, parent, "parent still queued, skipping");
            report.skipped += 1;
            continue;
          }
          None => {}
        }
      }

      let replay = self.resolve(&tx)?;
      match self.remote.send(replay.request).await {
        Ok(response) => {
          // Confirmed by the server: never send it again, even if the local
          // mirror below fails.
          self.store.remove(tx.id)?;
          if let Err(e) = self.apply(&tx, replay.key.as_deref(), response) {
            warn!(id = tx.id, error = %e, "replayed transaction could not be mirrored locally");
          }
          debug!(id = tx.id, method = %tx.method, "replayed transaction");
          report.replayed += 1;
        }
        Err(e) => {
          let class = e.class();
          self
            .store
            .record_failure(tx.id, class, &e.to_string(), self.quarantine)?;
          if self.quarantine && class == ErrorClass::Permanent {
            warn!(id = tx.id, error = %e, "transaction rejected by server, quarantined");
            report.quarantined += 1;
          } else {
            warn!(id = tx.id, error = %e, "replay failed, will retry");
            report.failed += 1;
          }
        }
      }
    }

    info!(
      replayed = report.replayed,
      failed = report.failed,
      quarantined = report.quarantined,
      skipped = report.skipped,
      blocked = report.blocked,
      "replay pass finished"
    );
    Ok(report)
  }

  /// Build the call for `tx`, substituting a server identity learned from
  /// an earlier create when this entry depended on it.
  fn resolve(&self, tx: &Transaction) -> Result<Replay> {
    let mut endpoint = tx.endpoint.clone();
    let mut body = tx.body().cloned();
    let mut key = tx.key.clone();

    if tx.depends_on.is_some() {
      if let Some(client_key) = &tx.key {
        if let Some(server_id) = self.store.resolved_identity(&tx.collection, client_key)? {
          let server_key = identity_key(&server_id);
          endpoint = rewrite_last_segment(&endpoint, client_key, &server_key);
          body = body.map(|b| substitute_identity(b, client_key, &server_id));
          key = Some(server_key);
        }
      }
    }

    Ok(Replay {
      request: RemoteRequest::new(tx.method, endpoint).with_body(body),
      key,
    })
  }

  /// Mirror the confirmed result into the local store.
  fn apply(&self, tx: &Transaction, key: Option<&str>, response: Option<Value>) -> Result<()> {
    match tx.method {
      Method::Post | Method::Put => {
        let Some(value) = response.or_else(|| tx.body().cloned()) else {
          return Ok(());
        };
        let identity = tx
          .id_field
          .as_deref()
          .and_then(|field| entity_identity(&value, field));

        if tx.pending_identity {
          if let (Some(client_key), Some((_, server_id))) = (&tx.key, &identity) {
            self
              .store
              .resolve_identity(&tx.collection, client_key, server_id)?;
          }
        }

        let mirror_key = identity.map(|(k, _)| k).or_else(|| key.map(String::from));
        if let Some(mirror_key) = mirror_key {
          self.store.put_value(&tx.collection, &mirror_key, &value)?;
        }
      }
      Method::Delete => {
        if let Some(key) = key {
          self.store.delete(&tx.collection, key)?;
        }
      }
      Method::Get => {}
    }
    Ok(())
  }

  /// Replay whenever the device goes from offline to online, and once right
  /// away when it is already online.
  pub fn spawn(self, connectivity: &Connectivity) -> JoinHandle<()> {
    let mut rx = connectivity.subscribe();
    // Read before spawning so a transition racing the first poll is still
    // seen as a change.
    let mut online = *rx.borrow_and_update();
    tokio::spawn(async move {
      if online {
        if let Err(e) = self.replay().await {
          error!(error = %e, "replay pass aborted");
        }
      }
      while rx.changed().await.is_ok() {
        let now = *rx.borrow_and_update();
        if now && !online {
          if let Err(e) = self.replay().await {
            error!(error = %e, "replay pass aborted");
          }
        }
        online = now;
      }
    })
  }
}

/// Replace the final path segment of `endpoint` when it equals `from`.
fn rewrite_last_segment(endpoint: &str, from: &str, to: &str) -> String {
  let Ok(mut url) = Url::parse(endpoint) else {
    return endpoint.to_string();
  };
  let last = url
    .path_segments()
    .and_then(|mut segments| segments.next_back())
    .map(String::from);
  if last.as_deref() != Some(from) {
    return endpoint.to_string();
  }
  if let Ok(mut segments) = url.path_segments_mut() {
    segments.pop().push(to);
  }
  url.to_string()
}
