//! Wiring: one store, one transport, one connectivity signal, shared by every
//! feature service.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::install::{Installation, InstallationGuard};
use crate::remote::{HttpRemote, Remote};
use crate::resource::{ClientState, Resource};
use crate::store::{OfflineStore, RecordCipher, SqliteStore};
use crate::sync::SyncCoordinator;

/// Behaviour switches shared by the façade and the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
  /// Stop replaying entries whose failure is permanent (4xx).
  pub quarantine_permanent: bool,
  /// Record successful reads as GET audit entries.
  pub audit_reads: bool,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      quarantine_permanent: true,
      audit_reads: false,
    }
  }
}

/// Shared handle to the offline engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
  store: Arc<dyn OfflineStore>,
  remote: Arc<dyn Remote>,
  connectivity: Connectivity,
  client: Arc<ClientState>,
  options: EngineOptions,
}

impl Engine {
  pub fn new(
    store: Arc<dyn OfflineStore>,
    remote: Arc<dyn Remote>,
    connectivity: Connectivity,
    client: Arc<ClientState>,
  ) -> Self {
    Self {
      store,
      remote,
      connectivity,
      client,
      options: EngineOptions::default(),
    }
  }

  pub fn with_options(mut self, options: EngineOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_audit_reads(mut self, audit_reads: bool) -> Self {
    self.options.audit_reads = audit_reads;
    self
  }

  /// Open the configured database, run the installation guard and build the
  /// HTTP transport.
  pub fn from_config(config: &Config, connectivity: Connectivity) -> Result<(Self, Installation)> {
    let path = config.database_path()?;
    let cipher = RecordCipher::from_secret(&config.secret());
    let store = SqliteStore::open(&path, cipher)
      .map_err(|e| eyre!("Failed to open local store at {}: {}", path.display(), e))?;

    let installation = InstallationGuard::new()
      .wipe_transactions(config.install.wipe_transactions)
      .boot(&store)
      .map_err(|e| eyre!("Installation check failed: {}", e))?;

    let token = Config::get_api_token();
    let remote = HttpRemote::new(
      Duration::from_secs(config.api.timeout_secs),
      token.as_deref(),
    )
    .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let client = ClientState::new(&config.api.url, config.company_id.clone());
    let engine = Self::new(
      Arc::new(store),
      Arc::new(remote),
      connectivity,
      Arc::new(client),
    )
    .with_options(EngineOptions {
      quarantine_permanent: config.replay.quarantine_permanent,
      audit_reads: config.audit_reads,
    });

    Ok((engine, installation))
  }

  /// Façade for one REST resource.
  pub fn resource<T>(&self, path: &str, id_field: &str) -> crate::Result<Resource<T>>
  where
    T: Serialize + DeserializeOwned,
  {
    Resource::new(self.clone(), path, id_field)
  }

  /// Coordinator that replays this engine's queue.
  pub fn coordinator(&self) -> SyncCoordinator {
    SyncCoordinator::new(Arc::clone(&self.store), Arc::clone(&self.remote))
      .quarantine_permanent(self.options.quarantine_permanent)
  }

  pub fn store(&self) -> &Arc<dyn OfflineStore> {
    &self.store
  }

  pub fn remote(&self) -> &Arc<dyn Remote> {
    &self.remote
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn client(&self) -> &ClientState {
    &self.client
  }

  pub fn options(&self) -> EngineOptions {
    self.options
  }
}
