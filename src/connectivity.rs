//! Online/offline signal shared by the façade and the sync coordinator.

use tokio::sync::watch;
use tracing::info;

/// Binary connectivity state. The platform layer calls [`Connectivity::set_online`]
/// whenever the device's network state changes; nothing here polls.
#[derive(Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the state. Subscribers only wake on an actual change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}
