//! Command-line notification host.

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::notify::{Notification, NotificationHost};

/// Prints notifications and navigation targets to stdout.
pub struct StdoutHost;

impl NotificationHost for StdoutHost {
  fn show(&self, notification: &Notification) -> EngineResult<()> {
    let rendered = serde_json::to_string_pretty(notification)
      .map_err(|e| EngineError::InvalidRequest(format!("cannot render notification: {}", e)))?;
    println!("{}", rendered);
    Ok(())
  }

  fn close(&self, tag: &str) {
    debug!(tag, "Notification closed");
  }

  fn open_window(&self, route: &str) -> EngineResult<()> {
    println!("navigate {}", route);
    Ok(())
  }
}
