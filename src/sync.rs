//! Flushes the pending write queue when connectivity or a background trigger
//! says the backend may be reachable again.

use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::config::PayloadShape;
use crate::error::{EngineError, EngineResult};
use crate::http::{Network, Request};
use crate::queue::{PendingWriteEntry, PendingWriteQueue};

/// Tag that flushes every configured queue type.
pub const GENERIC_SYNC_TAG: &str = "background-sync";

/// Static mapping from a trigger tag to the queue it drains.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
  pub tag: String,
  pub queue_type: String,
  pub endpoint: Url,
  pub shape: PayloadShape,
  pub batch_field: String,
}

impl SyncTrigger {
  /// Body for a single write sent as soon as it is made.
  pub fn live_body(&self, payload: Value) -> Value {
    match self.shape {
      PayloadShape::PerEntry => payload,
      PayloadShape::Batch => self.batch_body(vec![payload]),
    }
  }

  /// Body carrying several queued writes under the batch field.
  pub fn batch_body(&self, payloads: Vec<Value>) -> Value {
    let mut body = Map::new();
    body.insert(self.batch_field.clone(), Value::Array(payloads));
    Value::Object(body)
  }
}

/// Result of one flush cycle for a single queue type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
  pub queue_type: String,
  pub flushed: usize,
  pub remaining: usize,
  /// Entry the cycle stopped at, with the reason
  pub failure: Option<(i64, String)>,
}

impl FlushOutcome {
  pub fn is_complete(&self) -> bool {
    self.failure.is_none()
  }
}

pub struct SyncCoordinator<N: Network> {
  queue: PendingWriteQueue,
  network: Arc<N>,
  triggers: Vec<SyncTrigger>,
  /// One lock per queue type; a type is never flushed twice at once here
  type_locks: HashMap<String, Arc<Mutex<()>>>,
}

impl<N: Network> SyncCoordinator<N> {
  pub fn new(queue: PendingWriteQueue, network: Arc<N>, triggers: Vec<SyncTrigger>) -> Self {
    let type_locks = triggers
      .iter()
      .map(|t| (t.queue_type.clone(), Arc::new(Mutex::new(()))))
      .collect();
    Self {
      queue,
      network,
      triggers,
      type_locks,
    }
  }

  pub fn triggers(&self) -> &[SyncTrigger] {
    &self.triggers
  }

  /// Flush every configured queue type. One result per type, in trigger
  /// order.
  pub async fn on_connectivity_restored(&self) -> Vec<EngineResult<FlushOutcome>> {
    info!("Connectivity restored, flushing pending writes");
    self.flush_all().await
  }

  /// Flush the queue type bound to `tag`. Unknown tags flush nothing.
  pub async fn on_background_trigger(&self, tag: &str) -> Vec<EngineResult<FlushOutcome>> {
    if tag == GENERIC_SYNC_TAG {
      return self.flush_all().await;
    }

    match self.triggers.iter().find(|t| t.tag == tag) {
      Some(trigger) => vec![self.flush(trigger).await],
      None => {
        warn!(tag, "Ignoring unknown background trigger");
        Vec::new()
      }
    }
  }

  /// Queue types run concurrently; entries within a type never do. A storage
  /// failure in one type leaves the other results intact.
  async fn flush_all(&self) -> Vec<EngineResult<FlushOutcome>> {
    join_all(self.triggers.iter().map(|t| self.flush(t))).await
  }

  /// One flush cycle: oldest entry first, stop at the first failure.
  pub async fn flush(&self, trigger: &SyncTrigger) -> EngineResult<FlushOutcome> {
    self.flush_locked(trigger).await.inspect_err(|e| {
      warn!(queue = %trigger.queue_type, error = %e, "Flush aborted by storage failure");
    })
  }

  async fn flush_locked(&self, trigger: &SyncTrigger) -> EngineResult<FlushOutcome> {
    let lock = self
      .type_locks
      .get(&trigger.queue_type)
      .cloned()
      .unwrap_or_default();
    let _guard = lock.lock().await;

    let entries = self.queue.list_by_type(&trigger.queue_type)?;
    let total = entries.len();

    let (flushed, failure) = match trigger.shape {
      PayloadShape::PerEntry => self.flush_each(trigger, &entries).await?,
      PayloadShape::Batch => self.flush_batch(trigger, &entries).await?,
    };

    let outcome = FlushOutcome {
      queue_type: trigger.queue_type.clone(),
      flushed,
      remaining: total - flushed,
      failure,
    };

    match &outcome.failure {
      None if total > 0 => info!(
        queue = %outcome.queue_type,
        flushed = outcome.flushed,
        "Pending writes flushed"
      ),
      None => {}
      Some((id, reason)) => warn!(
        queue = %outcome.queue_type,
        flushed = outcome.flushed,
        remaining = outcome.remaining,
        entry = id,
        reason = %reason,
        "Flush stopped, remaining writes stay queued"
      ),
    }

    Ok(outcome)
  }

  async fn flush_each(
    &self,
    trigger: &SyncTrigger,
    entries: &[PendingWriteEntry],
  ) -> EngineResult<(usize, Option<(i64, String)>)> {
    let mut flushed = 0;
    for entry in entries {
      if let Err(e) = self.post(&trigger.endpoint, entry.payload.clone()).await {
        return Ok((flushed, Some((entry.id, e.to_string()))));
      }
      self.queue.remove_by_type(&trigger.queue_type, &[entry.id])?;
      flushed += 1;
    }
    Ok((flushed, None))
  }

  async fn flush_batch(
    &self,
    trigger: &SyncTrigger,
    entries: &[PendingWriteEntry],
  ) -> EngineResult<(usize, Option<(i64, String)>)> {
    let Some(first) = entries.first() else {
      return Ok((0, None));
    };

    let body = trigger.batch_body(entries.iter().map(|e| e.payload.clone()).collect());

    if let Err(e) = self.post(&trigger.endpoint, body).await {
      return Ok((0, Some((first.id, e.to_string()))));
    }

    let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
    self.queue.remove_by_type(&trigger.queue_type, &ids)?;
    Ok((entries.len(), None))
  }

  /// POST a JSON body; anything but a 2xx acknowledgement is a failure.
  async fn post(&self, endpoint: &Url, body: Value) -> EngineResult<()> {
    let request = Request::post_json(endpoint.clone(), body);
    let response = self.network.fetch(&request).await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(EngineError::server(response.status, &response.body))
    }
  }
}
