//! Trigger dispatcher: one method per host lifecycle event.
//!
//! The engine owns the five components and routes every trigger to them.
//! Each handler reports its own failure and leaves unrelated triggers alone.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStore, CacheStrategyExecutor, NamespaceStorage};
use crate::classify::{RequestClassifier, StrategyClass};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::http::{Network, Request, ResponseSnapshot};
use crate::notify::{Interaction, Notification, NotificationDispatcher, NotificationHost, PushPayload};
use crate::queue::PendingWriteQueue;
use crate::sync::{FlushOutcome, SyncCoordinator, SyncTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Nothing cached yet
  Fresh,
  /// Manifest cached, waiting for activation
  Installed,
  /// Stale generations collected, serving requests
  Activated,
}

/// Opaque commands a client page can post to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMessage {
  SkipWait,
  GetVersion,
}

impl FromStr for HostMessage {
  type Err = EngineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().replace('_', "-").as_str() {
      "skip-wait" | "skip-waiting" => Ok(HostMessage::SkipWait),
      "get-version" => Ok(HostMessage::GetVersion),
      other => Err(EngineError::InvalidRequest(format!("unknown message '{}'", other))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageReply {
  Ack,
  Version(String),
}

/// Result of a write submitted through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  Delivered,
  /// Backend unreachable or refused; kept for a later flush
  Queued(i64),
}

pub struct Engine<S: NamespaceStorage, N: Network, H: NotificationHost> {
  classifier: RequestClassifier,
  store: CacheStore<S>,
  executor: CacheStrategyExecutor<S, N>,
  queue: PendingWriteQueue,
  sync: SyncCoordinator<N>,
  notifications: NotificationDispatcher<H>,
  network: Arc<N>,
  static_namespace: String,
  api_namespace: String,
  namespaces: Vec<String>,
  manifest: Vec<Url>,
  precache: Vec<(String, Vec<Url>)>,
  state: Mutex<LifecycleState>,
}

impl<S: NamespaceStorage, N: Network, H: NotificationHost> Engine<S, N, H> {
  pub fn new(
    config: &Config,
    storage: S,
    queue: PendingWriteQueue,
    network: Arc<N>,
    host: Arc<H>,
  ) -> Result<Self> {
    config.validate()?;

    let classifier = RequestClassifier::new(
      config.origin_url()?,
      config.api_regexes()?,
      config.static_prefix.clone(),
    );

    let resolve_all = |urls: &[String]| -> Result<Vec<Url>> {
      urls.iter().map(|u| config.resolve(u)).collect()
    };
    let manifest = resolve_all(&config.manifest)?;
    let precache = config
      .precache
      .iter()
      .map(|(group, urls)| -> Result<(String, Vec<Url>)> {
        Ok((config.precache_namespace(group), resolve_all(urls)?))
      })
      .collect::<Result<Vec<_>>>()?;

    let triggers = config
      .sync_triggers
      .iter()
      .map(|(tag, t)| -> Result<SyncTrigger> {
        Ok(SyncTrigger {
          tag: tag.clone(),
          queue_type: t.queue.clone(),
          endpoint: config.resolve(&t.endpoint)?,
          shape: t.shape,
          batch_field: t.batch_field.clone(),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    let namespaces = config.namespaces();
    let offline_page = Request::get(config.resolve(&config.offline_page)?).identity();
    let store = CacheStore::new(storage);
    let executor = CacheStrategyExecutor::new(
      store.clone(),
      Arc::clone(&network),
      namespaces.clone(),
      offline_page,
    );

    Ok(Self {
      classifier,
      store,
      executor,
      sync: SyncCoordinator::new(queue.clone(), Arc::clone(&network), triggers),
      queue,
      notifications: NotificationDispatcher::new(host, config.notifications.clone()),
      network,
      static_namespace: config.static_namespace(),
      api_namespace: config.api_namespace(),
      namespaces,
      manifest,
      precache,
      state: Mutex::new(LifecycleState::Fresh),
    })
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Fresh)
  }

  fn set_state(&self, next: LifecycleState) {
    if let Ok(mut state) = self.state.lock() {
      *state = next;
    }
  }

  /// Recover the lifecycle state left by a previous process from the
  /// namespaces on disk.
  pub fn restore_state(&self) -> EngineResult<LifecycleState> {
    let existing = self.store.namespaces()?;
    let installed = std::iter::once(&self.static_namespace)
      .chain(self.precache.iter().map(|(namespace, _)| namespace))
      .all(|namespace| existing.contains(namespace));
    let state = if !installed {
      LifecycleState::Fresh
    } else if existing.iter().any(|n| !self.namespaces.contains(n)) {
      LifecycleState::Installed
    } else {
      LifecycleState::Activated
    };
    self.set_state(state);
    Ok(state)
  }

  pub fn queue(&self) -> &PendingWriteQueue {
    &self.queue
  }

  pub fn namespaces(&self) -> &[String] {
    &self.namespaces
  }

  /// `install`: eagerly cache the manifest and every precache group, all of
  /// them or none.
  pub async fn install(&self) -> EngineResult<usize> {
    info!(namespace = %self.static_namespace, "Installing");

    let groups: Vec<(&str, &[Url])> = std::iter::once((
      self.static_namespace.as_str(),
      self.manifest.as_slice(),
    ))
    .chain(
      self
        .precache
        .iter()
        .map(|(namespace, urls)| (namespace.as_str(), urls.as_slice())),
    )
    .collect();

    let total = self
      .store
      .populate_all(self.network.as_ref(), &groups)
      .await
      .inspect_err(|e| warn!(error = %e, "Installation failed"))?;

    if self.state() == LifecycleState::Fresh {
      self.set_state(LifecycleState::Installed);
    }
    info!(entries = total, "Installation completed");
    Ok(total)
  }

  /// `activate`: drop superseded generations, open the current ones, then
  /// start serving.
  pub fn activate(&self) -> EngineResult<Vec<String>> {
    info!("Activating");
    let deleted = self
      .store
      .collect_garbage(&self.namespaces)
      .and_then(|deleted| self.store.open_all(&self.namespaces).map(|()| deleted))
      .inspect_err(|e| warn!(error = %e, "Activation failed"))?;
    self.set_state(LifecycleState::Activated);
    info!(deleted = deleted.len(), "Activation completed");
    Ok(deleted)
  }

  /// `intercept-request`: answer a request in place of the network.
  pub async fn intercept(&self, request: &Request) -> EngineResult<ResponseSnapshot> {
    if !request.is_http() || self.state() != LifecycleState::Activated {
      return self.network.fetch(request).await;
    }

    let class = self.classifier.classify(request);
    let namespace = self.namespace_for(class);
    self
      .executor
      .execute(class, request, namespace)
      .await
      .inspect_err(|e| warn!(url = %request.url, error = %e, "Request failed"))
  }

  /// Wait for background cache refreshes started by earlier intercepts.
  pub async fn settle_background(&self) {
    self.executor.settle().await;
  }

  fn namespace_for(&self, class: StrategyClass) -> &str {
    match class {
      StrategyClass::Navigation | StrategyClass::Static => &self.static_namespace,
      StrategyClass::Api | StrategyClass::Default => &self.api_namespace,
    }
  }

  /// `message`: skip-wait activates a waiting install; get-version replies
  /// with the current generation.
  pub fn message(&self, message: HostMessage) -> EngineResult<MessageReply> {
    match message {
      HostMessage::SkipWait => {
        if self.state() == LifecycleState::Installed {
          self.activate()?;
        }
        Ok(MessageReply::Ack)
      }
      HostMessage::GetVersion => Ok(MessageReply::Version(self.static_namespace.clone())),
    }
  }

  /// Send a write to the endpoint bound to `write_type`, queueing it when the
  /// backend cannot take it now.
  pub async fn submit_write(&self, write_type: &str, payload: Value) -> EngineResult<WriteOutcome> {
    let trigger = self
      .sync
      .triggers()
      .iter()
      .find(|t| t.queue_type == write_type)
      .ok_or_else(|| EngineError::InvalidRequest(format!("no endpoint for '{}'", write_type)))?;

    let body = trigger.live_body(payload.clone());
    let request = Request::post_json(trigger.endpoint.clone(), body);
    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => Ok(WriteOutcome::Delivered),
      Ok(response) => {
        warn!(write_type, status = response.status, "Write refused, queueing");
        Ok(WriteOutcome::Queued(self.queue.enqueue(write_type, &payload)?))
      }
      Err(e) => {
        warn!(write_type, offline = e.is_connectivity(), error = %e, "Write failed, queueing");
        Ok(WriteOutcome::Queued(self.queue.enqueue(write_type, &payload)?))
      }
    }
  }

  /// `background-trigger(tag)`: one result per flushed queue type.
  pub async fn background_trigger(&self, tag: &str) -> Vec<EngineResult<FlushOutcome>> {
    self.sync.on_background_trigger(tag).await
  }

  /// Host regained connectivity.
  pub async fn connectivity_restored(&self) -> Vec<EngineResult<FlushOutcome>> {
    self.sync.on_connectivity_restored().await
  }

  /// `push(payload)`: pushes without data show nothing.
  pub fn push(&self, data: Option<&[u8]>) -> EngineResult<Option<Notification>> {
    let Some(data) = data else {
      return Ok(None);
    };
    let payload = PushPayload::from_json(data)?;
    self
      .notifications
      .present(&payload)
      .map(Some)
      .inspect_err(|e| warn!(error = %e, "Push display failed"))
  }

  /// `notification-interaction(actionId, contextData)`
  pub fn notification_interaction(
    &self,
    action_id: &str,
    tag: Option<&str>,
    context: &Value,
  ) -> EngineResult<Interaction> {
    self.notifications.resolve_interaction(action_id, tag, context)
  }
}

/// Check that a configuration can drive a full install.
pub fn ensure_configured(config: &Config) -> Result<()> {
  if config.manifest.is_empty() {
    return Err(eyre!("Install manifest must list at least one URL"));
  }
  config.validate()
}
