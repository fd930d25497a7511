//! Scripted network used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::http::{Network, Request, ResponseSnapshot};

#[derive(Clone)]
enum Reply {
  Response(ResponseSnapshot),
  Unreachable,
}

#[derive(Default)]
struct State {
  /// Per-URL replies; the last one keeps being served once the rest are used
  routes: HashMap<String, VecDeque<Reply>>,
  offline: bool,
  delay: Option<Duration>,
  requests: Vec<Request>,
}

/// In-memory [`Network`] that serves scripted replies and records requests.
#[derive(Default)]
pub struct ScriptedNetwork {
  state: Mutex<State>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Always answer `url` with this response.
  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.script(url, vec![Reply::Response(ResponseSnapshot::new(status, body))]);
  }

  /// Answer `url` with each status in turn, repeating the last one.
  pub fn respond_sequence(&self, url: &str, statuses: &[u16]) {
    let replies = statuses
      .iter()
      .map(|s| Reply::Response(ResponseSnapshot::new(*s, format!("status {}", s))))
      .collect();
    self.script(url, replies);
  }

  /// Make `url` fail as if the host were unreachable.
  pub fn unreachable(&self, url: &str) {
    self.script(url, vec![Reply::Unreachable]);
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  pub fn set_delay(&self, delay: Duration) {
    self.state.lock().unwrap().delay = Some(delay);
  }

  /// Every request seen so far, in arrival order.
  pub fn requests(&self) -> Vec<Request> {
    self.state.lock().unwrap().requests.clone()
  }

  pub fn request_count(&self, url: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  fn script(&self, url: &str, replies: Vec<Reply>) {
    self
      .state
      .lock()
      .unwrap()
      .routes
      .insert(url.to_string(), replies.into());
  }

  fn next_reply(&self, request: &Request) -> Reply {
    let mut state = self.state.lock().unwrap();
    state.requests.push(request.clone());
    if state.offline {
      return Reply::Unreachable;
    }
    match state.routes.get_mut(request.url.as_str()) {
      Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Unreachable),
      Some(queue) => queue.front().cloned().unwrap_or(Reply::Unreachable),
      None => Reply::Unreachable,
    }
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> EngineResult<ResponseSnapshot> {
    let delay = self.state.lock().unwrap().delay;
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    match self.next_reply(request) {
      Reply::Response(mut snapshot) => {
        snapshot.captured_at = chrono::Utc::now();
        Ok(snapshot)
      }
      Reply::Unreachable => Err(EngineError::Connectivity(format!(
        "{} unreachable",
        request.url
      ))),
    }
  }
}
