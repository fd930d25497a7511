//! Request and response descriptors plus the network seam.
//!
//! The engine never talks to `reqwest` directly: every fetch goes through the
//! [`Network`] trait so the strategies and the sync coordinator can be driven
//! by a scripted network in tests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{EngineError, EngineResult};

/// Declared destination of a request (what the resource will be used for).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Font,
  Style,
  Script,
  #[default]
  Empty,
}

impl Destination {
  /// Destinations that always count as static assets.
  pub fn is_static_asset(self) -> bool {
    matches!(
      self,
      Destination::Image | Destination::Font | Destination::Style | Destination::Script
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RequestMode {
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub accept: Option<String>,
  pub destination: Destination,
  pub mode: RequestMode,
  pub body: Option<Value>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      accept: None,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
      body: None,
    }
  }

  /// A top-level document navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      accept: Some("text/html,application/xhtml+xml".to_string()),
      destination: Destination::Document,
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn post_json(url: Url, body: Value) -> Self {
    Self {
      method: Method::POST,
      accept: Some("application/json".to_string()),
      body: Some(body),
      ..Self::get(url)
    }
  }

  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(&self.method, &self.url)
  }
}

/// Normalized key used to match a request against cached snapshots.
///
/// Headers never take part in matching; the fragment is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  method: String,
  url: String,
}

impl RequestIdentity {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA-256 digest of the identity, used as the storage key.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A captured response. Snapshots are replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub captured_at: DateTime<Utc>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      captured_at: Utc::now(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json(&self) -> EngineResult<Value> {
    serde_json::from_slice(&self.body)
      .map_err(|e| EngineError::InvalidRequest(format!("response is not JSON: {}", e)))
  }
}

/// Anything that can carry a request to the backend.
///
/// Completed exchanges return `Ok` whatever their status; only a failure to
/// obtain a response at all is an error.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> EngineResult<ResponseSnapshot>;
}

/// [`Network`] implementation backed by `reqwest`.
///
/// Clone is cheap, the inner client shares its connection pool.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new() -> EngineResult<Self> {
    let client = Client::builder()
      .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> EngineResult<ResponseSnapshot> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    if let Some(accept) = &request.accept {
      builder = builder.header(header::ACCEPT, accept);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
      captured_at: Utc::now(),
    })
  }
}
