//! Request classification: which strategy serves an intercepted request.

use regex::Regex;
use url::Url;

use crate::http::Request;

/// Strategy class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyClass {
  /// HTML document: network first, cached copy or offline page on failure
  Navigation,
  /// API call: network first, cached copy on failure
  Api,
  /// Static asset: cache first, refreshed in the background
  Static,
  /// Anything else, served like `Api`
  Default,
}

/// Pure, deterministic request classifier.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
  origin: Url,
  api_patterns: Vec<Regex>,
  static_prefix: String,
}

impl RequestClassifier {
  pub fn new(origin: Url, api_patterns: Vec<Regex>, static_prefix: impl Into<String>) -> Self {
    Self {
      origin,
      api_patterns,
      static_prefix: static_prefix.into(),
    }
  }

  /// First match wins: HTML accept, API path, static asset, default.
  pub fn classify(&self, request: &Request) -> StrategyClass {
    let accepts_html = request
      .accept
      .as_deref()
      .is_some_and(|accept| accept.contains("text/html"));
    if accepts_html {
      return StrategyClass::Navigation;
    }

    let path = request.url.path();
    if self.api_patterns.iter().any(|p| p.is_match(path)) {
      return StrategyClass::Api;
    }

    if path.contains(&self.static_prefix)
      || !self.is_same_origin(&request.url)
      || request.destination.is_static_asset()
    {
      return StrategyClass::Static;
    }

    StrategyClass::Default
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }
}
