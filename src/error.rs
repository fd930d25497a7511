use thiserror::Error;

/// Maximum length for server response bodies kept in errors
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors raised by the caching and sync engine.
#[derive(Error, Debug)]
pub enum EngineError {
  /// The network fetch was rejected or never produced a response.
  #[error("Connectivity error: {0}")]
  Connectivity(String),

  /// A database or cache namespace transaction failed.
  #[error("Storage error: {0}")]
  Storage(String),

  /// A flush POST completed with a non-success status.
  #[error("Server error {status}: {body}")]
  Server { status: u16, body: String },

  /// Install-time manifest population failed.
  #[error("Population of {namespace} failed at {url}: {reason}")]
  Population {
    namespace: String,
    url: String,
    reason: String,
  },

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
  /// Build a server error, truncating the body to keep logs readable.
  pub fn server(status: u16, body: &[u8]) -> Self {
    let text = String::from_utf8_lossy(body);
    let body = if text.len() <= MAX_ERROR_BODY_LENGTH {
      text.into_owned()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !text.is_char_boundary(end) {
        end -= 1;
      }
      format!(
        "{}... (truncated, {} total bytes)",
        &text[..end],
        text.len()
      )
    };
    EngineError::Server { status, body }
  }

  pub fn is_connectivity(&self) -> bool {
    matches!(self, EngineError::Connectivity(_))
  }
}

impl From<rusqlite::Error> for EngineError {
  fn from(e: rusqlite::Error) -> Self {
    EngineError::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for EngineError {
  fn from(e: serde_json::Error) -> Self {
    EngineError::Storage(format!("serialization failed: {}", e))
  }
}

impl From<reqwest::Error> for EngineError {
  fn from(e: reqwest::Error) -> Self {
    EngineError::Connectivity(e.to_string())
  }
}
