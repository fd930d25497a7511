use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the engine is serving (e.g. "https://app.example.com")
  pub origin: String,
  /// Generation token embedded in every namespace name
  pub version: String,
  /// Prefix shared by every namespace name
  pub cache_prefix: String,
  /// Path patterns (regexes) routed to the API strategy
  pub api_patterns: Vec<String>,
  /// Path prefix of the static-asset namespace
  pub static_prefix: String,
  /// Page served to navigations when both network and cache miss
  pub offline_page: String,
  /// Fixed install manifest, eagerly cached into the static namespace
  pub manifest: Vec<String>,
  /// Extra precache groups, each in its own namespace
  pub precache: BTreeMap<String, Vec<String>>,
  /// Background trigger tag -> queue flush configuration
  pub sync_triggers: BTreeMap<String, SyncTriggerConfig>,
  pub notifications: NotificationConfig,
  /// Database location (default: $XDG_DATA_HOME/offsync/offsync.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadShape {
  /// One POST per queued entry, body is the entry payload
  #[default]
  PerEntry,
  /// One POST carrying every queued entry under `field`
  Batch,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SyncTriggerConfig {
  pub queue: String,
  pub endpoint: String,
  #[serde(default)]
  pub shape: PayloadShape,
  /// Wrapper field for batch payloads
  #[serde(default = "default_batch_field")]
  pub batch_field: String,
}

fn default_batch_field() -> String {
  "logs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub app_title: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub action_icon: String,
  /// Route opened for unrecognized actions
  pub default_route: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      app_title: "Ttrust".to_string(),
      default_body: "Nouvelle notification Ttrust".to_string(),
      icon: "/static/icons/icon-192x192.png".to_string(),
      badge: "/static/icons/icon-72x72.png".to_string(),
      action_icon: "/static/icons/icon-32x32.png".to_string(),
      default_route: "/dashboard".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    let manifest = [
      "/",
      "/static/manifest.json",
      "/dashboard",
      "/staking-plans",
      "/projects",
      "/profile",
      "/support",
      "https://cdn.jsdelivr.net/npm/tailwindcss@2.2.19/dist/tailwind.min.css",
      "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.5.0/css/all.min.css",
      "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700;800&display=swap",
      "/static/offline.html",
    ];

    let offline_pages = [
      "/dashboard",
      "/profile",
      "/investment-history",
      "/support",
      "/security",
    ];

    let mut sync_triggers = BTreeMap::new();
    sync_triggers.insert(
      "sync-investments".to_string(),
      SyncTriggerConfig {
        queue: "investments".to_string(),
        endpoint: "/api/sync-investment".to_string(),
        shape: PayloadShape::PerEntry,
        batch_field: default_batch_field(),
      },
    );
    sync_triggers.insert(
      "sync-security-logs".to_string(),
      SyncTriggerConfig {
        queue: "security".to_string(),
        endpoint: "/api/sync-security".to_string(),
        shape: PayloadShape::Batch,
        batch_field: default_batch_field(),
      },
    );

    Self {
      origin: "http://localhost:5000".to_string(),
      version: "v1.0.0".to_string(),
      cache_prefix: "investcrypto".to_string(),
      api_patterns: [
        r"/api/",
        r"/dashboard",
        r"/staking-plans",
        r"/projects",
        r"/profile",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      static_prefix: "/static/".to_string(),
      offline_page: "/static/offline.html".to_string(),
      manifest: manifest.iter().map(|s| s.to_string()).collect(),
      precache: BTreeMap::from([(
        "offline".to_string(),
        offline_pages.iter().map(|s| s.to_string()).collect(),
      )]),
      sync_triggers,
      notifications: NotificationConfig::default(),
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Built-in defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Self::default()
      }
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Reject configurations the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;
    self.api_regexes()?;
    if self.version.trim().is_empty() {
      return Err(eyre!("Cache version must not be empty"));
    }
    for (tag, trigger) in &self.sync_triggers {
      self
        .resolve(&trigger.endpoint)
        .map_err(|e| eyre!("Invalid endpoint for sync trigger {}: {}", tag, e))?;
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn api_regexes(&self) -> Result<Vec<Regex>> {
    self
      .api_patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid API pattern '{}': {}", p, e)))
      .collect()
  }

  /// Resolve a possibly relative URL against the origin.
  pub fn resolve(&self, reference: &str) -> Result<Url> {
    let origin = self.origin_url()?;
    origin
      .join(reference)
      .map_err(|e| eyre!("Invalid URL '{}': {}", reference, e))
  }

  /// Namespace for navigations and static assets.
  pub fn static_namespace(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }

  /// Namespace for API and default-class responses.
  pub fn api_namespace(&self) -> String {
    format!("{}-api-{}", self.cache_prefix, self.version)
  }

  pub fn precache_namespace(&self, group: &str) -> String {
    format!("{}-{}-{}", self.cache_prefix, group, self.version)
  }

  /// Every namespace belonging to the current generation, lookup order.
  pub fn namespaces(&self) -> Vec<String> {
    let mut names = vec![self.static_namespace(), self.api_namespace()];
    names.extend(self.precache.keys().map(|g| self.precache_namespace(g)));
    names
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("offsync.db")),
    }
  }
}

/// Application data directory ($XDG_DATA_HOME/offsync).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offsync"))
}
