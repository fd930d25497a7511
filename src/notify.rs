//! Push notification display and interaction routing.
//!
//! Display options are merged field by field, highest precedence first:
//!
//! | field                 | investment            | security        | default               |
//! |-----------------------|-----------------------|-----------------|-----------------------|
//! | `title`, `body`       | payload, config       | payload, config | payload, config       |
//! | `vibrate`             | payload, category     | category only   | payload, category     |
//! | `require_interaction` | payload, category     | category only   | payload, category     |
//! | `actions`             | category only         | category only   | payload, category     |
//! | `tag`                 | payload, category     | payload, category | payload, category   |
//! | `image`, `data`, `renotify`, `silent` | payload | payload        | payload               |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::NotificationConfig;
use crate::error::{EngineError, EngineResult};

const SECURITY_VIBRATION: &[u32] = &[300, 100, 300, 100, 300];
const GENTLE_VIBRATION: &[u32] = &[200];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
  Investment,
  Security,
  Default,
}

impl Category {
  pub fn from_tag(tag: Option<&str>) -> Self {
    match tag {
      Some("investment") => Category::Investment,
      Some("security") => Category::Security,
      _ => Category::Default,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Category::Investment => "investment",
      Category::Security => "security",
      Category::Default => "default",
    }
  }

  fn defaults(self) -> CategoryDefaults {
    match self {
      Category::Investment => CategoryDefaults {
        vibrate: GENTLE_VIBRATION,
        require_interaction: false,
        forced_alerting: false,
        actions: &[
          ("view_dashboard", "Dashboard"),
          ("view_profits", "Profits"),
          ("dismiss", "Dismiss"),
        ],
        fixed_actions: true,
      },
      Category::Security => CategoryDefaults {
        vibrate: SECURITY_VIBRATION,
        require_interaction: true,
        forced_alerting: true,
        actions: &[("view_security", "Security"), ("lock_account", "Lock account")],
        fixed_actions: true,
      },
      Category::Default => CategoryDefaults {
        vibrate: GENTLE_VIBRATION,
        require_interaction: false,
        forced_alerting: false,
        actions: &[("view", "View"), ("dismiss", "Dismiss")],
        fixed_actions: false,
      },
    }
  }
}

struct CategoryDefaults {
  vibrate: &'static [u32],
  require_interaction: bool,
  /// Vibration and required interaction ignore payload overrides
  forced_alerting: bool,
  actions: &'static [(&'static str, &'static str)],
  /// Payload actions are ignored
  fixed_actions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// Inbound push payload. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  #[serde(rename = "type")]
  pub category: Option<String>,
  pub image: Option<String>,
  pub vibrate: Option<Vec<u32>>,
  pub require_interaction: Option<bool>,
  pub tag: Option<String>,
  pub renotify: Option<bool>,
  pub silent: Option<bool>,
  pub data: Option<Value>,
  pub actions: Option<Vec<NotificationAction>>,
}

impl PushPayload {
  pub fn from_json(bytes: &[u8]) -> EngineResult<Self> {
    serde_json::from_slice(bytes)
      .map_err(|e| EngineError::InvalidRequest(format!("malformed push payload: {}", e)))
  }
}

/// Fully merged display configuration handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub category: Category,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub image: Option<String>,
  pub vibrate: Vec<u32>,
  pub require_interaction: bool,
  pub tag: String,
  pub renotify: bool,
  pub silent: bool,
  pub actions: Vec<NotificationAction>,
  pub data: Value,
  pub timestamp: DateTime<Utc>,
}

/// What a user interaction resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
  Navigate(String),
  Dismissed,
}

/// Platform surface notifications are shown on.
pub trait NotificationHost: Send + Sync + 'static {
  fn show(&self, notification: &Notification) -> EngineResult<()>;

  fn close(&self, tag: &str);

  fn open_window(&self, route: &str) -> EngineResult<()>;
}

pub struct NotificationDispatcher<H: NotificationHost> {
  host: Arc<H>,
  config: NotificationConfig,
}

impl<H: NotificationHost> NotificationDispatcher<H> {
  pub fn new(host: Arc<H>, config: NotificationConfig) -> Self {
    Self { host, config }
  }

  /// Merge category defaults with the payload and show the result.
  pub fn present(&self, payload: &PushPayload) -> EngineResult<Notification> {
    let notification = self.build(payload);
    self.host.show(&notification)?;
    info!(
      category = notification.category.name(),
      tag = %notification.tag,
      "Notification shown"
    );
    Ok(notification)
  }

  /// Precedence-ordered merge, see the module table.
  pub fn build(&self, payload: &PushPayload) -> Notification {
    let category = Category::from_tag(payload.category.as_deref());
    let defaults = category.defaults();

    let (vibrate, require_interaction) = if defaults.forced_alerting {
      (defaults.vibrate.to_vec(), defaults.require_interaction)
    } else {
      (
        payload
          .vibrate
          .clone()
          .unwrap_or_else(|| defaults.vibrate.to_vec()),
        payload
          .require_interaction
          .unwrap_or(defaults.require_interaction),
      )
    };

    let actions = match (&payload.actions, defaults.fixed_actions) {
      (Some(actions), false) => actions.clone(),
      _ => defaults
        .actions
        .iter()
        .map(|(action, title)| NotificationAction {
          action: action.to_string(),
          title: title.to_string(),
          icon: Some(self.config.action_icon.clone()),
        })
        .collect(),
    };

    Notification {
      category,
      title: payload
        .title
        .clone()
        .unwrap_or_else(|| self.config.app_title.clone()),
      body: payload
        .body
        .clone()
        .unwrap_or_else(|| self.config.default_body.clone()),
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      image: payload.image.clone(),
      vibrate,
      require_interaction,
      tag: payload
        .tag
        .clone()
        .unwrap_or_else(|| category.name().to_string()),
      renotify: payload.renotify.unwrap_or(false),
      silent: payload.silent.unwrap_or(false),
      actions,
      data: payload.data.clone().unwrap_or(Value::Object(Default::default())),
      timestamp: Utc::now(),
    }
  }

  /// Map an action to its route and navigate at most once.
  pub fn resolve_interaction(
    &self,
    action_id: &str,
    tag: Option<&str>,
    context: &Value,
  ) -> EngineResult<Interaction> {
    if let Some(tag) = tag {
      self.host.close(tag);
    }

    let interaction = self.route_for(action_id, context);
    match &interaction {
      Interaction::Navigate(route) => {
        debug!(action = action_id, route = %route, "Opening notification target");
        self.host.open_window(route)?;
      }
      Interaction::Dismissed => debug!(action = action_id, "Notification dismissed"),
    }
    Ok(interaction)
  }

  fn route_for(&self, action_id: &str, context: &Value) -> Interaction {
    let route: &str = match action_id {
      "dismiss" => return Interaction::Dismissed,
      "view" => context
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or(&self.config.default_route),
      "view_dashboard" => "/dashboard",
      "view_profits" => "/investment-history",
      "view_security" => "/security",
      "lock_account" => "/security?action=lock",
      _ => &self.config.default_route,
    };
    Interaction::Navigate(route.to_string())
  }
}
