//! Retrieval strategies run against the cache store and the network.

use reqwest::Method;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::NamespaceStorage;
use super::store::CacheStore;
use crate::classify::StrategyClass;
use crate::error::EngineResult;
use crate::http::{Network, Request, RequestIdentity, ResponseSnapshot};

/// Runs the strategy matching a request's class.
///
/// Lookups search every namespace of the current generation in order; writes
/// go to the namespace handed to [`execute`](Self::execute).
pub struct CacheStrategyExecutor<S: NamespaceStorage, N: Network> {
  store: CacheStore<S>,
  network: Arc<N>,
  lookup_order: Arc<Vec<String>>,
  offline_page: RequestIdentity,
  /// Background refreshes that may still be running
  revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: NamespaceStorage, N: Network> CacheStrategyExecutor<S, N> {
  pub fn new(
    store: CacheStore<S>,
    network: Arc<N>,
    lookup_order: Vec<String>,
    offline_page: RequestIdentity,
  ) -> Self {
    Self {
      store,
      network,
      lookup_order: Arc::new(lookup_order),
      offline_page,
      revalidations: Mutex::new(Vec::new()),
    }
  }

  pub async fn execute(
    &self,
    class: StrategyClass,
    request: &Request,
    namespace: &str,
  ) -> EngineResult<ResponseSnapshot> {
    match class {
      StrategyClass::Navigation => self.network_first(request, namespace, true).await,
      StrategyClass::Api | StrategyClass::Default => {
        self.network_first(request, namespace, false).await
      }
      StrategyClass::Static => self.cache_first(request, namespace).await,
    }
  }

  /// Network first; on connectivity failure serve the cached snapshot, then
  /// (navigations only, when `offline_fallback`) the offline page.
  async fn network_first(
    &self,
    request: &Request,
    namespace: &str,
    offline_fallback: bool,
  ) -> EngineResult<ResponseSnapshot> {
    let error = match self.network.fetch(request).await {
      Ok(response) => {
        store_if_cacheable(&self.store, namespace, request, &response)?;
        return Ok(response);
      }
      Err(e) => e,
    };

    debug!(url = %request.url, error = %error, "Network failed, trying cache");
    let identity = request.identity();
    if let Some(cached) = self.store.lookup(&self.lookup_order, &identity)? {
      return Ok(cached);
    }

    if offline_fallback && request.is_navigation() {
      if let Some(page) = self.store.lookup(&self.lookup_order, &self.offline_page)? {
        debug!(url = %request.url, "Serving offline page");
        return Ok(page);
      }
      warn!(url = %request.url, "Offline page is not cached");
    }

    Err(error)
  }

  /// Cache first; a hit is returned at once and refreshed in the background.
  async fn cache_first(&self, request: &Request, namespace: &str) -> EngineResult<ResponseSnapshot> {
    if let Some(cached) = self.store.lookup(&self.lookup_order, &request.identity())? {
      self.spawn_revalidation(request.clone(), namespace.to_string());
      return Ok(cached);
    }

    let response = self.network.fetch(request).await.inspect_err(|e| {
      warn!(url = %request.url, error = %e, "Both cache and network failed");
    })?;
    store_if_cacheable(&self.store, namespace, request, &response)?;
    Ok(response)
  }

  /// Detached refresh of a cached entry. Its outcome is only logged.
  fn spawn_revalidation(&self, request: Request, namespace: String) {
    let store = self.store.clone();
    let network = Arc::clone(&self.network);

    let handle = tokio::spawn(async move {
      let outcome = match network.fetch(&request).await {
        Ok(response) => store_if_cacheable(&store, &namespace, &request, &response),
        Err(e) => Err(e),
      };
      match outcome {
        Ok(()) => debug!(url = %request.url, "Background revalidation finished"),
        Err(e) => debug!(url = %request.url, error = %e, "Background revalidation failed"),
      }
    });

    if let Ok(mut pending) = self.revalidations.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }
  }

  /// Wait for every background refresh started so far. Hosts that tear the
  /// runtime down right after a request call this first so the refresh is
  /// not abandoned.
  pub async fn settle(&self) {
    let pending = match self.revalidations.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(_) => return,
    };
    for handle in pending {
      if let Err(e) = handle.await {
        warn!(error = %e, "Background revalidation task did not complete");
      }
    }
  }
}

/// Only successful responses to GET requests are ever written.
fn store_if_cacheable<S: NamespaceStorage>(
  store: &CacheStore<S>,
  namespace: &str,
  request: &Request,
  response: &ResponseSnapshot,
) -> EngineResult<()> {
  if request.method != Method::GET || !response.is_success() {
    return Ok(());
  }
  store.put(namespace, &request.identity(), response)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteNamespaceStorage;
  use crate::db::Database;
  use crate::error::EngineError;
  use crate::testing::ScriptedNetwork;
  use std::time::Duration;
  use url::Url;

  const STATIC_NS: &str = "app-v1";
  const API_NS: &str = "app-api-v1";

  struct Fixture {
    store: CacheStore<SqliteNamespaceStorage>,
    network: Arc<ScriptedNetwork>,
    executor: CacheStrategyExecutor<SqliteNamespaceStorage, ScriptedNetwork>,
  }

  fn fixture() -> Fixture {
    let store = CacheStore::new(SqliteNamespaceStorage::new(Database::open_in_memory().unwrap()));
    let network = Arc::new(ScriptedNetwork::new());
    let offline = Request::get(url("/static/offline.html")).identity();
    let executor = CacheStrategyExecutor::new(
      store.clone(),
      Arc::clone(&network),
      vec![STATIC_NS.to_string(), API_NS.to_string()],
      offline,
    );
    Fixture {
      store,
      network,
      executor,
    }
  }

  fn url(path: &str) -> Url {
    Url::parse("https://app.test").unwrap().join(path).unwrap()
  }

  async fn wait_for_body(store: &CacheStore<SqliteNamespaceStorage>, request: &Request, body: &[u8]) -> bool {
    for _ in 0..50 {
      if let Ok(Some(hit)) = store.get(STATIC_NS, &request.identity()) {
        if hit.body == body {
          return true;
        }
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_navigation_success_is_cached_for_offline_repeat() {
    let f = fixture();
    let request = Request::navigate(url("/dashboard"));
    f.network.respond(request.url.as_str(), 200, "<html>live</html>");

    let live = f
      .executor
      .execute(StrategyClass::Navigation, &request, STATIC_NS)
      .await
      .unwrap();

    f.network.set_offline(true);
    let offline = f
      .executor
      .execute(StrategyClass::Navigation, &request, STATIC_NS)
      .await
      .unwrap();

    assert_eq!(live.body, offline.body);
    assert_eq!(live.status, offline.status);
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_offline_page() {
    let f = fixture();
    f.store
      .put(
        STATIC_NS,
        &Request::get(url("/static/offline.html")).identity(),
        &ResponseSnapshot::new(200, "offline"),
      )
      .unwrap();
    f.network.set_offline(true);

    let response = f
      .executor
      .execute(StrategyClass::Navigation, &Request::navigate(url("/profile")), STATIC_NS)
      .await
      .unwrap();

    assert_eq!(response.body, b"offline");
  }

  #[tokio::test]
  async fn test_navigation_without_offline_page_propagates() {
    let f = fixture();
    f.network.set_offline(true);

    let result = f
      .executor
      .execute(StrategyClass::Navigation, &Request::navigate(url("/profile")), STATIC_NS)
      .await;

    assert!(matches!(result, Err(EngineError::Connectivity(_))));
  }

  #[tokio::test]
  async fn test_api_failure_without_cache_propagates() {
    let f = fixture();
    f.store
      .put(
        STATIC_NS,
        &Request::get(url("/static/offline.html")).identity(),
        &ResponseSnapshot::new(200, "offline"),
      )
      .unwrap();
    f.network.set_offline(true);

    let result = f
      .executor
      .execute(StrategyClass::Api, &Request::get(url("/api/plans")), API_NS)
      .await;

    assert!(matches!(result, Err(EngineError::Connectivity(_))));
  }

  #[tokio::test]
  async fn test_api_serves_cache_when_offline() {
    let f = fixture();
    let request = Request::get(url("/api/plans"));
    f.network.respond(request.url.as_str(), 200, "[1,2]");

    f.executor.execute(StrategyClass::Api, &request, API_NS).await.unwrap();
    assert!(f.store.get(API_NS, &request.identity()).unwrap().is_some());

    f.network.set_offline(true);
    let cached = f.executor.execute(StrategyClass::Default, &request, API_NS).await.unwrap();
    assert_eq!(cached.body, b"[1,2]");
  }

  #[tokio::test]
  async fn test_non_success_passes_through_uncached() {
    let f = fixture();
    let request = Request::get(url("/api/broken"));
    f.network.respond(request.url.as_str(), 500, "boom");

    let response = f.executor.execute(StrategyClass::Api, &request, API_NS).await.unwrap();

    assert_eq!(response.status, 500);
    assert!(f.store.get(API_NS, &request.identity()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_post_is_never_cached() {
    let f = fixture();
    let request = Request::post_json(url("/api/invest"), serde_json::json!({"amount": 10}));
    f.network.respond(request.url.as_str(), 201, "created");

    f.executor.execute(StrategyClass::Api, &request, API_NS).await.unwrap();
    assert!(f.store.get(API_NS, &request.identity()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_static_hit_returns_without_network() {
    let f = fixture();
    let request = Request::get(url("/static/app.css"));
    f.store
      .put(STATIC_NS, &request.identity(), &ResponseSnapshot::new(200, "cached"))
      .unwrap();
    f.network.set_offline(true);
    f.network.set_delay(Duration::from_secs(30));

    let response = tokio::time::timeout(
      Duration::from_secs(1),
      f.executor.execute(StrategyClass::Static, &request, STATIC_NS),
    )
    .await
    .expect("cache hit must not wait for the network")
    .unwrap();

    assert_eq!(response.body, b"cached");
  }

  #[tokio::test]
  async fn test_static_hit_is_revalidated_in_background() {
    let f = fixture();
    let request = Request::get(url("/static/app.css"));
    f.store
      .put(STATIC_NS, &request.identity(), &ResponseSnapshot::new(200, "old"))
      .unwrap();
    f.network.respond(request.url.as_str(), 200, "new");

    let response = f
      .executor
      .execute(StrategyClass::Static, &request, STATIC_NS)
      .await
      .unwrap();

    assert_eq!(response.body, b"old");
    assert!(wait_for_body(&f.store, &request, b"new").await);
  }

  #[tokio::test]
  async fn test_settle_waits_for_background_refresh() {
    let f = fixture();
    let request = Request::get(url("/static/app.js"));
    f.store
      .put(STATIC_NS, &request.identity(), &ResponseSnapshot::new(200, "old"))
      .unwrap();
    f.network.respond(request.url.as_str(), 200, "new");
    f.network.set_delay(Duration::from_millis(100));

    let response = f
      .executor
      .execute(StrategyClass::Static, &request, STATIC_NS)
      .await
      .unwrap();
    assert_eq!(response.body, b"old");

    f.executor.settle().await;
    let refreshed = f.store.get(STATIC_NS, &request.identity()).unwrap().unwrap();
    assert_eq!(refreshed.body, b"new");

    // Nothing left to wait for
    f.executor.settle().await;
  }

  #[tokio::test]
  async fn test_static_background_failure_is_swallowed() {
    let f = fixture();
    let request = Request::get(url("/static/app.css"));
    f.store
      .put(STATIC_NS, &request.identity(), &ResponseSnapshot::new(200, "old"))
      .unwrap();
    f.network.respond(request.url.as_str(), 503, "down");

    let response = f
      .executor
      .execute(StrategyClass::Static, &request, STATIC_NS)
      .await
      .unwrap();
    assert_eq!(response.body, b"old");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let still = f.store.get(STATIC_NS, &request.identity()).unwrap().unwrap();
    assert_eq!(still.body, b"old");
  }

  #[tokio::test]
  async fn test_static_miss_fetches_and_stores() {
    let f = fixture();
    let request = Request::get(url("/static/logo.png"));
    f.network.respond(request.url.as_str(), 200, "png");

    let response = f
      .executor
      .execute(StrategyClass::Static, &request, STATIC_NS)
      .await
      .unwrap();

    assert_eq!(response.body, b"png");
    assert_eq!(f.network.request_count(request.url.as_str()), 1);
    assert!(f.store.get(STATIC_NS, &request.identity()).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_static_miss_offline_propagates() {
    let f = fixture();
    f.network.set_offline(true);

    let result = f
      .executor
      .execute(StrategyClass::Static, &Request::get(url("/static/logo.png")), STATIC_NS)
      .await;

    assert!(matches!(result, Err(EngineError::Connectivity(_))));
  }
}
