//! Versioned cache namespaces: install-time population, lookup and garbage
//! collection of superseded generations.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::storage::{NamespaceBatch, NamespaceStorage};
use crate::error::{EngineError, EngineResult};
use crate::http::{Network, Request, RequestIdentity, ResponseSnapshot};

/// Cache store that owns the namespace lifecycle.
///
/// Callers never touch the storage backend directly; every operation here
/// maps to one atomic backend call.
pub struct CacheStore<S: NamespaceStorage> {
  storage: Arc<S>,
}

impl<S: NamespaceStorage> CacheStore<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Fetch every manifest URL and add them all to `namespace`, or nothing.
  ///
  /// Any failed fetch or non-2xx response fails the whole population and
  /// leaves the namespace untouched.
  pub async fn populate<N: Network + ?Sized>(
    &self,
    network: &N,
    namespace: &str,
    manifest: &[Url],
  ) -> EngineResult<usize> {
    self.populate_all(network, &[(namespace, manifest)]).await
  }

  /// Populate several namespaces as one unit: every URL of every group is
  /// fetched first, then all namespaces are written in one transaction.
  /// A single failure leaves none of them behind.
  pub async fn populate_all<N: Network + ?Sized>(
    &self,
    network: &N,
    groups: &[(&str, &[Url])],
  ) -> EngineResult<usize> {
    let fetched = try_join_all(
      groups
        .iter()
        .map(|(namespace, manifest)| Self::fetch_manifest(network, namespace, manifest)),
    )
    .await?;

    let batches: Vec<NamespaceBatch<'_>> = groups
      .iter()
      .zip(&fetched)
      .map(|((namespace, _), entries)| (*namespace, entries.as_slice()))
      .collect();
    self.storage.put_batches(&batches)?;

    let mut total = 0;
    for (namespace, entries) in batches {
      info!(namespace, entries = entries.len(), "Namespace populated");
      total += entries.len();
    }
    Ok(total)
  }

  async fn fetch_manifest<N: Network + ?Sized>(
    network: &N,
    namespace: &str,
    manifest: &[Url],
  ) -> EngineResult<Vec<(RequestIdentity, ResponseSnapshot)>> {
    let fetches = manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let population_error = |reason: String| EngineError::Population {
        namespace: namespace.to_string(),
        url: url.to_string(),
        reason,
      };

      let response = network
        .fetch(&request)
        .await
        .map_err(|e| population_error(e.to_string()))?;
      if !response.is_success() {
        return Err(population_error(format!("status {}", response.status)));
      }
      Ok((request.identity(), response))
    });

    try_join_all(fetches).await
  }

  pub fn get(
    &self,
    namespace: &str,
    identity: &RequestIdentity,
  ) -> EngineResult<Option<ResponseSnapshot>> {
    self.storage.lookup(namespace, identity)
  }

  pub fn put(
    &self,
    namespace: &str,
    identity: &RequestIdentity,
    snapshot: &ResponseSnapshot,
  ) -> EngineResult<()> {
    self.storage.put(namespace, identity, snapshot)
  }

  /// First snapshot found for `identity`, searching `namespaces` in order.
  pub fn lookup(
    &self,
    namespaces: &[String],
    identity: &RequestIdentity,
  ) -> EngineResult<Option<ResponseSnapshot>> {
    for namespace in namespaces {
      if let Some(snapshot) = self.get(namespace, identity)? {
        debug!(namespace = %namespace, request = %identity, "Cache hit");
        return Ok(Some(snapshot));
      }
    }
    debug!(request = %identity, "Cache miss");
    Ok(None)
  }

  /// Delete every namespace not in `current`. Returns the deleted names.
  pub fn collect_garbage(&self, current: &[String]) -> EngineResult<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.keys()? {
      if current.contains(&name) {
        continue;
      }
      if self.storage.delete(&name)? {
        info!(namespace = %name, "Deleted stale namespace");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Make sure every namespace in `names` exists, empty if new.
  pub fn open_all(&self, names: &[String]) -> EngineResult<()> {
    for name in names {
      self.storage.open(name)?;
    }
    Ok(())
  }

  pub fn namespaces(&self) -> EngineResult<Vec<String>> {
    self.storage.keys()
  }
}

impl<S: NamespaceStorage> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
