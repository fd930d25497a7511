//! Namespace storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;

use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::http::{RequestIdentity, ResponseSnapshot};

/// Entries destined for one namespace.
pub type NamespaceBatch<'a> = (&'a str, &'a [(RequestIdentity, ResponseSnapshot)]);

/// Trait for cache namespace backends.
///
/// Every mutating call is atomic: either all of its writes land or none do.
pub trait NamespaceStorage: Send + Sync + 'static {
  /// Names of every existing namespace, oldest first.
  fn keys(&self) -> EngineResult<Vec<String>>;

  /// Create the namespace if it does not exist yet.
  fn open(&self, namespace: &str) -> EngineResult<()>;

  /// Look up the snapshot stored for a request identity.
  fn lookup(
    &self,
    namespace: &str,
    identity: &RequestIdentity,
  ) -> EngineResult<Option<ResponseSnapshot>>;

  /// Store (or replace) a single snapshot, creating the namespace if needed.
  fn put(
    &self,
    namespace: &str,
    identity: &RequestIdentity,
    snapshot: &ResponseSnapshot,
  ) -> EngineResult<()> {
    self.put_all(namespace, &[(identity.clone(), snapshot.clone())])
  }

  /// Store a batch of snapshots in one transaction.
  fn put_all(
    &self,
    namespace: &str,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> EngineResult<()> {
    self.put_batches(&[(namespace, entries)])
  }

  /// Store snapshots into several namespaces in one transaction. Every
  /// listed namespace exists afterwards, even with no entries.
  fn put_batches(&self, batches: &[NamespaceBatch<'_>]) -> EngineResult<()>;

  /// Delete a namespace and all of its entries. Returns whether it existed.
  fn delete(&self, namespace: &str) -> EngineResult<bool>;
}

/// SQLite-based namespace storage.
#[derive(Clone)]
pub struct SqliteNamespaceStorage {
  db: Database,
}

impl SqliteNamespaceStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Number of entries held by a namespace.
  pub fn entry_count(&self, namespace: &str) -> EngineResult<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
      params![namespace],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

impl NamespaceStorage for SqliteNamespaceStorage {
  fn keys(&self) -> EngineResult<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_namespaces ORDER BY created_at, name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn open(&self, namespace: &str) -> EngineResult<()> {
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  fn lookup(
    &self,
    namespace: &str,
    identity: &RequestIdentity,
  ) -> EngineResult<Option<ResponseSnapshot>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, captured_at FROM cache_entries
         WHERE namespace = ? AND identity_key = ?",
        params![namespace, identity.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, captured_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        Ok(Some(ResponseSnapshot {
          status,
          headers,
          body,
          captured_at: parse_datetime(&captured_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_batches(&self, batches: &[NamespaceBatch<'_>]) -> EngineResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for (namespace, entries) in batches {
      tx.execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
        params![namespace, Utc::now().to_rfc3339()],
      )?;

      for (identity, snapshot) in entries.iter() {
        let headers = serde_json::to_string(&snapshot.headers)?;
        tx.execute(
          "INSERT OR REPLACE INTO cache_entries
             (namespace, identity_key, method, url, status, headers, body, captured_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
          params![
            namespace,
            identity.cache_key(),
            identity.method(),
            identity.url(),
            snapshot.status,
            headers,
            snapshot.body,
            snapshot.captured_at.to_rfc3339(),
          ],
        )?;
      }
    }

    tx.commit()?;
    Ok(())
  }

  fn delete(&self, namespace: &str) -> EngineResult<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )?;
    let removed = tx.execute(
      "DELETE FROM cache_namespaces WHERE name = ?",
      params![namespace],
    )?;

    tx.commit()?;
    Ok(removed > 0)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> EngineResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| EngineError::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
