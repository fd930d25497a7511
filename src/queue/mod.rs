//! Durable write-behind queue for writes that could not reach the backend.
//!
//! Entries are grouped by a type tag; within one type they form a FIFO
//! ordered by their auto-assigned id. The queue lives in SQLite so it
//! survives restarts and is shared by every engine instance using the file.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::cache::parse_datetime;
use crate::db::Database;
use crate::error::EngineResult;

/// A write waiting to be flushed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingWriteEntry {
  pub id: i64,
  pub write_type: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PendingWriteQueue {
  db: Database,
}

impl PendingWriteQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Append a write and return its id.
  pub fn enqueue(&self, write_type: &str, payload: &Value) -> EngineResult<i64> {
    let conn = self.db.conn()?;
    let payload = serde_json::to_string(payload)?;

    conn.execute(
      "INSERT INTO pending_writes (write_type, payload, created_at) VALUES (?, ?, ?)",
      params![write_type, payload, timestamp(Utc::now())],
    )?;
    let id = conn.last_insert_rowid();

    debug!(id, write_type, "Queued pending write");
    Ok(id)
  }

  /// Every pending entry of `write_type`, oldest first.
  pub fn list_by_type(&self, write_type: &str) -> EngineResult<Vec<PendingWriteEntry>> {
    self.query(
      "SELECT id, write_type, payload, created_at FROM pending_writes
       WHERE write_type = ? ORDER BY id",
      params![write_type],
    )
  }

  /// Remove the given entries of `write_type` in one transaction.
  ///
  /// Ids belonging to another type are left alone. Returns how many rows
  /// were removed.
  pub fn remove_by_type(&self, write_type: &str, ids: &[i64]) -> EngineResult<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut removed = 0;
    {
      let mut stmt = tx.prepare("DELETE FROM pending_writes WHERE id = ? AND write_type = ?")?;
      for id in ids {
        removed += stmt.execute(params![id, write_type])?;
      }
    }

    tx.commit()?;
    Ok(removed)
  }

  /// Number of pending entries per type.
  pub fn count_by_type(&self) -> EngineResult<BTreeMap<String, usize>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT write_type, COUNT(*) FROM pending_writes GROUP BY write_type ORDER BY write_type",
    )?;
    let counts = stmt
      .query_map([], |row| {
        let count: i64 = row.get(1)?;
        Ok((row.get::<_, String>(0)?, count as usize))
      })?
      .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(counts)
  }

  /// Entries of every type created in `[from, to)`, by creation time.
  pub fn list_created_between(
    &self,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
  ) -> EngineResult<Vec<PendingWriteEntry>> {
    self.query(
      "SELECT id, write_type, payload, created_at FROM pending_writes
       WHERE created_at >= ? AND created_at < ? ORDER BY created_at, id",
      params![timestamp(from), timestamp(to)],
    )
  }

  fn query(
    &self,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
  ) -> EngineResult<Vec<PendingWriteEntry>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(sql)?;

    let rows = stmt
      .query_map(params, |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(id, write_type, payload, created_at)| -> EngineResult<_> {
        Ok(PendingWriteEntry {
          id,
          write_type,
          payload: serde_json::from_str(&payload)?,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }
}

/// Fixed-width UTC timestamp so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn queue() -> PendingWriteQueue {
    PendingWriteQueue::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_ids_increase_and_order_is_fifo() {
    let queue = queue();
    let a = queue.enqueue("investments", &json!({"n": 1})).unwrap();
    let _ = queue.enqueue("security", &json!({"event": "login"})).unwrap();
    let b = queue.enqueue("investments", &json!({"n": 2})).unwrap();
    let c = queue.enqueue("investments", &json!({"n": 3})).unwrap();
    assert!(a < b && b < c);

    let entries = queue.list_by_type("investments").unwrap();
    let payloads: Vec<_> = entries.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
    assert_eq!(payloads, vec![1, 2, 3]);
    assert!(entries.iter().all(|e| e.write_type == "investments"));
  }

  #[test]
  fn test_remove_only_touches_given_type() {
    let queue = queue();
    let inv = queue.enqueue("investments", &json!(1)).unwrap();
    let sec = queue.enqueue("security", &json!(2)).unwrap();

    let removed = queue.remove_by_type("investments", &[inv, sec]).unwrap();

    assert_eq!(removed, 1);
    assert!(queue.list_by_type("investments").unwrap().is_empty());
    assert_eq!(queue.list_by_type("security").unwrap().len(), 1);
  }

  #[test]
  fn test_ids_are_not_reused_after_removal() {
    let queue = queue();
    let first = queue.enqueue("investments", &json!(1)).unwrap();
    queue.remove_by_type("investments", &[first]).unwrap();
    let second = queue.enqueue("investments", &json!(2)).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.db");

    {
      let queue = PendingWriteQueue::new(Database::open(&path).unwrap());
      queue.enqueue("investments", &json!({"plan": "gold"})).unwrap();
    }

    let reopened = PendingWriteQueue::new(Database::open(&path).unwrap());
    let entries = reopened.list_by_type("investments").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, json!({"plan": "gold"}));
  }

  #[test]
  fn test_two_instances_share_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.db");
    let tab_a = PendingWriteQueue::new(Database::open(&path).unwrap());
    let tab_b = PendingWriteQueue::new(Database::open(&path).unwrap());

    tab_a.enqueue("security", &json!("a")).unwrap();
    tab_b.enqueue("security", &json!("b")).unwrap();

    let seen: Vec<_> = tab_a
      .list_by_type("security")
      .unwrap()
      .into_iter()
      .map(|e| e.payload)
      .collect();
    assert_eq!(seen, vec![json!("a"), json!("b")]);
  }

  #[test]
  fn test_diagnostics() {
    let queue = queue();
    queue.enqueue("investments", &json!(1)).unwrap();
    queue.enqueue("investments", &json!(2)).unwrap();
    queue.enqueue("security", &json!(3)).unwrap();

    let counts = queue.count_by_type().unwrap();
    assert_eq!(counts.get("investments"), Some(&2));
    assert_eq!(counts.get("security"), Some(&1));

    let now = Utc::now();
    let recent = queue
      .list_created_between(now - Duration::minutes(1), now + Duration::minutes(1))
      .unwrap();
    assert_eq!(recent.len(), 3);
    let none = queue
      .list_created_between(now - Duration::hours(2), now - Duration::hours(1))
      .unwrap();
    assert!(none.is_empty());
  }
}
