//! Transactional offline store.
//!
//! Five named collections backed by a single SQLite database. Rows are
//! serialized JSON blobs with their keys extracted into columns; all access
//! goes through a [`StoreContext`], one unit of work that commits or rolls
//! back as a group. Reads return detached copies reconstructed from the
//! stored bytes.

pub mod records;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

/// The named collections of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
  Queries,
  QueryResults,
  ActionClasses,
  Changes,
  Requests,
}

impl Collection {
  pub const ALL: [Collection; 5] = [
    Collection::Queries,
    Collection::QueryResults,
    Collection::ActionClasses,
    Collection::Changes,
    Collection::Requests,
  ];

  pub fn table(self) -> &'static str {
    match self {
      Collection::Queries => "queries",
      Collection::QueryResults => "query_results",
      Collection::ActionClasses => "action_classes_by_id",
      Collection::Changes => "changes",
      Collection::Requests => "requests",
    }
  }

  /// The changes journal assigns its own sequence keys.
  fn auto_keyed(self) -> bool {
    matches!(self, Collection::Changes)
  }
}

/// Primary key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
  Single(String),
  Composite(String, String),
  /// Auto-assigned sequence number; `None` until the row has been added.
  Sequence(Option<i64>),
}

impl RecordKey {
  fn columns(&self) -> Result<(&str, &str)> {
    match self {
      RecordKey::Single(k) => Ok((k, "")),
      RecordKey::Composite(a, b) => Ok((a, b)),
      RecordKey::Sequence(_) => Err(eyre!("sequence keys have no key columns")),
    }
  }
}

/// A row type bound to one collection.
pub trait StoreRecord: Serialize + DeserializeOwned {
  const COLLECTION: Collection;

  fn record_key(&self) -> RecordKey;

  /// Secondary-index value, for collections that keep one.
  fn index_value(&self) -> Option<String> {
    None
  }

  /// Called after an auto-assigned sequence key is known.
  fn assign_sequence(&mut self, _sequence: i64) {}
}

/// The offline store. Opening creates missing tables and indexes, so no
/// operation can ever observe an uninitialized database.
pub struct Store {
  conn: Mutex<Connection>,
}

impl Store {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store. Used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }

  /// Run one unit of work. The closure's reads and writes happen inside a
  /// single transaction; `Ok` commits, `Err` rolls everything back.
  pub fn context<T>(&self, f: impl FnOnce(&StoreContext) -> Result<T>) -> Result<T> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    match f(&StoreContext { tx: &tx }) {
      Ok(value) => {
        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(value)
      }
      Err(err) => {
        // Rollback failures are unreachable in practice and would mask err.
        let _ = tx.rollback();
        Err(err)
      }
    }
  }
}

/// Scoped read/write access within one transaction.
pub struct StoreContext<'a> {
  tx: &'a rusqlite::Transaction<'a>,
}

impl StoreContext<'_> {
  /// Delete every row of a collection.
  pub fn clear(&self, collection: Collection) -> Result<()> {
    self
      .tx
      .execute(&format!("DELETE FROM {}", collection.table()), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", collection.table(), e))?;
    Ok(())
  }

  /// Number of rows in a collection.
  pub fn count(&self, collection: Collection) -> Result<i64> {
    self
      .tx
      .query_row(
        &format!("SELECT COUNT(*) FROM {}", collection.table()),
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", collection.table(), e))
  }

  /// Whether a row with the given key exists.
  pub fn exists(&self, collection: Collection, key: &RecordKey) -> Result<bool> {
    let table = collection.table();
    let found = match key {
      RecordKey::Sequence(Some(seq)) => self
        .tx
        .query_row(
          &format!("SELECT 1 FROM {} WHERE sequence = ?1", table),
          params![seq],
          |_| Ok(()),
        )
        .optional(),
      RecordKey::Sequence(None) => return Ok(false),
      key => {
        let (k1, k2) = key.columns()?;
        self
          .tx
          .query_row(
            &format!("SELECT 1 FROM {} WHERE key1 = ?1 AND key2 = ?2", table),
            params![k1, k2],
            |_| Ok(()),
          )
          .optional()
      }
    };

    Ok(
      found
        .map_err(|e| eyre!("Failed to check {}: {}", table, e))?
        .is_some(),
    )
  }

  /// Insert or replace a row (upsert).
  pub fn save<R: StoreRecord>(&self, record: &R) -> Result<()> {
    let table = R::COLLECTION.table();
    let data = serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize row: {}", e))?;

    match record.record_key() {
      RecordKey::Sequence(Some(seq)) => {
        self
          .tx
          .execute(
            &format!(
              "INSERT OR REPLACE INTO {} (sequence, idx, data) VALUES (?1, ?2, ?3)",
              table
            ),
            params![seq, record.index_value(), data],
          )
          .map_err(|e| eyre!("Failed to save into {}: {}", table, e))?;
      }
      RecordKey::Sequence(None) => {
        return Err(eyre!("Cannot save into {} without a sequence; use add", table));
      }
      key => {
        let (k1, k2) = key.columns()?;
        self
          .tx
          .execute(
            &format!(
              "INSERT OR REPLACE INTO {} (key1, key2, idx, data) VALUES (?1, ?2, ?3, ?4)",
              table
            ),
            params![k1, k2, record.index_value(), data],
          )
          .map_err(|e| eyre!("Failed to save into {}: {}", table, e))?;
      }
    }

    Ok(())
  }

  /// Upsert a batch of rows.
  pub fn save_all<R: StoreRecord>(&self, records: &[R]) -> Result<()> {
    for record in records {
      self.save(record)?;
    }
    Ok(())
  }

  /// Insert a row. Unlike [`save`](Self::save) an existing key is an error.
  /// Auto-keyed rows receive their sequence number through
  /// [`StoreRecord::assign_sequence`].
  pub fn add<R: StoreRecord>(&self, record: &mut R) -> Result<()> {
    let table = R::COLLECTION.table();
    let data = serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize row: {}", e))?;

    match record.record_key() {
      RecordKey::Sequence(_) => {
        self
          .tx
          .execute(
            &format!("INSERT INTO {} (idx, data) VALUES (?1, ?2)", table),
            params![record.index_value(), data],
          )
          .map_err(|e| eyre!("Failed to add into {}: {}", table, e))?;
        record.assign_sequence(self.tx.last_insert_rowid());
      }
      key => {
        let (k1, k2) = key.columns()?;
        self
          .tx
          .execute(
            &format!(
              "INSERT INTO {} (key1, key2, idx, data) VALUES (?1, ?2, ?3, ?4)",
              table
            ),
            params![k1, k2, record.index_value(), data],
          )
          .map_err(|e| eyre!("Failed to add into {}: {}", table, e))?;
      }
    }

    Ok(())
  }

  /// Insert a batch of rows.
  pub fn add_all<R: StoreRecord>(&self, records: &mut [R]) -> Result<()> {
    for record in records {
      self.add(record)?;
    }
    Ok(())
  }

  /// Load a single row. A missing key is `None`, never an error.
  pub fn load<R: StoreRecord>(&self, key: &RecordKey) -> Result<Option<R>> {
    let table = R::COLLECTION.table();

    let row: Option<(Option<i64>, Vec<u8>)> = match key {
      RecordKey::Sequence(Some(seq)) => self
        .tx
        .query_row(
          &format!("SELECT sequence, data FROM {} WHERE sequence = ?1", table),
          params![seq],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to load from {}: {}", table, e))?,
      RecordKey::Sequence(None) => None,
      key => {
        let (k1, k2) = key.columns()?;
        self
          .tx
          .query_row(
            &format!(
              "SELECT NULL, data FROM {} WHERE key1 = ?1 AND key2 = ?2",
              table
            ),
            params![k1, k2],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to load from {}: {}", table, e))?
      }
    };

    match row {
      Some((sequence, data)) => {
        let mut record: R = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize row from {}: {}", table, e))?;
        if let Some(sequence) = sequence {
          record.assign_sequence(sequence);
        }
        Ok(Some(record))
      }
      None => Ok(None),
    }
  }

  /// Load every row of a collection, in key order.
  pub fn load_all<R: StoreRecord>(&self) -> Result<Vec<R>> {
    self.load_rows(None)
  }

  /// Load every row whose secondary-index value equals `index_key`.
  pub fn load_by_index<R: StoreRecord>(&self, index_key: &str) -> Result<Vec<R>> {
    self.load_rows(Some(index_key))
  }

  fn load_rows<R: StoreRecord>(&self, index_key: Option<&str>) -> Result<Vec<R>> {
    let table = R::COLLECTION.table();
    let key_column = if R::COLLECTION.auto_keyed() {
      "sequence"
    } else {
      "NULL"
    };
    let order = if R::COLLECTION.auto_keyed() {
      "sequence"
    } else {
      "key1, key2"
    };

    let sql = match index_key {
      Some(_) => format!(
        "SELECT {}, data FROM {} WHERE idx = ?1 ORDER BY {}",
        key_column, table, order
      ),
      None => format!("SELECT {}, data FROM {} ORDER BY {}", key_column, table, order),
    };

    let mut stmt = self
      .tx
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare load from {}: {}", table, e))?;

    let rows: Vec<(Option<i64>, Vec<u8>)> = match index_key {
      Some(key) => stmt
        .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
        .and_then(|mapped| mapped.collect())
        .map_err(|e| eyre!("Failed to load from {}: {}", table, e))?,
      None => stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .and_then(|mapped| mapped.collect())
        .map_err(|e| eyre!("Failed to load from {}: {}", table, e))?,
    };

    let mut records = Vec::with_capacity(rows.len());
    for (sequence, data) in rows {
      let mut record: R = serde_json::from_slice(&data)
        .map_err(|e| eyre!("Failed to deserialize row from {}: {}", table, e))?;
      if let Some(sequence) = sequence {
        record.assign_sequence(sequence);
      }
      records.push(record);
    }

    Ok(records)
  }

  /// Delete every row matching the predicate, returning the deleted count.
  pub fn delete_all<R: StoreRecord>(&self, predicate: impl Fn(&R) -> bool) -> Result<usize> {
    self.delete_rows(None, predicate)
  }

  /// Delete every row under the given index key matching the predicate,
  /// returning the deleted count.
  pub fn delete_by_index<R: StoreRecord>(
    &self,
    index_key: &str,
    predicate: impl Fn(&R) -> bool,
  ) -> Result<usize> {
    self.delete_rows(Some(index_key), predicate)
  }

  fn delete_rows<R: StoreRecord>(
    &self,
    index_key: Option<&str>,
    predicate: impl Fn(&R) -> bool,
  ) -> Result<usize> {
    let table = R::COLLECTION.table();
    let mut deleted = 0usize;

    for record in self.load_rows::<R>(index_key)? {
      if !predicate(&record) {
        continue;
      }

      match record.record_key() {
        RecordKey::Sequence(Some(seq)) => {
          self
            .tx
            .execute(
              &format!("DELETE FROM {} WHERE sequence = ?1", table),
              params![seq],
            )
            .map_err(|e| eyre!("Failed to delete from {}: {}", table, e))?;
        }
        RecordKey::Sequence(None) => continue,
        key => {
          let (k1, k2) = key.columns()?;
          self
            .tx
            .execute(
              &format!("DELETE FROM {} WHERE key1 = ?1 AND key2 = ?2", table),
              params![k1, k2],
            )
            .map_err(|e| eyre!("Failed to delete from {}: {}", table, e))?;
        }
      }
      deleted += 1;
    }

    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::records::{ActionClassRow, ChangeRow, ChangeType, RequestRow, ResultItemRow};
  use super::*;
  use crate::service::types::ResultItemDto;

  fn item_row(owner: &str, id: &str) -> ResultItemRow {
    ResultItemRow {
      persistent_object_id: owner.to_string(),
      item: ResultItemDto {
        id: id.to_string(),
        ..Default::default()
      },
    }
  }

  #[test]
  fn test_save_load_roundtrip() {
    let store = Store::open_in_memory().unwrap();

    store
      .context(|ctx| {
        ctx.save(&ActionClassRow {
          id: "q-1".into(),
          name: "Customer".into(),
        })
      })
      .unwrap();

    let loaded: Option<ActionClassRow> = store
      .context(|ctx| ctx.load(&RecordKey::Single("q-1".into())))
      .unwrap();
    assert_eq!(loaded.unwrap().name, "Customer");

    let missing: Option<ActionClassRow> = store
      .context(|ctx| ctx.load(&RecordKey::Single("nope".into())))
      .unwrap();
    assert!(missing.is_none());
  }

  #[test]
  fn test_add_rejects_duplicate_keys() {
    let store = Store::open_in_memory().unwrap();

    let result = store.context(|ctx| {
      let mut first = ActionClassRow {
        id: "q-1".into(),
        name: "Customer".into(),
      };
      ctx.add(&mut first)?;
      let mut second = ActionClassRow {
        id: "q-1".into(),
        name: "Order".into(),
      };
      ctx.add(&mut second)
    });

    assert!(result.is_err());
  }

  #[test]
  fn test_save_is_upsert() {
    let store = Store::open_in_memory().unwrap();

    store
      .context(|ctx| {
        ctx.save(&ActionClassRow {
          id: "q-1".into(),
          name: "Customer".into(),
        })?;
        ctx.save(&ActionClassRow {
          id: "q-1".into(),
          name: "Order".into(),
        })
      })
      .unwrap();

    let loaded: Option<ActionClassRow> = store
      .context(|ctx| ctx.load(&RecordKey::Single("q-1".into())))
      .unwrap();
    assert_eq!(loaded.unwrap().name, "Order");
  }

  #[test]
  fn test_context_rolls_back_on_error() {
    let store = Store::open_in_memory().unwrap();

    let result: Result<()> = store.context(|ctx| {
      ctx.save(&ActionClassRow {
        id: "q-1".into(),
        name: "Customer".into(),
      })?;
      Err(color_eyre::eyre::eyre!("boom"))
    });
    assert!(result.is_err());

    let exists = store
      .context(|ctx| ctx.exists(Collection::ActionClasses, &RecordKey::Single("q-1".into())))
      .unwrap();
    assert!(!exists);
  }

  #[test]
  fn test_composite_keys_and_index_lookup() {
    let store = Store::open_in_memory().unwrap();

    store
      .context(|ctx| {
        ctx.save(&item_row("po-1", "a"))?;
        ctx.save(&item_row("po-1", "b"))?;
        ctx.save(&item_row("po-2", "c"))
      })
      .unwrap();

    let rows: Vec<ResultItemRow> = store
      .context(|ctx| ctx.load_by_index("po-1"))
      .unwrap();
    assert_eq!(rows.len(), 2);

    let one: Option<ResultItemRow> = store
      .context(|ctx| ctx.load(&RecordKey::Composite("po-2".into(), "c".into())))
      .unwrap();
    assert_eq!(one.unwrap().item.id, "c");
  }

  #[test]
  fn test_delete_all_with_predicate_returns_count() {
    let store = Store::open_in_memory().unwrap();

    store
      .context(|ctx| {
        ctx.save(&item_row("po-1", "a"))?;
        ctx.save(&item_row("po-1", "b"))?;
        ctx.save(&item_row("po-2", "keep"))
      })
      .unwrap();

    let deleted = store
      .context(|ctx| ctx.delete_by_index::<ResultItemRow>("po-1", |_| true))
      .unwrap();
    assert_eq!(deleted, 2);

    let remaining = store
      .context(|ctx| ctx.count(Collection::QueryResults))
      .unwrap();
    assert_eq!(remaining, 1);
  }

  #[test]
  fn test_changes_assign_increasing_sequences() {
    let store = Store::open_in_memory().unwrap();

    let (first, second) = store
      .context(|ctx| {
        let mut first = ChangeRow {
          sequence: None,
          object_id: Some("obj-1".into()),
          change_type: ChangeType::New,
          data: None,
        };
        ctx.add(&mut first)?;
        let mut second = ChangeRow {
          sequence: None,
          object_id: Some("obj-2".into()),
          change_type: ChangeType::Update,
          data: None,
        };
        ctx.add(&mut second)?;
        Ok((first.sequence.unwrap(), second.sequence.unwrap()))
      })
      .unwrap();

    assert!(second > first);

    let all: Vec<ChangeRow> = store.context(|ctx| ctx.load_all()).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].sequence, Some(first));
  }

  #[test]
  fn test_request_rows_load_by_well_known_name() {
    let store = Store::open_in_memory().unwrap();

    store
      .context(|ctx| {
        ctx.save(&RequestRow {
          name: "GetClientData".into(),
          response: serde_json::json!({"languages": []}),
        })
      })
      .unwrap();

    let row: Option<RequestRow> = store
      .context(|ctx| ctx.load(&RecordKey::Single("GetClientData".into())))
      .unwrap();
    assert!(row.unwrap().response.get("languages").is_some());
  }
}
