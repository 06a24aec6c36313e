//! Typed rows for the store's collections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Collection, RecordKey, StoreRecord};
use crate::service::types::{QueryDto, ResultItemDto};

/// A flattened query description. `has_results` records whether the query
/// carried rows when it was imported; the rows themselves live in the
/// query-results collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRow {
  pub has_results: String,
  #[serde(flatten)]
  pub query: QueryDto,
}

impl QueryRow {
  pub fn has_results(&self) -> bool {
    self.has_results == "true"
  }
}

impl StoreRecord for QueryRow {
  const COLLECTION: Collection = Collection::Queries;

  fn record_key(&self) -> RecordKey {
    RecordKey::Single(self.query.id.clone())
  }

  fn index_value(&self) -> Option<String> {
    Some(self.query.persistent_object.id.clone())
  }
}

/// One result row, keyed by (owning persistent-object id, item id).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItemRow {
  pub persistent_object_id: String,
  pub item: ResultItemDto,
}

impl StoreRecord for ResultItemRow {
  const COLLECTION: Collection = Collection::QueryResults;

  fn record_key(&self) -> RecordKey {
    RecordKey::Composite(self.persistent_object_id.clone(), self.item.id.clone())
  }

  fn index_value(&self) -> Option<String> {
    Some(self.persistent_object_id.clone())
  }
}

/// Maps a query id or persistent-object id to the entity-type name used to
/// select a resolver. Ids alone do not reveal which resolver applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionClassRow {
  pub id: String,
  pub name: String,
}

impl StoreRecord for ActionClassRow {
  const COLLECTION: Collection = Collection::ActionClasses;

  fn record_key(&self) -> RecordKey {
    RecordKey::Single(self.id.clone())
  }
}

/// Kind of a journaled local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
  New,
  Update,
  Delete,
}

/// A pending local mutation, journaled for later replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
  /// Assigned by the store on insert.
  #[serde(skip)]
  pub sequence: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub object_id: Option<String>,
  pub change_type: ChangeType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

impl StoreRecord for ChangeRow {
  const COLLECTION: Collection = Collection::Changes;

  fn record_key(&self) -> RecordKey {
    RecordKey::Sequence(self.sequence)
  }

  fn assign_sequence(&mut self, sequence: i64) {
    self.sequence = Some(sequence);
  }
}

/// The last successful response body for a well-known request, stored
/// verbatim as a last-resort fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRow {
  pub name: String,
  pub response: Value,
}

impl StoreRecord for RequestRow {
  const COLLECTION: Collection = Collection::Requests;

  fn record_key(&self) -> RecordKey {
    RecordKey::Single(self.name.clone())
  }
}
