//! Wire types for the portal service protocol.
//!
//! Every type carries a flattened `extra` map, so fields this engine does not
//! interpret survive a store round-trip verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope returned by the GetApplication operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationResponse {
  pub application: PersistentObjectDto,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub auth_token: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A single remote entity instance with typed attributes, actions and
/// zero or more nested queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentObjectDto {
  pub id: String,
  #[serde(rename = "type", default)]
  pub type_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub object_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub breadcrumb: Option<String>,
  #[serde(default)]
  pub is_new: bool,
  #[serde(default)]
  pub actions: Vec<String>,
  #[serde(default)]
  pub attributes: Vec<AttributeDto>,
  #[serde(default)]
  pub queries: Vec<QueryDto>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl PersistentObjectDto {
  /// Find an attribute by name.
  #[allow(dead_code)]
  pub fn attribute(&self, name: &str) -> Option<&AttributeDto> {
    self.attributes.iter().find(|a| a.name == name)
  }
}

/// A named, columnar result set bound to a persistent-object type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDto {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(default)]
  pub auto_query: bool,
  /// Description of the persistent-object type this query's rows belong to.
  pub persistent_object: Box<PersistentObjectDto>,
  #[serde(default)]
  pub columns: Vec<ColumnDto>,
  #[serde(default)]
  pub actions: Vec<String>,
  #[serde(default)]
  pub sort_options: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub filters: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<QueryResultDto>,
  /// Template for objects created through this query, when the service
  /// provides one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_persistent_object: Option<Box<PersistentObjectDto>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// One column of a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDto {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(rename = "type", default)]
  pub type_name: String,
  #[serde(default)]
  pub can_filter: bool,
  #[serde(default)]
  pub can_group_by: bool,
  #[serde(default)]
  pub can_list_distincts: bool,
  #[serde(default)]
  pub can_sort: bool,
  /// Target persistent-object type, present on reference-typed columns.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub persistent_object_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// The result set carried inside a freshly executed query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultDto {
  #[serde(default)]
  pub columns: Vec<ColumnDto>,
  #[serde(default)]
  pub items: Vec<ResultItemDto>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sort_options: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// One record of a query's result set, stored as a set of named values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItemDto {
  pub id: String,
  #[serde(default)]
  pub values: Vec<ItemValueDto>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ResultItemDto {
  /// The raw value stored under `key`, if any.
  pub fn value(&self, key: &str) -> Option<&str> {
    self
      .values
      .iter()
      .find(|v| v.key == key)
      .and_then(|v| v.value.as_deref())
  }

  /// The referenced object id stored under `key`, falling back to the raw
  /// value for services that only send the id as the display value.
  pub fn reference_id(&self, key: &str) -> Option<&str> {
    self
      .values
      .iter()
      .find(|v| v.key == key)
      .and_then(|v| v.object_id.as_deref().or(v.value.as_deref()))
  }
}

/// A single named value of a result item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemValueDto {
  pub key: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
  /// Set for reference-typed values.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub object_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// One typed attribute of a persistent object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDto {
  pub name: String,
  #[serde(rename = "type", default)]
  pub type_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
  #[serde(default)]
  pub is_value_changed: bool,
  #[serde(default)]
  pub is_read_only: bool,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Numeric wire types, compared by parsed value rather than as text.
pub fn is_numeric_type(type_name: &str) -> bool {
  matches!(
    type_name,
    "Byte"
      | "SByte"
      | "Int16"
      | "UInt16"
      | "Int32"
      | "UInt32"
      | "Int64"
      | "UInt64"
      | "Single"
      | "Double"
      | "Decimal"
      | "Currency"
  )
}

/// Date and time wire types, compared chronologically.
pub fn is_date_time_type(type_name: &str) -> bool {
  matches!(
    type_name,
    "Date" | "DateTime" | "DateTimeOffset" | "Time" | "NullableDate" | "NullableDateTime"
  )
}
