//! Per-entity-type offline resolvers.
//!
//! A resolver answers "what would the service have returned" from stored
//! rows. The trait's provided methods are the default behavior; a custom
//! resolver registered for an entity type overrides only what it needs.
//! Read reconstruction is fully implemented here; write operations beyond
//! creating new objects are type-specific and stay unimplemented until a
//! custom resolver supplies them.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::service::types::{
  is_date_time_type, is_numeric_type, AttributeDto, ColumnDto, ItemValueDto, PersistentObjectDto,
  QueryDto, QueryResultDto, ResultItemDto,
};
use crate::store::records::{ChangeRow, ChangeType, QueryRow, ResultItemRow};
use crate::store::{RecordKey, StoreContext};

/// Whether a reconstructed query gets its stored rows attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultInclusion {
  Always,
  IfAutoQuery,
  Never,
}

/// The per-entity-type resolver contract.
pub trait Resolver: Send + Sync {
  /// Custom resolvers that keep queries filterable offline return true,
  /// which preserves the Filter action during reconstruction.
  fn supports_filtering(&self) -> bool {
    false
  }

  /// Reconstruct a query description from its stored row. Offline queries
  /// are never filterable or groupable by default, so the column capability
  /// flags and any attached filters are cleared.
  fn resolve_query(
    &self,
    ctx: &StoreContext,
    id: &str,
    inclusion: ResultInclusion,
  ) -> Result<Option<QueryDto>> {
    let Some(row) = ctx.load::<QueryRow>(&RecordKey::Single(id.to_string()))? else {
      return Ok(None);
    };
    let has_results = row.has_results();
    let mut query = row.query;

    for column in &mut query.columns {
      column.can_filter = false;
      column.can_group_by = false;
      column.can_list_distincts = false;
    }
    query.filters = None;
    if !self.supports_filtering() {
      query.actions.retain(|a| a != "Filter");
    }

    let include = match inclusion {
      ResultInclusion::Always => true,
      ResultInclusion::IfAutoQuery => query.auto_query,
      ResultInclusion::Never => false,
    };
    if include {
      let items = if has_results {
        self.resolve_query_results(ctx, &query, None)?
      } else {
        Vec::new()
      };
      query.result = Some(QueryResultDto {
        columns: query.columns.clone(),
        items,
        sort_options: Some(query.sort_options.clone()),
        extra: Default::default(),
      });
    }

    Ok(Some(query))
  }

  /// Reconstruct a persistent object of the given type from its stored
  /// result row, copying matching values onto the description's attributes.
  fn resolve_persistent_object(
    &self,
    ctx: &StoreContext,
    _parent: Option<&PersistentObjectDto>,
    type_id: &str,
    object_id: &str,
    is_new: bool,
  ) -> Result<Option<PersistentObjectDto>> {
    let Some(owner) = owner_query(ctx, type_id)? else {
      return Ok(None);
    };
    let mut object = (*owner.query.persistent_object).clone();
    object.object_id = Some(object_id.to_string());
    object.is_new = is_new;

    if !is_new {
      let key = RecordKey::Composite(type_id.to_string(), object_id.to_string());
      let Some(row) = ctx.load::<ResultItemRow>(&key)? else {
        return Ok(None);
      };
      for attribute in &mut object.attributes {
        if let Some(value) = row.item.values.iter().find(|v| v.key == attribute.name) {
          attribute.value = value.value.clone();
        }
      }
    }

    if owner.query.actions.iter().any(|a| a == "BulkEdit")
      && !object.actions.iter().any(|a| a == "Edit")
    {
      object.actions.push("Edit".to_string());
    }

    if let Some(breadcrumb) = object.breadcrumb.take() {
      object.breadcrumb = Some(resolve_breadcrumb(&breadcrumb, &object.attributes));
    }

    Ok(Some(object))
  }

  /// Rows for a query. Without a master object this is every stored row of
  /// the query's persistent-object type. With a master, the query is a
  /// detail query: rows are kept when their reference-typed value points at
  /// the master object. A missing reference column degrades to an empty
  /// result, never an error.
  fn resolve_query_results(
    &self,
    ctx: &StoreContext,
    query: &QueryDto,
    master: Option<&PersistentObjectDto>,
  ) -> Result<Vec<ResultItemDto>> {
    let owner_id = query.persistent_object.id.as_str();
    let rows: Vec<ResultItemRow> = ctx.load_by_index(owner_id)?;

    let mut items: Vec<ResultItemDto> = match master {
      None => rows.into_iter().map(|r| r.item).collect(),
      Some(master) => {
        let columns = owner_query(ctx, owner_id)?
          .map(|row| row.query.columns)
          .unwrap_or_else(|| query.columns.clone());
        let Some(reference) = columns
          .iter()
          .find(|c| c.persistent_object_id.as_deref() == Some(master.id.as_str()))
        else {
          warn!(
            query = %query.name,
            master_type = %master.id,
            "No reference column onto the master type, returning an empty result"
          );
          return Ok(Vec::new());
        };
        let master_object_id = master.object_id.as_deref().unwrap_or_default();
        rows
          .into_iter()
          .filter(|r| r.item.reference_id(&reference.name) == Some(master_object_id))
          .map(|r| r.item)
          .collect()
      }
    };

    // Hide values for columns the query does not select.
    let declared: HashSet<&str> = query.columns.iter().map(|c| c.name.as_str()).collect();
    for item in &mut items {
      item.values.retain(|v| declared.contains(v.key.as_str()));
    }

    if !query.sort_options.trim().is_empty() {
      sort_query_result(&mut items, &query.sort_options, &query.columns);
    }

    Ok(items)
  }

  /// Creating objects offline is type-specific.
  fn resolve_new(&self, _ctx: &StoreContext, _query: &QueryDto) -> Result<PersistentObjectDto> {
    Err(unsupported("New"))
  }

  /// Deleting rows offline is type-specific.
  fn resolve_delete(
    &self,
    _ctx: &StoreContext,
    _query: &QueryDto,
    _items: &[ResultItemDto],
  ) -> Result<usize> {
    Err(unsupported("Delete"))
  }

  /// Saving changes to an existing object offline is type-specific.
  fn resolve_save(
    &self,
    _ctx: &StoreContext,
    _object: &PersistentObjectDto,
  ) -> Result<PersistentObjectDto> {
    Err(unsupported("Save"))
  }

  /// Persist a locally created object: assign an id, store its changed
  /// attribute values as a result row and journal the creation. Existing
  /// objects are handed to [`resolve_save`](Self::resolve_save).
  fn save_persistent_object(
    &self,
    ctx: &StoreContext,
    object: &PersistentObjectDto,
  ) -> Result<PersistentObjectDto> {
    if !object.is_new {
      return self.resolve_save(ctx, object);
    }

    let mut saved = object.clone();
    let object_id = generate_object_id(&saved.id);

    let values = saved
      .attributes
      .iter()
      .filter(|a| a.is_value_changed)
      .map(|a| ItemValueDto {
        key: a.name.clone(),
        value: a.value.clone(),
        object_id: None,
        extra: Default::default(),
      })
      .collect();
    ctx.save(&ResultItemRow {
      persistent_object_id: saved.id.clone(),
      item: ResultItemDto {
        id: object_id.clone(),
        values,
        extra: Default::default(),
      },
    })?;

    let mut change = ChangeRow {
      sequence: None,
      object_id: Some(object_id.clone()),
      change_type: ChangeType::New,
      data: None,
    };
    ctx.add(&mut change)?;

    saved.object_id = Some(object_id);
    saved.is_new = false;
    for attribute in &mut saved.attributes {
      attribute.is_value_changed = false;
    }

    Ok(saved)
  }
}

/// The identity resolver: pure default behavior, used whenever no custom
/// resolver is registered for an entity type.
pub struct DefaultResolver;

impl Resolver for DefaultResolver {}

fn unsupported(operation: &str) -> color_eyre::Report {
  eyre!("Offline {} is not implemented for this entity type", operation)
}

/// The stored query owning rows of the given persistent-object type.
pub fn owner_query(ctx: &StoreContext, persistent_object_id: &str) -> Result<Option<QueryRow>> {
  Ok(
    ctx
      .load_by_index::<QueryRow>(persistent_object_id)?
      .into_iter()
      .next(),
  )
}

/// Substitute `{AttributeName}` placeholders with the attribute's current
/// value, repeating until a pass changes nothing. Placeholders without a
/// matching attribute are left as-is; revisiting an already-seen state
/// ends the loop so mutually referencing attributes cannot spin forever.
pub fn resolve_breadcrumb(template: &str, attributes: &[AttributeDto]) -> String {
  let mut seen = HashSet::new();
  let mut current = template.to_string();
  loop {
    if !seen.insert(current.clone()) {
      return current;
    }
    let next = substitute_placeholders(&current, attributes);
    if next == current {
      return current;
    }
    current = next;
  }
}

fn substitute_placeholders(input: &str, attributes: &[AttributeDto]) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(start) = rest.find('{') {
    let Some(len) = rest[start..].find('}') else {
      break;
    };
    let end = start + len;
    let name = &rest[start + 1..end];

    out.push_str(&rest[..start]);
    match attributes.iter().find(|a| a.name == name) {
      Some(attribute) => out.push_str(attribute.value.as_deref().unwrap_or("")),
      None => out.push_str(&rest[start..=end]),
    }
    rest = &rest[end + 1..];
  }

  out.push_str(rest);
  out
}

/// Direction of one sort clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
  Asc,
  Desc,
}

struct SortKey<'a> {
  column: &'a ColumnDto,
  direction: SortDirection,
}

/// Parse `"Name ASC;Age DESC"` into sort keys. Column names match
/// case-insensitively and default to ascending; clauses that match no
/// column or carry an unknown direction are skipped.
fn parse_sort_options<'a>(sort_options: &str, columns: &'a [ColumnDto]) -> Vec<SortKey<'a>> {
  sort_options
    .split(';')
    .filter_map(|clause| {
      let mut parts = clause.split_whitespace();
      let name = parts.next()?;
      let direction = match parts.next() {
        None => SortDirection::Asc,
        Some(d) if d.eq_ignore_ascii_case("asc") => SortDirection::Asc,
        Some(d) if d.eq_ignore_ascii_case("desc") => SortDirection::Desc,
        Some(_) => return None,
      };
      if parts.next().is_some() {
        return None;
      }
      let column = columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))?;
      Some(SortKey { column, direction })
    })
    .collect()
}

/// Reorder result rows in place according to a semicolon-separated sort
/// specification. The sort is stable, so rows equal under every clause keep
/// their stored order.
pub fn sort_query_result(items: &mut [ResultItemDto], sort_options: &str, columns: &[ColumnDto]) {
  let keys = parse_sort_options(sort_options, columns);
  if keys.is_empty() {
    return;
  }

  items.sort_by(|a, b| {
    for key in &keys {
      let ordering = compare_by_data_type(
        a.value(&key.column.name),
        b.value(&key.column.name),
        &key.column.type_name,
      );
      let ordering = match key.direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
      };
      if ordering != Ordering::Equal {
        return ordering;
      }
    }
    Ordering::Equal
  });
}

/// Compare two raw values according to the column's wire type: numeric and
/// date/time types by parsed value, everything else case-insensitively.
pub fn compare_by_data_type(a: Option<&str>, b: Option<&str>, type_name: &str) -> Ordering {
  if is_numeric_type(type_name) || is_date_time_type(type_name) {
    let left = numeric_value(a, type_name);
    let right = numeric_value(b, type_name);
    left.partial_cmp(&right).unwrap_or(Ordering::Equal)
  } else {
    let left = a.unwrap_or_default().to_lowercase();
    let right = b.unwrap_or_default().to_lowercase();
    left.cmp(&right)
  }
}

fn numeric_value(raw: Option<&str>, type_name: &str) -> f64 {
  let Some(raw) = raw else { return 0.0 };
  if is_date_time_type(type_name) {
    parse_timestamp(raw).unwrap_or(0.0)
  } else {
    raw.trim().parse().unwrap_or(0.0)
  }
}

fn parse_timestamp(raw: &str) -> Option<f64> {
  DateTime::parse_from_rfc3339(raw)
    .ok()
    .map(|dt| dt.timestamp_millis() as f64)
    .or_else(|| {
      NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis() as f64)
    })
    .or_else(|| {
      NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis() as f64)
    })
}

static LOCAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Ids for objects created offline, hash-derived so they cannot collide
/// with service-assigned ids.
fn generate_object_id(type_id: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(type_id.as_bytes());
  hasher.update(
    Utc::now()
      .timestamp_nanos_opt()
      .unwrap_or_default()
      .to_le_bytes(),
  );
  hasher.update(
    LOCAL_ID_COUNTER
      .fetch_add(1, AtomicOrdering::Relaxed)
      .to_le_bytes(),
  );
  hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Store;

  fn column(name: &str, type_name: &str) -> ColumnDto {
    ColumnDto {
      name: name.to_string(),
      type_name: type_name.to_string(),
      ..Default::default()
    }
  }

  fn reference_column(name: &str, target: &str) -> ColumnDto {
    ColumnDto {
      name: name.to_string(),
      type_name: "Reference".to_string(),
      persistent_object_id: Some(target.to_string()),
      ..Default::default()
    }
  }

  fn item(id: &str, values: &[(&str, &str)]) -> ResultItemDto {
    ResultItemDto {
      id: id.to_string(),
      values: values
        .iter()
        .map(|(key, value)| ItemValueDto {
          key: key.to_string(),
          value: Some(value.to_string()),
          ..Default::default()
        })
        .collect(),
      ..Default::default()
    }
  }

  fn attribute(name: &str, value: Option<&str>) -> AttributeDto {
    AttributeDto {
      name: name.to_string(),
      type_name: "String".to_string(),
      value: value.map(String::from),
      ..Default::default()
    }
  }

  fn query(id: &str, po_id: &str, columns: Vec<ColumnDto>) -> QueryDto {
    QueryDto {
      id: id.to_string(),
      name: format!("query-{}", id),
      persistent_object: Box::new(PersistentObjectDto {
        id: po_id.to_string(),
        type_name: "Test".to_string(),
        ..Default::default()
      }),
      columns,
      ..Default::default()
    }
  }

  fn seed_query(store: &Store, query: QueryDto, items: Vec<ResultItemDto>) {
    store
      .context(|ctx| {
        let owner = query.persistent_object.id.clone();
        for item in items {
          ctx.save(&ResultItemRow {
            persistent_object_id: owner.clone(),
            item,
          })?;
        }
        ctx.save(&QueryRow {
          has_results: "true".to_string(),
          query,
        })
      })
      .unwrap();
  }

  #[test]
  fn test_resolve_query_strips_capabilities_and_filter_action() {
    let store = Store::open_in_memory().unwrap();
    let mut q = query("q-1", "po-1", vec![column("Name", "String")]);
    for c in &mut q.columns {
      c.can_filter = true;
      c.can_group_by = true;
      c.can_list_distincts = true;
    }
    q.filters = Some(serde_json::json!({"name": "saved filter"}));
    q.actions = vec!["Filter".to_string(), "RefreshQuery".to_string()];
    seed_query(&store, q, vec![]);

    let resolved = store
      .context(|ctx| DefaultResolver.resolve_query(ctx, "q-1", ResultInclusion::Never))
      .unwrap()
      .unwrap();

    for c in &resolved.columns {
      assert!(!c.can_filter);
      assert!(!c.can_group_by);
      assert!(!c.can_list_distincts);
    }
    assert!(resolved.filters.is_none());
    assert_eq!(resolved.actions, vec!["RefreshQuery".to_string()]);
  }

  #[test]
  fn test_resolve_query_missing_id_is_none() {
    let store = Store::open_in_memory().unwrap();
    let resolved = store
      .context(|ctx| DefaultResolver.resolve_query(ctx, "absent", ResultInclusion::Always))
      .unwrap();
    assert!(resolved.is_none());
  }

  #[test]
  fn test_resolve_query_results_hides_undeclared_columns() {
    let store = Store::open_in_memory().unwrap();
    let q = query("q-1", "po-1", vec![column("Name", "String")]);
    seed_query(
      &store,
      q.clone(),
      vec![item("row-1", &[("Name", "Ada"), ("Secret", "hidden")])],
    );

    let items = store
      .context(|ctx| DefaultResolver.resolve_query_results(ctx, &q, None))
      .unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].value("Name"), Some("Ada"));
    assert_eq!(items[0].value("Secret"), None);
  }

  #[test]
  fn test_detail_join_keeps_only_matching_rows() {
    let store = Store::open_in_memory().unwrap();
    let detail = query(
      "q-detail",
      "po-detail",
      vec![
        column("Description", "String"),
        reference_column("Order", "po-master"),
      ],
    );
    seed_query(
      &store,
      detail.clone(),
      vec![
        item("row-1", &[("Description", "first"), ("Order", "M")]),
        item("row-2", &[("Description", "second"), ("Order", "other")]),
        item("row-3", &[("Description", "third"), ("Order", "M")]),
      ],
    );

    let master = PersistentObjectDto {
      id: "po-master".to_string(),
      object_id: Some("M".to_string()),
      ..Default::default()
    };

    let items = store
      .context(|ctx| DefaultResolver.resolve_query_results(ctx, &detail, Some(&master)))
      .unwrap();

    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["row-1", "row-3"]);
  }

  #[test]
  fn test_detail_join_without_reference_column_is_empty() {
    let store = Store::open_in_memory().unwrap();
    let detail = query("q-detail", "po-detail", vec![column("Description", "String")]);
    seed_query(
      &store,
      detail.clone(),
      vec![item("row-1", &[("Description", "first")])],
    );

    let master = PersistentObjectDto {
      id: "po-master".to_string(),
      object_id: Some("M".to_string()),
      ..Default::default()
    };

    let items = store
      .context(|ctx| DefaultResolver.resolve_query_results(ctx, &detail, Some(&master)))
      .unwrap();
    assert!(items.is_empty());
  }

  #[test]
  fn test_sort_is_stable_across_clauses() {
    let columns = vec![column("Age", "Int32"), column("Name", "String")];
    let mut items = vec![
      item("1", &[("Age", "30"), ("Name", "zoe")]),
      item("2", &[("Age", "40"), ("Name", "Ada")]),
      item("3", &[("Age", "30"), ("Name", "ada")]),
    ];

    sort_query_result(&mut items, "Age DESC;Name ASC", &columns);

    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3", "1"]);
  }

  #[test]
  fn test_sort_ignores_unparseable_clauses() {
    let columns = vec![column("Name", "String")];
    let mut items = vec![
      item("1", &[("Name", "b")]),
      item("2", &[("Name", "a")]),
    ];

    sort_query_result(&mut items, "Name SIDEWAYS;NoSuchColumn ASC;name", &columns);

    // The bad clauses are skipped, the case-insensitive "name" applies.
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "1"]);
  }

  #[test]
  fn test_compare_by_data_type_numeric_and_date() {
    assert_eq!(
      compare_by_data_type(Some("9"), Some("10"), "Int32"),
      Ordering::Less
    );
    // Text comparison would say "9" > "10".
    assert_eq!(
      compare_by_data_type(Some("9"), Some("10"), "String"),
      Ordering::Greater
    );
    assert_eq!(
      compare_by_data_type(Some("2024-01-02"), Some("2024-01-10"), "Date"),
      Ordering::Less
    );
  }

  #[test]
  fn test_breadcrumb_substitution() {
    let attributes = vec![attribute("OrderNumber", Some("42"))];
    assert_eq!(
      resolve_breadcrumb("Order {OrderNumber}", &attributes),
      "Order 42"
    );
    assert_eq!(
      resolve_breadcrumb("Order {Missing}", &attributes),
      "Order {Missing}"
    );
    assert_eq!(
      resolve_breadcrumb("{OrderNumber} / {Missing}", &attributes),
      "42 / {Missing}"
    );
  }

  #[test]
  fn test_breadcrumb_self_reference_terminates() {
    let attributes = vec![attribute("Loop", Some("{Loop}"))];
    assert_eq!(resolve_breadcrumb("{Loop}", &attributes), "{Loop}");
  }

  #[test]
  fn test_resolve_persistent_object_copies_values_and_appends_edit() {
    let store = Store::open_in_memory().unwrap();
    let mut q = query("q-1", "po-1", vec![column("Name", "String")]);
    q.actions = vec!["BulkEdit".to_string()];
    q.persistent_object.attributes = vec![attribute("Name", None)];
    q.persistent_object.breadcrumb = Some("{Name}".to_string());
    seed_query(&store, q, vec![item("row-1", &[("Name", "Ada")])]);

    let object = store
      .context(|ctx| {
        DefaultResolver.resolve_persistent_object(ctx, None, "po-1", "row-1", false)
      })
      .unwrap()
      .unwrap();

    assert_eq!(object.attribute("Name").unwrap().value.as_deref(), Some("Ada"));
    assert!(object.actions.iter().any(|a| a == "Edit"));
    assert_eq!(object.breadcrumb.as_deref(), Some("Ada"));
    assert_eq!(object.object_id.as_deref(), Some("row-1"));
  }

  #[test]
  fn test_save_new_object_creates_row_and_clears_flags() {
    let store = Store::open_in_memory().unwrap();

    let mut name = attribute("Name", Some("X"));
    name.is_value_changed = true;
    let object = PersistentObjectDto {
      id: "po-1".to_string(),
      type_name: "Customer".to_string(),
      is_new: true,
      attributes: vec![name, attribute("Untouched", None)],
      ..Default::default()
    };

    let saved = store
      .context(|ctx| DefaultResolver.save_persistent_object(ctx, &object))
      .unwrap();

    assert!(!saved.is_new);
    assert!(saved.attributes.iter().all(|a| !a.is_value_changed));
    let object_id = saved.object_id.clone().unwrap();

    let row: Option<ResultItemRow> = store
      .context(|ctx| ctx.load(&RecordKey::Composite("po-1".to_string(), object_id)))
      .unwrap();
    let row = row.unwrap();
    assert_eq!(row.item.value("Name"), Some("X"));
    assert_eq!(row.item.values.len(), 1);

    let changes: Vec<ChangeRow> = store.context(|ctx| ctx.load_all()).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::New);
  }

  #[test]
  fn test_default_write_operations_are_unsupported() {
    let store = Store::open_in_memory().unwrap();
    let q = query("q-1", "po-1", vec![]);

    let result = store.context(|ctx| DefaultResolver.resolve_new(ctx, &q));
    assert!(result.is_err());

    let existing = PersistentObjectDto {
      id: "po-1".to_string(),
      is_new: false,
      ..Default::default()
    };
    let result = store.context(|ctx| DefaultResolver.save_persistent_object(ctx, &existing));
    assert!(result.is_err());
  }
}
