//! Converts a freshly fetched application graph into store rows.
//!
//! The import is a full replace: offline mode holds exactly one generation
//! of data at a time. Each query's result rows are moved into the
//! query-results collection and the embedded row list is cleared before the
//! query row is saved, so no row is ever stored twice.

use color_eyre::Result;
use tracing::debug;

use crate::service::types::{ApplicationResponse, QueryDto};
use crate::store::records::{ActionClassRow, QueryRow, ResultItemRow};
use crate::store::{Collection, RecordKey, Store, StoreContext};

/// Persist a fetched application snapshot for offline use, replacing
/// whatever generation was stored before. One unit of work; a failure
/// leaves the previous generation intact.
pub fn persist_snapshot(store: &Store, response: &ApplicationResponse) -> Result<()> {
  store.context(|ctx| {
    ctx.clear(Collection::Queries)?;
    ctx.clear(Collection::QueryResults)?;
    ctx.clear(Collection::ActionClasses)?;
    ctx.clear(Collection::Changes)?;

    for query in &response.application.queries {
      flatten_query(ctx, query)?;
    }

    let queries = ctx.count(Collection::Queries)?;
    let rows = ctx.count(Collection::QueryResults)?;
    debug!(queries, rows, "Snapshot persisted");
    Ok(())
  })
}

/// Store one query and, depth-first, the queries nested under its
/// persistent-object description. Re-importing an already-present query id
/// is a no-op.
fn flatten_query(ctx: &StoreContext, query: &QueryDto) -> Result<()> {
  if ctx.exists(Collection::Queries, &RecordKey::Single(query.id.clone()))? {
    return Ok(());
  }

  let mut stored = query.clone();

  let items = stored.result.take().map(|r| r.items).unwrap_or_default();
  let has_results = if items.is_empty() { "false" } else { "true" };
  for item in items {
    ctx.save(&ResultItemRow {
      persistent_object_id: stored.persistent_object.id.clone(),
      item,
    })?;
  }

  // Nested queries become rows of their own rather than riding along
  // inside the stored description.
  let nested = std::mem::take(&mut stored.persistent_object.queries);

  let type_name = stored.persistent_object.type_name.clone();
  let query_id = stored.id.clone();
  let persistent_object_id = stored.persistent_object.id.clone();

  ctx.save(&QueryRow {
    has_results: has_results.to_string(),
    query: stored,
  })?;
  ctx.save(&ActionClassRow {
    id: query_id,
    name: type_name.clone(),
  })?;
  ctx.save(&ActionClassRow {
    id: persistent_object_id,
    name: type_name,
  })?;

  for nested_query in &nested {
    flatten_query(ctx, nested_query)?;
  }

  Ok(())
}
