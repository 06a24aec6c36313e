//! Resolver registration and lookup.
//!
//! The host application registers a factory per entity-type name before
//! first use. Lookups accept either a bare type name or an object/query id;
//! ids are translated through the action-class collection first. Resolved
//! instances are cached for the life of the process, including the
//! "no custom resolver" outcome, so repeated lookups never re-run a factory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::resolver::{DefaultResolver, Resolver};
use crate::store::records::ActionClassRow;
use crate::store::{RecordKey, StoreContext};

type ResolverFactory = Box<dyn Fn() -> Arc<dyn Resolver> + Send + Sync>;

pub struct ResolverRegistry {
  factories: Mutex<HashMap<String, ResolverFactory>>,
  resolved: Mutex<HashMap<String, Option<Arc<dyn Resolver>>>>,
  fallback: Arc<dyn Resolver>,
}

impl Default for ResolverRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ResolverRegistry {
  pub fn new() -> Self {
    Self {
      factories: Mutex::new(HashMap::new()),
      resolved: Mutex::new(HashMap::new()),
      fallback: Arc::new(DefaultResolver),
    }
  }

  /// Register a resolver factory for an entity-type name. Must happen
  /// before the first lookup of that name; later registrations do not
  /// invalidate already-cached instances.
  pub fn register(
    &self,
    type_name: impl Into<String>,
    factory: impl Fn() -> Arc<dyn Resolver> + Send + Sync + 'static,
  ) -> Result<()> {
    self
      .factories
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(type_name.into(), Box::new(factory));
    Ok(())
  }

  /// Whether the host registered any non-default offline behavior.
  pub fn has_custom_resolvers(&self) -> bool {
    self
      .factories
      .lock()
      .map(|factories| !factories.is_empty())
      .unwrap_or(false)
  }

  /// Resolve an entity-type name or an object/query id to a resolver.
  /// Returns `None` only when an id cannot be translated to a type name;
  /// a known type without a custom registration gets the default resolver.
  pub fn resolve(
    &self,
    ctx: &StoreContext,
    name_or_id: &str,
  ) -> Result<Option<Arc<dyn Resolver>>> {
    let type_name = if is_type_name(name_or_id) {
      name_or_id.to_string()
    } else {
      match ctx.load::<ActionClassRow>(&RecordKey::Single(name_or_id.to_string()))? {
        Some(row) => row.name,
        None => {
          debug!(id = %name_or_id, "No action-class mapping, no resolver");
          return Ok(None);
        }
      }
    };

    let mut resolved = self
      .resolved
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let entry = match resolved.get(&type_name) {
      Some(cached) => cached.clone(),
      None => {
        let instance = self
          .factories
          .lock()
          .map_err(|e| eyre!("Lock poisoned: {}", e))?
          .get(&type_name)
          .map(|factory| factory());
        resolved.insert(type_name.clone(), instance.clone());
        instance
      }
    };

    Ok(Some(entry.unwrap_or_else(|| self.fallback.clone())))
  }
}

/// A bare entity-type name is a plain identifier; anything else (ids carry
/// dashes or other separators) goes through the action-class translation.
fn is_type_name(input: &str) -> bool {
  !input.is_empty()
    && input
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Store;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FilteringResolver;

  impl Resolver for FilteringResolver {
    fn supports_filtering(&self) -> bool {
      true
    }
  }

  #[test]
  fn test_type_name_detection() {
    assert!(is_type_name("Customer"));
    assert!(is_type_name("Customer_Order2"));
    assert!(is_type_name("Acme.Customer"));
    assert!(!is_type_name("b0a2-44cd-9a09"));
    assert!(!is_type_name(""));
  }

  #[test]
  fn test_unknown_name_falls_back_to_default() {
    let store = Store::open_in_memory().unwrap();
    let registry = ResolverRegistry::new();

    let resolver = store
      .context(|ctx| registry.resolve(ctx, "Customer"))
      .unwrap()
      .unwrap();
    assert!(!resolver.supports_filtering());
  }

  #[test]
  fn test_custom_resolver_found_by_id_translation() {
    let store = Store::open_in_memory().unwrap();
    store
      .context(|ctx| {
        ctx.save(&ActionClassRow {
          id: "1a2b-3c4d".into(),
          name: "Customer".into(),
        })
      })
      .unwrap();

    let registry = ResolverRegistry::new();
    registry
      .register("Customer", || Arc::new(FilteringResolver))
      .unwrap();

    let resolver = store
      .context(|ctx| registry.resolve(ctx, "1a2b-3c4d"))
      .unwrap()
      .unwrap();
    assert!(resolver.supports_filtering());
  }

  #[test]
  fn test_untranslatable_id_is_no_resolver() {
    let store = Store::open_in_memory().unwrap();
    let registry = ResolverRegistry::new();

    let resolver = store
      .context(|ctx| registry.resolve(ctx, "dead-beef"))
      .unwrap();
    assert!(resolver.is_none());
  }

  #[test]
  fn test_factory_runs_once_per_type() {
    let store = Store::open_in_memory().unwrap();
    let registry = ResolverRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    registry
      .register("Customer", move || {
        counted.fetch_add(1, Ordering::SeqCst);
        Arc::new(FilteringResolver)
      })
      .unwrap();

    store
      .context(|ctx| {
        registry.resolve(ctx, "Customer")?;
        registry.resolve(ctx, "Customer")
      })
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_has_custom_resolvers() {
    let registry = ResolverRegistry::new();
    assert!(!registry.has_custom_resolvers());
    registry
      .register("Customer", || Arc::new(FilteringResolver))
      .unwrap();
    assert!(registry.has_custom_resolvers());
  }
}
