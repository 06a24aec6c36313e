//! Interception layer in front of every outbound service call.
//!
//! Wraps the network client with the same API and decides, per call,
//! whether to go to the network, fall back to the offline store, or hand
//! the call to a per-entity-type resolver. A call's own network attempt
//! always precedes its own fallback attempt; separate calls are
//! independent.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::offline::assets::{AssetCache, CachedAsset};
use crate::offline::flattener;
use crate::offline::registry::ResolverRegistry;
use crate::offline::resolver::ResultInclusion;
use crate::service::client::ServiceClient;
use crate::service::types::{
  ApplicationResponse, PersistentObjectDto, QueryDto, QueryResultDto, ResultItemDto,
};
use crate::store::records::RequestRow;
use crate::store::{RecordKey, Store};

/// Well-known request-cache keys.
pub const REQUEST_CLIENT_DATA: &str = "GetClientData";
pub const REQUEST_APPLICATION: &str = "GetApplication";

pub struct Dispatcher {
  client: ServiceClient,
  store: Arc<Store>,
  registry: Arc<ResolverRegistry>,
  assets: Arc<AssetCache>,
  manifest: Vec<String>,
  shell: Option<String>,
}

impl Dispatcher {
  /// Create a dispatcher with its store and asset cache at the configured
  /// locations.
  pub fn new(config: &Config, registry: Arc<ResolverRegistry>) -> Result<Self> {
    let client = ServiceClient::new(config)?;
    let store = Arc::new(Store::open(&config.offline.store_path()?)?);
    let assets = Arc::new(AssetCache::open(
      &config.offline.assets_path()?,
      &config.offline.asset_version,
    )?);

    Ok(Self::with_components(
      client,
      store,
      registry,
      assets,
      config.offline.asset_manifest.clone(),
      config.offline.shell.clone(),
    ))
  }

  /// Assemble a dispatcher from already-built components.
  pub fn with_components(
    client: ServiceClient,
    store: Arc<Store>,
    registry: Arc<ResolverRegistry>,
    assets: Arc<AssetCache>,
    manifest: Vec<String>,
    shell: Option<String>,
  ) -> Self {
    Self {
      client,
      store,
      registry,
      assets,
      manifest,
      shell,
    }
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.store
  }

  /// Offline reconstruction of entity calls is engaged only once the host
  /// has registered some non-default behavior.
  fn offline_enabled(&self) -> bool {
    self.registry.has_custom_resolvers()
  }

  /// Bootstrap client data: network first, last persisted response as the
  /// fallback.
  pub async fn get_client_data(&self) -> Result<Value> {
    match self.client.get_client_data().await {
      Ok(data) => {
        self.store.context(|ctx| {
          ctx.save(&RequestRow {
            name: REQUEST_CLIENT_DATA.to_string(),
            response: data.clone(),
          })
        })?;
        Ok(data)
      }
      Err(err) => {
        debug!(error = %err, "GetClientData failed, serving persisted response");
        let row = self.store.context(|ctx| {
          ctx.load::<RequestRow>(&RecordKey::Single(REQUEST_CLIENT_DATA.to_string()))
        })?;
        row.map(|r| r.response).ok_or_else(service_unavailable)
      }
    }
  }

  /// The application snapshot. A network success is persisted verbatim and
  /// flattened into the store as the new offline generation.
  pub async fn get_application(&self) -> Result<ApplicationResponse> {
    match self.client.get_application().await {
      Ok(raw) => {
        let application: ApplicationResponse = serde_json::from_value(raw.clone())
          .map_err(|e| eyre!("Failed to parse GetApplication response: {}", e))?;
        self.store.context(|ctx| {
          ctx.save(&RequestRow {
            name: REQUEST_APPLICATION.to_string(),
            response: raw,
          })
        })?;
        flattener::persist_snapshot(&self.store, &application)?;
        Ok(application)
      }
      Err(err) => {
        if !self.offline_enabled() {
          return Err(err);
        }
        warn!(error = %err, "GetApplication failed, serving persisted response");
        let row = self.store.context(|ctx| {
          ctx.load::<RequestRow>(&RecordKey::Single(REQUEST_APPLICATION.to_string()))
        })?;
        match row {
          Some(row) => serde_json::from_value(row.response)
            .map_err(|e| eyre!("Failed to parse persisted application: {}", e)),
          None => Err(service_unavailable()),
        }
      }
    }
  }

  pub async fn get_query(&self, id: &str) -> Result<QueryDto> {
    match self.client.get_query(id).await {
      Ok(Some(query)) => Ok(query),
      Ok(None) if self.offline_enabled() => self.resolve_query_offline(id),
      Ok(None) => Err(eyre!("GetQuery returned no result")),
      Err(err) if self.offline_enabled() => {
        debug!(error = %err, id, "GetQuery failed, resolving offline");
        self.resolve_query_offline(id)
      }
      Err(err) => Err(err),
    }
  }

  fn resolve_query_offline(&self, id: &str) -> Result<QueryDto> {
    self.store.context(|ctx| {
      let resolver = self
        .registry
        .resolve(ctx, id)?
        .ok_or_else(service_unavailable)?;
      resolver
        .resolve_query(ctx, id, ResultInclusion::IfAutoQuery)?
        .ok_or_else(service_unavailable)
    })
  }

  pub async fn get_persistent_object(
    &self,
    type_id: &str,
    object_id: Option<&str>,
    is_new: bool,
  ) -> Result<PersistentObjectDto> {
    match self
      .client
      .get_persistent_object(type_id, object_id, is_new)
      .await
    {
      Ok(Some(object)) => Ok(object),
      Ok(None) if self.offline_enabled() => {
        self.resolve_persistent_object_offline(type_id, object_id, is_new)
      }
      Ok(None) => Err(eyre!("GetPersistentObject returned no result")),
      Err(err) if self.offline_enabled() => {
        debug!(error = %err, type_id, "GetPersistentObject failed, resolving offline");
        self.resolve_persistent_object_offline(type_id, object_id, is_new)
      }
      Err(err) => Err(err),
    }
  }

  fn resolve_persistent_object_offline(
    &self,
    type_id: &str,
    object_id: Option<&str>,
    is_new: bool,
  ) -> Result<PersistentObjectDto> {
    self.store.context(|ctx| {
      let resolver = self
        .registry
        .resolve(ctx, type_id)?
        .ok_or_else(service_unavailable)?;
      resolver
        .resolve_persistent_object(ctx, None, type_id, object_id.unwrap_or_default(), is_new)?
        .ok_or_else(service_unavailable)
    })
  }

  pub async fn execute_query(
    &self,
    query: &QueryDto,
    parent: Option<&PersistentObjectDto>,
  ) -> Result<QueryResultDto> {
    match self.client.execute_query(query, parent).await {
      Ok(Some(result)) => Ok(result),
      Ok(None) if self.offline_enabled() => self.execute_query_offline(query, parent),
      Ok(None) => Err(eyre!("ExecuteQuery returned no result")),
      Err(err) if self.offline_enabled() => {
        debug!(error = %err, query = %query.id, "ExecuteQuery failed, resolving offline");
        self.execute_query_offline(query, parent)
      }
      Err(err) => Err(err),
    }
  }

  fn execute_query_offline(
    &self,
    query: &QueryDto,
    parent: Option<&PersistentObjectDto>,
  ) -> Result<QueryResultDto> {
    self.store.context(|ctx| {
      let resolver = self
        .registry
        .resolve(ctx, &query.id)?
        .ok_or_else(service_unavailable)?;
      let items = resolver.resolve_query_results(ctx, query, parent)?;
      Ok(QueryResultDto {
        columns: query.columns.clone(),
        items,
        sort_options: Some(query.sort_options.clone()),
        extra: Default::default(),
      })
    })
  }

  pub async fn execute_action(
    &self,
    action: &str,
    parent: Option<&PersistentObjectDto>,
    query: Option<&QueryDto>,
    selected_items: &[ResultItemDto],
    parameters: Option<Value>,
  ) -> Result<Option<PersistentObjectDto>> {
    match self
      .client
      .execute_action(action, parent, query, selected_items, parameters)
      .await
    {
      Ok(result) => Ok(result),
      Err(err) if self.offline_enabled() => {
        debug!(error = %err, action, "ExecuteAction failed, resolving offline");
        self.execute_action_offline(action, parent, query, selected_items)
      }
      Err(err) => Err(err),
    }
  }

  fn execute_action_offline(
    &self,
    action: &str,
    parent: Option<&PersistentObjectDto>,
    query: Option<&QueryDto>,
    selected_items: &[ResultItemDto],
  ) -> Result<Option<PersistentObjectDto>> {
    let name = action.rsplit('.').next().unwrap_or(action);

    self.store.context(|ctx| {
      let target = query
        .map(|q| q.persistent_object.id.as_str())
        .or(parent.map(|p| p.id.as_str()))
        .ok_or_else(|| eyre!("ExecuteAction {} carries no target", action))?;
      let resolver = self
        .registry
        .resolve(ctx, target)?
        .ok_or_else(service_unavailable)?;

      match name {
        "Save" => {
          let parent = parent.ok_or_else(|| eyre!("Save without an object"))?;
          resolver.save_persistent_object(ctx, parent).map(Some)
        }
        "New" => {
          let query = query.ok_or_else(|| eyre!("New without a query"))?;
          resolver.resolve_new(ctx, query).map(Some)
        }
        "Delete" => {
          let query = query.ok_or_else(|| eyre!("Delete without a query"))?;
          resolver.resolve_delete(ctx, query, selected_items)?;
          Ok(None)
        }
        other => Err(eyre!("Offline {} is not supported", other)),
      }
    })
  }

  /// Anything that is not one of the service operations: serve from the
  /// asset cache, else the network (caching opportunistically), else the
  /// application shell for offline navigations under the service root.
  pub async fn fetch(&self, url: &str) -> Result<CachedAsset> {
    if let Some(asset) = self.assets.lookup(url)? {
      return Ok(asset);
    }

    match self.fetch_network(url).await {
      Ok(asset) => {
        self
          .assets
          .store(&asset.url, asset.content_type.as_deref(), &asset.body)?;
        if asset.url != url && same_origin(&asset.url, url) {
          self.assets.store_redirect(url, &asset.url)?;
        }
        Ok(asset)
      }
      Err(err) => {
        debug!(url, error = %err, "Network fetch failed");
        if self.is_shell_navigation(url) {
          if let Some(shell_url) = &self.shell {
            if let Some(shell) = self.assets.lookup(shell_url)? {
              return Ok(shell);
            }
          }
        }
        Err(service_unavailable())
      }
    }
  }

  async fn fetch_network(&self, url: &str) -> Result<CachedAsset> {
    let response = self
      .client
      .http()
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("{} not available: {}", url, e))?;

    let final_url = response.url().to_string();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read {}: {}", url, e))?
      .to_vec();

    Ok(CachedAsset {
      url: final_url,
      content_type,
      body,
    })
  }

  /// A document navigation under the service root, the case where the
  /// cached application shell still makes deep links load offline.
  fn is_shell_navigation(&self, url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
      return false;
    };
    if !parsed.as_str().starts_with(self.client.base().as_str()) {
      return false;
    }
    parsed
      .path()
      .rsplit('/')
      .next()
      .map(|last| !last.contains('.'))
      .unwrap_or(true)
  }

  /// Install the configured asset manifest and activate the current
  /// generation.
  pub async fn install_assets(&self) -> Result<usize> {
    let installed = self
      .assets
      .install(self.client.http(), self.client.base(), &self.manifest)
      .await?;
    self.assets.activate()?;
    Ok(installed)
  }
}

fn service_unavailable() -> color_eyre::Report {
  eyre!("Service unavailable")
}

fn same_origin(a: &str, b: &str) -> bool {
  match (Url::parse(a), Url::parse(b)) {
    (Ok(a), Ok(b)) => {
      a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port() == b.port()
    }
    _ => false,
  }
}
