//! Network client for the portal service.
//!
//! The wire contract is six JSON operations under the service root. Every
//! POST body carries the user name and the current authorization token; a
//! token returned by any response replaces the stored one and rides along
//! on the next call.

use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use url::Url;

use crate::config::Config;
use crate::service::types::{PersistentObjectDto, QueryDto, QueryResultDto, ResultItemDto};

#[derive(Clone)]
pub struct ServiceClient {
  http: reqwest::Client,
  base: Url,
  user_name: Option<String>,
  auth_token: Arc<Mutex<Option<String>>>,
}

impl ServiceClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.service.url)
      .map_err(|e| eyre!("Invalid service URL {}: {}", config.service.url, e))?;

    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      user_name: config.service.user_name.clone(),
      auth_token: Arc::new(Mutex::new(Config::get_service_token().ok())),
    })
  }

  /// The service root every operation lives under.
  pub fn base(&self) -> &Url {
    &self.base
  }

  /// The plain HTTP client, shared with the asset cache installer.
  pub fn http(&self) -> &reqwest::Client {
    &self.http
  }

  fn endpoint(&self, operation: &str) -> Result<Url> {
    self
      .base
      .join(operation)
      .map_err(|e| eyre!("Invalid operation {}: {}", operation, e))
  }

  fn current_token(&self) -> Option<String> {
    self.auth_token.lock().ok().and_then(|token| token.clone())
  }

  fn remember_token(&self, response: &Value) {
    if let Some(token) = response.get("authToken").and_then(Value::as_str) {
      if let Ok(mut slot) = self.auth_token.lock() {
        *slot = Some(token.to_string());
      }
    }
  }

  async fn post(&self, operation: &str, mut body: Value) -> Result<Value> {
    if let Value::Object(map) = &mut body {
      if let Some(user) = &self.user_name {
        map.insert("userName".to_string(), Value::String(user.clone()));
      }
      if let Some(token) = self.current_token() {
        map.insert("authToken".to_string(), Value::String(token));
      }
    }

    let response = self
      .http
      .post(self.endpoint(operation)?)
      .json(&body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach {}: {}", operation, e))?
      .error_for_status()
      .map_err(|e| eyre!("{} rejected: {}", operation, e))?;

    let value: Value = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", operation, e))?;

    if let Some(exception) = value.get("exception").and_then(Value::as_str) {
      if !exception.is_empty() {
        return Err(eyre!("{} failed: {}", operation, exception));
      }
    }

    self.remember_token(&value);
    Ok(value)
  }

  /// GET the bootstrap client data.
  pub async fn get_client_data(&self) -> Result<Value> {
    let response = self
      .http
      .get(self.endpoint("GetClientData")?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach GetClientData: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("GetClientData rejected: {}", e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse GetClientData response: {}", e))
  }

  /// POST GetApplication. Returns the raw body; the caller decides how much
  /// of it to interpret.
  pub async fn get_application(&self) -> Result<Value> {
    self.post("GetApplication", json!({})).await
  }

  /// POST GetQuery. `None` when the service answers without a query.
  pub async fn get_query(&self, id: &str) -> Result<Option<QueryDto>> {
    let value = self.post("GetQuery", json!({ "id": id })).await?;
    extract(&value, "query", "GetQuery")
  }

  /// POST GetPersistentObject. `None` when the service answers without a
  /// result.
  pub async fn get_persistent_object(
    &self,
    type_id: &str,
    object_id: Option<&str>,
    is_new: bool,
  ) -> Result<Option<PersistentObjectDto>> {
    let value = self
      .post(
        "GetPersistentObject",
        json!({
          "persistentObjectTypeId": type_id,
          "objectId": object_id,
          "isNew": is_new,
        }),
      )
      .await?;
    extract(&value, "result", "GetPersistentObject")
  }

  /// POST ExecuteQuery. `None` when the service answers without a result.
  pub async fn execute_query(
    &self,
    query: &QueryDto,
    parent: Option<&PersistentObjectDto>,
  ) -> Result<Option<QueryResultDto>> {
    let value = self
      .post(
        "ExecuteQuery",
        json!({ "query": query, "parent": parent }),
      )
      .await?;
    extract(&value, "result", "ExecuteQuery")
  }

  /// POST ExecuteAction. `None` when the action completes without a result
  /// object.
  pub async fn execute_action(
    &self,
    action: &str,
    parent: Option<&PersistentObjectDto>,
    query: Option<&QueryDto>,
    selected_items: &[ResultItemDto],
    parameters: Option<Value>,
  ) -> Result<Option<PersistentObjectDto>> {
    let value = self
      .post(
        "ExecuteAction",
        json!({
          "action": action,
          "parent": parent,
          "query": query,
          "selectedItems": selected_items,
          "parameters": parameters,
        }),
      )
      .await?;
    extract(&value, "result", "ExecuteAction")
  }
}

/// Pull a typed payload out of a response envelope. An absent or null key
/// is an explicit "no result", not an error.
fn extract<T: serde::de::DeserializeOwned>(
  value: &Value,
  key: &str,
  operation: &str,
) -> Result<Option<T>> {
  match value.get(key) {
    None | Some(Value::Null) => Ok(None),
    Some(payload) => serde_json::from_value(payload.clone())
      .map(Some)
      .map_err(|e| eyre!("Failed to parse {} payload: {}", operation, e)),
  }
}
