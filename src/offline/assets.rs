//! Static-asset cache for offline application boot.
//!
//! A deliberately simpler cache than the transactional store: flat rows
//! keyed by (version tag, URL). Installation fetches a packaged manifest of
//! relative URLs and stores each response verbatim; activation drops every
//! generation whose version tag differs from the current one.

use std::path::Path;
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use url::Url;

/// How many manifest assets are fetched concurrently during install.
const INSTALL_CONCURRENCY: usize = 4;

const ASSET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    version TEXT NOT NULL,
    url TEXT NOT NULL,
    content_type TEXT,
    body BLOB,
    redirect_to TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (version, url)
);
"#;

/// One cached asset, served as stored.
#[derive(Debug, Clone)]
pub struct CachedAsset {
  pub url: String,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

pub struct AssetCache {
  conn: Mutex<Connection>,
  version: String,
}

impl AssetCache {
  /// Open or create the asset cache at the given path.
  pub fn open(path: &Path, version: &str) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create asset cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open asset cache at {}: {}", path.display(), e))?;
    Self::with_connection(conn, version)
  }

  /// In-memory asset cache. Used by tests.
  pub fn open_in_memory(version: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory asset cache: {}", e))?;
    Self::with_connection(conn, version)
  }

  fn with_connection(conn: Connection, version: &str) -> Result<Self> {
    conn
      .execute_batch(ASSET_SCHEMA)
      .map_err(|e| eyre!("Failed to run asset cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      version: version.to_string(),
    })
  }

  /// Store an asset body under the current generation.
  pub fn store(&self, url: &str, content_type: Option<&str>, body: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO assets (version, url, content_type, body, redirect_to)
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![self.version, url, content_type, body],
      )
      .map_err(|e| eyre!("Failed to store asset {}: {}", url, e))?;

    Ok(())
  }

  /// Store a synthetic redirect entry so lookups by `from` find the asset
  /// stored under `to`.
  pub fn store_redirect(&self, from: &str, to: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO assets (version, url, content_type, body, redirect_to)
         VALUES (?1, ?2, NULL, NULL, ?3)",
        params![self.version, from, to],
      )
      .map_err(|e| eyre!("Failed to store redirect {}: {}", from, e))?;

    Ok(())
  }

  /// Look up an asset in the current generation, following at most one
  /// redirect entry.
  pub fn lookup(&self, url: &str) -> Result<Option<CachedAsset>> {
    match self.lookup_row(url)? {
      Some(Row::Asset(asset)) => Ok(Some(asset)),
      Some(Row::Redirect(target)) => match self.lookup_row(&target)? {
        Some(Row::Asset(asset)) => Ok(Some(asset)),
        _ => Ok(None),
      },
      None => Ok(None),
    }
  }

  fn lookup_row(&self, url: &str) -> Result<Option<Row>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Option<String>, Option<Vec<u8>>, Option<String>)> = conn
      .query_row(
        "SELECT content_type, body, redirect_to FROM assets WHERE version = ?1 AND url = ?2",
        params![self.version, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up asset {}: {}", url, e))?;

    Ok(row.map(|(content_type, body, redirect_to)| match redirect_to {
      Some(target) => Row::Redirect(target),
      None => Row::Asset(CachedAsset {
        url: url.to_string(),
        content_type,
        body: body.unwrap_or_default(),
      }),
    }))
  }

  /// Drop every previously cached generation whose version tag differs
  /// from the current one. Deletion failures are logged, not fatal.
  pub fn activate(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match conn.execute(
      "DELETE FROM assets WHERE version != ?1",
      params![self.version],
    ) {
      Ok(removed) => {
        debug!(removed, version = %self.version, "Activated asset generation");
        Ok(removed)
      }
      Err(err) => {
        warn!(error = %err, "Failed to remove stale asset generations");
        Ok(0)
      }
    }
  }

  /// Fetch every manifest entry (relative to `base`) and cache it. When a
  /// response's final URL differs from the requested one, the body is
  /// stored under the final URL with a redirect entry under the requested
  /// one, so later lookups by either succeed.
  pub async fn install(
    &self,
    http: &reqwest::Client,
    base: &Url,
    manifest: &[String],
  ) -> Result<usize> {
    let fetched: Vec<Result<FetchedAsset>> = stream::iter(manifest)
      .map(|entry| fetch_asset(http, base, entry))
      .buffer_unordered(INSTALL_CONCURRENCY)
      .collect()
      .await;

    let mut installed = 0usize;
    for result in fetched {
      let asset = result?;
      self.store(&asset.final_url, asset.content_type.as_deref(), &asset.body)?;
      if asset.final_url != asset.requested_url {
        self.store_redirect(&asset.requested_url, &asset.final_url)?;
      }
      installed += 1;
    }

    Ok(installed)
  }
}

enum Row {
  Asset(CachedAsset),
  Redirect(String),
}

struct FetchedAsset {
  requested_url: String,
  final_url: String,
  content_type: Option<String>,
  body: Vec<u8>,
}

async fn fetch_asset(http: &reqwest::Client, base: &Url, entry: &str) -> Result<FetchedAsset> {
  let requested = base
    .join(entry)
    .map_err(|e| eyre!("Invalid manifest entry {}: {}", entry, e))?;

  let response = http
    .get(requested.clone())
    .send()
    .await
    .map_err(|e| eyre!("Failed to fetch asset {}: {}", requested, e))?
    .error_for_status()
    .map_err(|e| eyre!("Asset {} not available: {}", requested, e))?;

  let final_url = response.url().to_string();
  let content_type = response
    .headers()
    .get(reqwest::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(String::from);
  let body = response
    .bytes()
    .await
    .map_err(|e| eyre!("Failed to read asset {}: {}", requested, e))?
    .to_vec();

  Ok(FetchedAsset {
    requested_url: requested.to_string(),
    final_url,
    content_type,
    body,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_and_lookup() {
    let cache = AssetCache::open_in_memory("1").unwrap();
    cache
      .store("https://x/app.js", Some("text/javascript"), b"alert(1)")
      .unwrap();

    let asset = cache.lookup("https://x/app.js").unwrap().unwrap();
    assert_eq!(asset.body, b"alert(1)");
    assert_eq!(asset.content_type.as_deref(), Some("text/javascript"));

    assert!(cache.lookup("https://x/missing.js").unwrap().is_none());
  }

  #[test]
  fn test_redirect_entry_resolves_to_target() {
    let cache = AssetCache::open_in_memory("1").unwrap();
    cache
      .store("https://x/app.v2.js", Some("text/javascript"), b"v2")
      .unwrap();
    cache
      .store_redirect("https://x/app.js", "https://x/app.v2.js")
      .unwrap();

    let asset = cache.lookup("https://x/app.js").unwrap().unwrap();
    assert_eq!(asset.body, b"v2");

    // Both URLs keep working.
    assert!(cache.lookup("https://x/app.v2.js").unwrap().is_some());
  }

  #[test]
  fn test_dangling_redirect_is_a_miss() {
    let cache = AssetCache::open_in_memory("1").unwrap();
    cache
      .store_redirect("https://x/app.js", "https://x/gone.js")
      .unwrap();
    assert!(cache.lookup("https://x/app.js").unwrap().is_none());
  }

  #[test]
  fn test_activate_drops_other_generations() {
    let old = AssetCache::open_in_memory("1").unwrap();
    old.store("https://x/app.js", None, b"v1").unwrap();

    // A new generation over the same connection is what an upgrade does on
    // disk; simulate it by inserting a stale row directly.
    {
      let conn = old.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO assets (version, url, body) VALUES ('0', 'https://x/old.js', x'00')",
          [],
        )
        .unwrap();
    }

    let removed = old.activate().unwrap();
    assert_eq!(removed, 1);
    assert!(old.lookup("https://x/app.js").unwrap().is_some());
  }
}
