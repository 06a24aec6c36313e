use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub service: ServiceConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Root URL of the portal service; all operations live under it.
  pub url: String,
  pub user_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// Override for the directory holding the store, asset cache and logs.
  pub data_dir: Option<PathBuf>,
  /// Version tag of the currently packaged asset generation.
  pub asset_version: String,
  /// Relative URLs cached verbatim during installation (built at packaging
  /// time).
  pub asset_manifest: Vec<String>,
  /// Application shell document served for offline navigations.
  pub shell: Option<String>,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      data_dir: None,
      asset_version: "1".to_string(),
      asset_manifest: Vec::new(),
      shell: None,
    }
  }
}

impl OfflineConfig {
  /// The directory holding the offline databases.
  pub fn data_dir(&self) -> Result<PathBuf> {
    let dir = match &self.data_dir {
      Some(dir) => dir.clone(),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .ok_or_else(|| eyre!("Could not determine data directory"))?
        .join("ombra"),
    };
    Ok(dir)
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("offline.db"))
  }

  pub fn assets_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("assets.db"))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ombra.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ombra/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ombra/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ombra.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ombra").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the service auth token from environment variables.
  ///
  /// Checks OMBRA_SERVICE_TOKEN first, then SERVICE_AUTH_TOKEN as fallback.
  pub fn get_service_token() -> Result<String> {
    std::env::var("OMBRA_SERVICE_TOKEN")
      .or_else(|_| std::env::var("SERVICE_AUTH_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Service token not found. Set OMBRA_SERVICE_TOKEN or SERVICE_AUTH_TOKEN environment variable."
        )
      })
  }
}
