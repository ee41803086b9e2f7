use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Congregation whose records are synchronized
  pub congregation_id: Option<String>,
  /// Signed-in publisher, used for per-day scopes
  pub user_id: Option<String>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the hosted backend (e.g. https://xyz.supabase.co)
  pub url: String,
  /// Realtime websocket endpoint; derived from `url` when unset
  pub realtime_url: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Quiet period before a burst of change signals becomes one fetch
  pub debounce_ms: u64,
  /// Delay before the single queued refetch runs
  pub requeue_delay_ms: u64,
  /// Age after which cached detail records are refreshed
  pub stale_secs: i64,
  /// Remote tables whose change notifications trigger a refetch
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub watched_tables: BTreeSet<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 400,
      requeue_delay_ms: 250,
      stale_secs: 300,
      watched_tables: ["establishments", "visits"]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }
}

impl SyncConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn requeue_delay(&self) -> Duration {
    Duration::from_millis(self.requeue_delay_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file for cache, ledgers and outbox (defaults to the data directory)
  pub path: Option<PathBuf>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Websocket endpoint for change notifications.
  pub fn realtime_url(&self) -> String {
    if let Some(url) = &self.remote.realtime_url {
      return url.clone();
    }
    let base = self.remote.url.trim_end_matches('/');
    let base = base
      .strip_prefix("https://")
      .map(|rest| format!("wss://{}", rest))
      .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{}", rest)))
      .unwrap_or_else(|| base.to_string());
    format!("{}/realtime/v1/websocket", base)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks FIELDSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("FIELDSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set FIELDSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Signed-in session token, if any. Requests fall back to the API key.
  pub fn get_access_token() -> Option<String> {
    std::env::var("FIELDSYNC_ACCESS_TOKEN").ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("remote:\n  url: https://abc.supabase.co\n").unwrap();
    assert_eq!(config.remote.timeout_secs, 15);
    assert_eq!(config.sync.debounce(), Duration::from_millis(400));
    assert!(config.sync.watched_tables.contains("establishments"));
    assert!(config.congregation_id.is_none());
    assert_eq!(
      config.realtime_url(),
      "wss://abc.supabase.co/realtime/v1/websocket"
    );
  }

  #[test]
  fn test_watched_tables_are_lowercased() {
    let config = Config::from_yaml(
      "remote:\n  url: http://localhost:54321/\ncongregation_id: c1\nsync:\n  debounce_ms: 100\n  watched_tables: [Visits]\n",
    )
    .unwrap();
    assert_eq!(config.sync.debounce_ms, 100);
    assert_eq!(config.sync.requeue_delay_ms, 250);
    assert_eq!(
      config.sync.watched_tables.iter().collect::<Vec<_>>(),
      vec!["visits"]
    );
    assert_eq!(
      config.realtime_url(),
      "ws://localhost:54321/realtime/v1/websocket"
    );
  }
}
