// Configuration management for the meshbase CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshbase/config.json
// - Linux: ~/.config/meshbase/config.json
// - Windows: %APPDATA%\meshbase\config.json

use anyhow::{Context, Result};
use meshbase_core::{MeshConfig, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity announced by local nodes; generated on first load
    pub identity: Option<PeerIdentity>,

    /// Mesh timings, retry ceilings and sizing
    pub mesh: MeshConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshbase");

        // Create directory if it doesn't exist
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .mesh
                .validate()
                .context("Config file holds invalid mesh settings")?;
            Ok(config)
        } else {
            // Create default config
            let config = Config {
                identity: Some(PeerIdentity::random()),
                mesh: MeshConfig::default(),
            };
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Identity, creating one if the file predates it
    pub fn identity(&mut self) -> PeerIdentity {
        *self.identity.get_or_insert_with(PeerIdentity::random)
    }

    /// Set a mesh setting by field name. The value is parsed as JSON, so
    /// numbers and booleans are written bare.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut fields = serde_json::to_value(&self.mesh).context("Failed to serialize config")?;
        let slot = fields
            .get_mut(key)
            .with_context(|| format!("Unknown config key: {}", key))?;
        *slot = serde_json::from_str(value)
            .with_context(|| format!("Invalid value for {}: {}", key, value))?;

        let mesh: MeshConfig = serde_json::from_value(fields)
            .with_context(|| format!("Invalid value for {}: {}", key, value))?;
        mesh.validate().context("Rejected config value")?;
        self.mesh = mesh;
        Ok(())
    }

    /// Get a mesh setting by field name
    pub fn get(&self, key: &str) -> Option<String> {
        serde_json::to_value(&self.mesh)
            .ok()?
            .get(key)
            .map(|v| v.to_string())
    }

    /// All mesh settings as (key, value) pairs, sorted by key
    pub fn list(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = match serde_json::to_value(&self.mesh) {
            Ok(serde_json::Value::Object(map)) => {
                map.into_iter().map(|(k, v)| (k, v.to_string())).collect()
            }
            _ => Vec::new(),
        };
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_load_creates_file_with_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let first = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(first.identity.is_some());

        let second = Config::load_from(&path).unwrap();
        assert_eq!(first.identity, second.identity);
        assert_eq!(second.mesh, MeshConfig::default());
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();
        config.set("scan_gap_ms", "8000").unwrap();
        assert_eq!(config.get("scan_gap_ms").as_deref(), Some("8000"));
        assert_eq!(config.mesh.scan_gap_ms, 8_000);

        assert!(config.set("no_such_key", "1").is_err());
        assert!(config.set("scan_gap_ms", "soon").is_err());
        // Zero expiry fails validation and leaves the old value
        assert!(config.set("task_expiry_ms", "0").is_err());
        assert_eq!(config.mesh.task_expiry_ms, 5_000);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mesh": {"scan_peers": 0}}"#).unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_list_is_sorted() {
        let config = Config::default();
        let keys: Vec<String> = config.list().into_iter().map(|(k, _)| k).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(keys.contains(&"tie_break_salt".to_string()));
    }
}
