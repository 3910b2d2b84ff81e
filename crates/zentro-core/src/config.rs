use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod paths {
    //! Path resolution for Zentro configuration and data directories.
    //!
    //! ZENTRO_HOME resolution order:
    //! 1. ZENTRO_HOME environment variable (if set)
    //! 2. ~/.config/zentro (default)
    //! 3. ./.zentro when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the Zentro home directory.
    pub fn zentro_home() -> PathBuf {
        if let Ok(home) = std::env::var("ZENTRO_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".zentro"),
            |h| h.join(".config").join("zentro"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        zentro_home().join("config.toml")
    }

    /// Returns the default checkpoint directory.
    pub fn checkpoints_dir() -> PathBuf {
        zentro_home().join("checkpoints")
    }
}

/// Returns the default config template with comments.
///
/// Embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Which checkpoint store backs the session interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,

    /// Checkpoint directory (defaults to `$ZENTRO_HOME/checkpoints`)
    pub dir: Option<PathBuf>,

    /// Versions kept per session key (minimum 1)
    pub retain_versions: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            dir: None,
            retain_versions: Config::DEFAULT_RETAIN_VERSIONS,
        }
    }
}

impl CheckpointConfig {
    pub fn effective_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(paths::checkpoints_dir)
    }

    pub fn effective_retain_versions(&self) -> usize {
        self.retain_versions.max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// JSON seed for the in-memory gateway; the demo data is used when unset
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is not set
    pub filter: String,

    /// Directory for daily-rolling log files
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
            dir: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tool-proposing rounds allowed per turn
    pub max_tool_iterations: usize,

    /// Timeout for a single tool call in seconds (0 disables)
    pub tool_timeout_secs: u32,

    /// Extra attempts for pure tools when the gateway is unavailable
    pub pure_tool_retries: u32,

    /// Grace period for in-flight turns on shutdown (0 waits forever)
    pub shutdown_grace_secs: u32,

    pub checkpoint: CheckpointConfig,

    pub gateway: GatewayConfig,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tool_iterations: Self::DEFAULT_MAX_TOOL_ITERATIONS,
            tool_timeout_secs: Self::DEFAULT_TOOL_TIMEOUT_SECS,
            pure_tool_retries: Self::DEFAULT_PURE_TOOL_RETRIES,
            shutdown_grace_secs: Self::DEFAULT_SHUTDOWN_GRACE_SECS,
            checkpoint: CheckpointConfig::default(),
            gateway: GatewayConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;
    const DEFAULT_TOOL_TIMEOUT_SECS: u32 = 30;
    const DEFAULT_PURE_TOOL_RETRIES: u32 = 1;
    const DEFAULT_SHUTDOWN_GRACE_SECS: u32 = 10;
    const DEFAULT_RETAIN_VERSIONS: usize = 5;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Sets one dotted key (e.g. `checkpoint.retain_versions`) in the config
    /// file, keeping comments and other values intact.
    ///
    /// The file is created from the default template if missing. The edited
    /// document must still parse as a `Config`, so unknown value types are
    /// rejected before anything is written.
    pub fn set_value(path: &Path, key: &str, raw_value: &str) -> Result<()> {
        use toml_edit::{DocumentMut, Item, Table};

        let contents = if path.exists() {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?
        } else {
            default_config_template().to_string()
        };
        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        let segments: Vec<&str> = key.split('.').collect();
        let Some((leaf, tables)) = segments.split_last() else {
            anyhow::bail!("Empty config key");
        };
        if segments.iter().any(|s| s.trim().is_empty()) {
            anyhow::bail!("Invalid config key '{key}'");
        }

        let mut table: &mut Table = doc.as_table_mut();
        for name in tables {
            let entry = table.entry(*name).or_insert(Item::Table(Table::new()));
            table = entry
                .as_table_mut()
                .with_context(|| format!("'{name}' is not a table in {}", path.display()))?;
        }
        table[*leaf] = Item::Value(parse_scalar(raw_value));

        let updated = doc.to_string();
        toml::from_str::<Config>(&updated)
            .with_context(|| format!("Invalid value for '{key}': {raw_value}"))?;

        Self::write_config(path, &updated)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        if self.tool_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.tool_timeout_secs)))
        }
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        if self.shutdown_grace_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.shutdown_grace_secs)))
        }
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

/// Interprets a command-line value as a TOML integer, bool or float, falling
/// back to a string.
fn parse_scalar(raw: &str) -> toml_edit::Value {
    if let Ok(n) = raw.parse::<i64>() {
        return n.into();
    }
    if let Ok(b) = raw.parse::<bool>() {
        return b.into();
    }
    if let Ok(f) = raw.parse::<f64>() {
        return f.into();
    }
    raw.into()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_tool_iterations, 10);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
    }

    #[test]
    fn test_template_matches_defaults() {
        let parsed: Config = toml::from_str(default_config_template()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[checkpoint]\nbackend = \"memory\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
        assert_eq!(config.checkpoint.retain_versions, 5);
        assert_eq!(config.tool_timeout_secs, 30);
    }

    #[test]
    fn test_parse_error_names_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_tool_iterations = \"lots\"").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        Config::init(&path).unwrap();
        assert!(Config::init(&path).is_err());
    }

    #[test]
    fn test_set_value_preserves_comments() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        Config::init(&path).unwrap();

        Config::set_value(&path, "checkpoint.retain_versions", "2").unwrap();
        Config::set_value(&path, "log.filter", "zentro_core=debug").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("# Versions kept per session"));
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.checkpoint.retain_versions, 2);
        assert_eq!(config.log.filter, "zentro_core=debug");
    }

    #[test]
    fn test_set_value_rejects_wrong_type() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        assert!(Config::set_value(&path, "max_tool_iterations", "many").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_zero_durations_disable() {
        let config = Config {
            tool_timeout_secs: 0,
            shutdown_grace_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.tool_timeout(), None);
        assert_eq!(config.shutdown_grace(), None);
        assert_eq!(
            Config::default().tool_timeout(),
            Some(Duration::from_secs(30))
        );
    }
}
