use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Cap on snapshots folded per merge; the earliest versions are kept.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    #[serde(default = "default_max_structural_input_bytes")]
    pub max_structural_input_bytes: usize,
    #[serde(default = "default_diff_context_lines")]
    pub diff_context_lines: usize,
    /// 0 disables the deadline.
    #[serde(default = "default_diff_timeout_ms")]
    pub diff_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
            max_structural_input_bytes: default_max_structural_input_bytes(),
            diff_context_lines: default_diff_context_lines(),
            diff_timeout_ms: default_diff_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub file_name: String,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Mirror events to stderr.
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            file_name: default_log_file(),
            rotation: LogRotation::default(),
            console: true,
        }
    }
}

fn default_max_snapshots() -> usize {
    500
}
fn default_max_structural_input_bytes() -> usize {
    256 * 1024
}
fn default_diff_context_lines() -> usize {
    3
}
fn default_diff_timeout_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    30
}
fn default_max_entries() -> usize {
    1024
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".overlay/store")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from(".overlay/logs")
}
fn default_log_file() -> String {
    "overlay.log".to_string()
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.engine.max_snapshots, 500);
        assert_eq!(settings.engine.max_structural_input_bytes, 262_144);
        assert_eq!(settings.engine.diff_context_lines, 3);
        assert!(settings.cache.enabled);
        assert_eq!(settings.cache.ttl_secs, 30);
        assert_eq!(settings.store.data_dir, PathBuf::from(".overlay/store"));
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.file_name, "overlay.log");
        assert_eq!(settings.logging.rotation, LogRotation::Never);
        assert!(settings.logging.console);
    }

    #[test]
    fn test_partial_override() {
        let settings: Settings =
            serde_json::from_str(r#"{"cache":{"enabled":false},"engine":{"max_snapshots":10}}"#)
                .unwrap();
        assert!(!settings.cache.enabled);
        assert_eq!(settings.cache.max_entries, 1024);
        assert_eq!(settings.engine.max_snapshots, 10);
        assert_eq!(settings.engine.diff_timeout_ms, 2000);

        let settings: Settings =
            serde_json::from_str(r#"{"logging":{"level":"debug","rotation":"daily"}}"#).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.rotation, LogRotation::Daily);
        assert_eq!(settings.logging.dir, PathBuf::from(".overlay/logs"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/settings.json");
        assert_eq!(Settings::load_or_default(&path).unwrap().cache.ttl_secs, 30);

        let mut settings = Settings::default();
        settings.cache.ttl_secs = 5;
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap().cache.ttl_secs, 5);
    }
}
