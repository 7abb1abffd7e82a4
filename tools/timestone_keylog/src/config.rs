use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR: &str = "data/timestone";
pub const CONFIG_FILE: &str = "keylog.json";
pub const TEXT_LOG_FILE: &str = "textlog.dat";
pub const KEY_LOG_FILE: &str = "keylog.dat";
pub const KEYWORDS_FILE: &str = "keywords.dic";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeylogConfig {
    pub text_log_path: Option<PathBuf>,
    pub key_log_path: Option<PathBuf>,
    /// Tagging timer period; 0 turns the timer off.
    pub tag_interval_ms: u64,
    /// Flush timer period; 0 turns the timer off.
    pub flush_interval_ms: u64,
    pub window_ms: u64,
    /// `word delay count` lines loaded into the keyword watch at start.
    pub keywords_path: Option<PathBuf>,
    pub keyword_delay_ms: u32,
    pub keyword_count: u32,
}

impl Default for KeylogConfig {
    fn default() -> Self {
        Self {
            text_log_path: Some(Path::new(APP_DIR).join(TEXT_LOG_FILE)),
            key_log_path: Some(Path::new(APP_DIR).join(KEY_LOG_FILE)),
            tag_interval_ms: 5_000,
            flush_interval_ms: 120_000,
            window_ms: 15_000,
            keywords_path: Some(Path::new(APP_DIR).join(KEYWORDS_FILE)),
            keyword_delay_ms: 4_000,
            keyword_count: 10,
        }
    }
}

impl KeylogConfig {
    /// A config with no log files and both timers off.
    pub fn detached() -> Self {
        Self {
            text_log_path: None,
            key_log_path: None,
            tag_interval_ms: 0,
            flush_interval_ms: 0,
            ..Self::default()
        }
    }

    pub fn tag_interval(&self) -> Duration {
        Duration::from_millis(self.tag_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub text_log_path: Option<PathBuf>,
    pub key_log_path: Option<PathBuf>,
    pub tag_interval_ms: Option<u64>,
    pub flush_interval_ms: Option<u64>,
    pub window_ms: Option<u64>,
    pub keywords_path: Option<PathBuf>,
}

pub fn load_config(base_dir: &Path, overrides: &ConfigOverrides) -> Result<KeylogConfig> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| base_dir.join(CONFIG_FILE));
    let mut config = load_or_create_config(&config_path)?;
    apply_overrides(&mut config, overrides);
    Ok(normalize_config(config))
}

pub fn load_or_create_config(path: &Path) -> Result<KeylogConfig> {
    if path.exists() {
        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        let user_value: Value =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        return refresh_config_defaults(&user_value);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let config = KeylogConfig::default();
    let payload = serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
    fs::write(path, payload).context("Failed to write config file")?;
    Ok(config)
}

fn apply_overrides(config: &mut KeylogConfig, overrides: &ConfigOverrides) {
    if let Some(path) = overrides.text_log_path.clone() {
        config.text_log_path = Some(path);
    }
    if let Some(path) = overrides.key_log_path.clone() {
        config.key_log_path = Some(path);
    }
    if let Some(tag_interval_ms) = overrides.tag_interval_ms {
        config.tag_interval_ms = tag_interval_ms;
    }
    if let Some(flush_interval_ms) = overrides.flush_interval_ms {
        config.flush_interval_ms = flush_interval_ms;
    }
    if let Some(window_ms) = overrides.window_ms {
        config.window_ms = window_ms;
    }
    if let Some(path) = overrides.keywords_path.clone() {
        config.keywords_path = Some(path);
    }
}

pub fn normalize_config(mut config: KeylogConfig) -> KeylogConfig {
    config.text_log_path = config.text_log_path.filter(|path| !is_blank(path));
    config.key_log_path = config.key_log_path.filter(|path| !is_blank(path));
    config.keywords_path = config.keywords_path.filter(|path| !is_blank(path));
    config
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}

// Keys missing from the user's file fall back to defaults.
fn refresh_config_defaults(user_value: &Value) -> Result<KeylogConfig> {
    let mut default_value = serde_json::to_value(KeylogConfig::default())
        .context("Failed to serialize default config")?;
    merge_config_value(&mut default_value, user_value);
    serde_json::from_value(default_value).context("Failed to merge config defaults")
}

fn merge_config_value(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_config_value(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target_value, source_value) => {
            *target_value = source_value.clone();
        }
    }
}
