use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    dispatcher::{DispatchPolicy, RetryPolicy},
    registry::PluginDirs,
    settings::{RawSettings, SettingValue},
};

/// Per-provider section, e.g.
///
/// ```toml
/// [providers.weatherapi]
/// enabled = true
/// cache_ttl_secs = 300
///
/// [providers.weatherapi.settings]
/// api_key = "..."
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,

    /// Overrides `default_ttl_secs` for results served by this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,

    #[serde(default)]
    pub settings: RawSettings,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: None,
            settings: RawSettings::new(),
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Providers tried, in order, when no preferred provider answers.
    pub fallback_order: Vec<String>,

    pub default_ttl_secs: u64,
    pub attempt_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub retry: RetryConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub builtin_plugin_dir: Option<PathBuf>,
    /// Defaults to `<config dir>/plugins`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_plugin_dir: Option<PathBuf>,

    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fallback_order: Vec::new(),
            default_ttl_secs: 600,
            attempt_timeout_secs: 10,
            sweep_interval_secs: 300,
            retry: RetryConfig::default(),
            builtin_plugin_dir: None,
            user_plugin_dir: None,
            providers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config from disk, or return the defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, return defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "weather-task", "weather-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Plugin directories to scan; the user directory falls back to
    /// `<config dir>/plugins`.
    pub fn plugin_dirs(&self) -> PluginDirs {
        let user = self.user_plugin_dir.clone().or_else(|| {
            Self::project_dirs()
                .ok()
                .map(|dirs| dirs.config_dir().join("plugins"))
        });

        PluginDirs {
            builtin: self.builtin_plugin_dir.clone(),
            user,
        }
    }

    /// Set/replace one provider setting. A provider configured for the first
    /// time is appended to the fallback order.
    pub fn upsert_setting(&mut self, provider: &str, key: &str, value: impl Into<SettingValue>) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .settings
            .insert(key.to_string(), value.into());

        if !self.fallback_order.iter().any(|p| p == provider) {
            self.fallback_order.push(provider.to_string());
        }
    }

    pub fn provider_settings(&self, provider: &str) -> Option<&RawSettings> {
        self.providers.get(provider).map(|cfg| &cfg.settings)
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.providers.get(provider).is_none_or(|cfg| cfg.enabled)
    }

    pub fn set_enabled(&mut self, provider: &str, enabled: bool) {
        self.providers.entry(provider.to_string()).or_default().enabled = enabled;
    }

    /// Replace the fallback order; a provider may appear only once.
    pub fn set_fallback_order(&mut self, order: Vec<String>) -> Result<()> {
        for (i, name) in order.iter().enumerate() {
            if order[..i].contains(name) {
                bail!("Provider '{name}' appears twice in the fallback order");
            }
        }
        self.fallback_order = order;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms.max(self.retry.base_delay_ms)),
        }
    }

    /// Cache TTL for results served by `provider`.
    pub fn ttl_for(&self, provider: &str) -> Duration {
        let secs = self
            .providers
            .get(provider)
            .and_then(|cfg| cfg.cache_ttl_secs)
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        let provider_ttls: HashMap<String, Duration> = self
            .providers
            .iter()
            .filter_map(|(name, cfg)| Some((name.clone(), Duration::from_secs(cfg.cache_ttl_secs?))))
            .collect();

        DispatchPolicy {
            retry: self.retry_policy(),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs.max(1)),
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            provider_ttls,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.default_ttl_secs, 600);
        assert_eq!(cfg.attempt_timeout_secs, 10);
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert!(cfg.fallback_order.is_empty());
    }

    #[test]
    fn upsert_appends_to_fallback_order_once() {
        let mut cfg = Config::default();

        cfg.upsert_setting("openweather", "api_key", "OPEN_KEY");
        cfg.upsert_setting("weatherapi", "api_key", "WEATHER_KEY");
        cfg.upsert_setting("openweather", "language", "fr");

        assert_eq!(cfg.fallback_order, vec!["openweather", "weatherapi"]);
        let settings = cfg.provider_settings("openweather").expect("settings stored");
        assert_eq!(settings.get("api_key"), Some(&SettingValue::from("OPEN_KEY")));
        assert_eq!(settings.len(), 2);
    }

    #[test]
    fn fallback_order_rejects_duplicates() {
        let mut cfg = Config::default();
        let err = cfg
            .set_fallback_order(vec!["a".into(), "b".into(), "a".into()])
            .unwrap_err();
        assert!(err.to_string().contains("appears twice"));

        cfg.set_fallback_order(vec!["b".into(), "a".into()]).unwrap();
        assert_eq!(cfg.fallback_order, vec!["b", "a"]);
    }

    #[test]
    fn ttl_override_per_provider() {
        let mut cfg = Config::default();
        cfg.providers.insert(
            "openmeteo".into(),
            ProviderConfig {
                cache_ttl_secs: Some(60),
                ..Default::default()
            },
        );

        assert_eq!(cfg.ttl_for("openmeteo"), Duration::from_secs(60));
        assert_eq!(cfg.ttl_for("weatherapi"), Duration::from_secs(600));
        assert_eq!(cfg.dispatch_policy().ttl_for("openmeteo"), Duration::from_secs(60));
    }

    #[test]
    fn enabled_flag_defaults_to_true() {
        let mut cfg = Config::default();
        assert!(cfg.is_enabled("openmeteo"));
        cfg.set_enabled("openmeteo", false);
        assert!(!cfg.is_enabled("openmeteo"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.upsert_setting("weatherapi", "api_key", "KEY");
        cfg.retry.max_attempts = 5;
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
                fallback_order = ["openmeteo"]

                [retry]
                max_attempts = 2

                [providers.openmeteo]
                cache_ttl_secs = 120
            "#,
        )
        .unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.default_ttl_secs, 600);
        assert!(cfg.is_enabled("openmeteo"));
        assert_eq!(cfg.ttl_for("openmeteo"), Duration::from_secs(120));
    }

    #[test]
    fn missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
