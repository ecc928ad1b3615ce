//! Plugin registry: discovery, validation and instantiation of providers.
//!
//! Built-in backends are registered statically. Additional plugins are
//! declared by TOML manifests in the built-in and user plugin directories;
//! each manifest selects a compiled backend and may narrow its capabilities,
//! its forecast range and its setting defaults.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, WeatherError},
    events::{EngineEvent, EventBus},
    legacy::{LegacyClass, LegacyPlugin},
    provider::{
        BuiltinProvider, Capabilities, DaysPolicy, ProviderDescriptor, ProviderPlugin,
        WeatherProvider,
    },
    settings::{ProviderSettings, RawSettings},
};

/// Directories scanned for plugin manifests, in this order.
#[derive(Debug, Clone, Default)]
pub struct PluginDirs {
    pub builtin: Option<PathBuf>,
    pub user: Option<PathBuf>,
}

/// A manifest that was skipped during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub source: PathBuf,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Static,
    Legacy,
    Manifest(PathBuf),
}

struct Entry {
    plugin: Arc<dyn ProviderPlugin>,
    origin: Origin,
    enabled: bool,
    instance: Option<Arc<dyn WeatherProvider>>,
    /// Raw settings of the last successful activation.
    settings: Option<RawSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PluginManifest {
    name: String,
    display_name: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    description: String,
    backend: String,
    capabilities: Option<Capabilities>,
    max_days: Option<u8>,
    days_policy: Option<DaysPolicy>,
    #[serde(default)]
    defaults: RawSettings,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// A manifest-declared plugin delegating instance creation to its backend.
struct ManifestPlugin {
    descriptor: ProviderDescriptor,
    backend: Arc<dyn ProviderPlugin>,
}

impl ProviderPlugin for ManifestPlugin {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>> {
        self.backend.create(settings)
    }
}

impl PluginManifest {
    fn into_plugin(self) -> Result<ManifestPlugin, String> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(format!(
                "invalid plugin name '{}': use lowercase letters, digits, '-' or '_'",
                self.name
            ));
        }

        let backend = BuiltinProvider::try_from(self.backend.as_str())
            .map_err(|e| e.to_string())?
            .plugin();
        let base = backend.descriptor();

        let capabilities = self.capabilities.unwrap_or(base.capabilities);
        if !capabilities.is_subset_of(&base.capabilities) {
            return Err(format!(
                "capabilities {capabilities:?} exceed those of backend '{}'",
                base.name
            ));
        }

        let mut forecast_days = base.forecast_days;
        if let Some(max) = self.max_days {
            if max < forecast_days.min || max > forecast_days.max {
                return Err(format!(
                    "max_days {max} outside backend range {}..={}",
                    forecast_days.min, forecast_days.max
                ));
            }
            forecast_days.max = max;
        }
        if let Some(policy) = self.days_policy {
            forecast_days.policy = policy;
        }

        let settings = base
            .settings
            .clone()
            .with_defaults(&self.defaults)
            .map_err(|problems| problems.join("; "))?;

        let descriptor = ProviderDescriptor {
            display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            version: self.version,
            author: self.author,
            description: self.description,
            settings,
            capabilities,
            forecast_days,
        };

        Ok(ManifestPlugin { descriptor, backend })
    }
}

pub struct PluginRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    failures: Mutex<Vec<LoadFailure>>,
    dirs: PluginDirs,
    events: EventBus,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("providers", &self.names())
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    pub fn new(dirs: PluginDirs, events: EventBus) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
            dirs,
            events,
        }
    }

    /// Register every compiled-in backend under its own name.
    pub fn register_builtins(&self) {
        for backend in BuiltinProvider::all() {
            self.register(backend.plugin());
        }
    }

    /// Register a statically linked plugin. A duplicate name replaces the
    /// earlier registration.
    pub fn register(&self, plugin: Arc<dyn ProviderPlugin>) {
        let name = plugin.descriptor().name.clone();
        self.insert(name, plugin, Origin::Static);
    }

    /// Wrap a legacy source class and register it under `name`.
    pub fn register_legacy(&self, name: &str, class: LegacyClass) {
        let plugin: Arc<dyn ProviderPlugin> = Arc::new(LegacyPlugin::new(name, class));
        self.insert(name.to_string(), plugin, Origin::Legacy);
    }

    /// Insert or replace a plugin. A replacement keeps the enabled flag and,
    /// if the provider was active, is re-activated from its last settings.
    fn insert(&self, name: String, plugin: Arc<dyn ProviderPlugin>, origin: Origin) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let (enabled, settings) = match entries.get(&name) {
            Some(existing)
                if existing.origin == origin
                    && existing.plugin.descriptor() == plugin.descriptor() =>
            {
                debug!(provider = %name, "plugin unchanged");
                return;
            }
            Some(existing) => {
                warn!(provider = %name, "duplicate provider name; the later registration wins");
                (existing.enabled, existing.settings.clone())
            }
            None => {
                debug!(provider = %name, "registered provider plugin");
                (true, None)
            }
        };

        let instance = settings.as_ref().and_then(|raw| {
            match build_instance(&name, plugin.as_ref(), raw) {
                Ok(instance) => {
                    info!(provider = %name, "provider re-activated");
                    Some(instance)
                }
                Err(error) => {
                    warn!(provider = %name, %error, "replaced provider could not be re-activated");
                    None
                }
            }
        });

        entries.insert(
            name,
            Entry {
                plugin,
                origin,
                enabled,
                instance,
                settings,
            },
        );
    }

    /// Scan the plugin directories and register every valid manifest.
    /// Broken manifests are recorded and reported, never fatal.
    pub fn discover(&self) -> Vec<ProviderDescriptor> {
        let mut found = BTreeMap::new();
        for dir in [&self.dirs.builtin, &self.dirs.user].into_iter().flatten() {
            self.scan_dir(dir, &mut found);
        }

        // manifests deleted since the previous scan
        let removed: Vec<String> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|(name, entry)| {
                    matches!(entry.origin, Origin::Manifest(_)) && !found.contains_key(*name)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for (name, (path, plugin)) in found {
            self.insert(name, Arc::new(plugin), Origin::Manifest(path));
        }

        for name in removed {
            // a removed manifest may have shadowed a built-in backend
            if let Ok(backend) = BuiltinProvider::try_from(name.as_str()) {
                info!(provider = %name, "plugin manifest removed; built-in restored");
                self.register(backend.plugin());
            } else {
                info!(provider = %name, "plugin manifest removed");
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&name);
            }
        }

        self.descriptors()
    }

    /// Forget earlier load failures and run discovery again.
    pub fn rescan(&self) -> Vec<ProviderDescriptor> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.discover()
    }

    /// Collect the valid manifests in `dir`. A name declared again, in a later
    /// file or directory, replaces the earlier declaration.
    fn scan_dir(&self, dir: &Path, found: &mut BTreeMap<String, (PathBuf, ManifestPlugin)>) {
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "plugin directory does not exist");
                return;
            }
            Err(e) => {
                self.record_failure(dir, dir_label(dir), format!("cannot read directory: {e}"));
                return;
            }
        };

        let mut manifests: Vec<PathBuf> = read
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        manifests.sort();

        for path in manifests {
            match load_manifest(&path) {
                Ok(plugin) => {
                    let name = plugin.descriptor.name.clone();
                    if let Some((earlier, _)) = found.insert(name.clone(), (path.clone(), plugin)) {
                        debug!(provider = %name, shadowed = %earlier.display(), "manifest shadowed");
                    }
                }
                Err((name, reason)) => self.record_failure(&path, name, reason),
            }
        }
    }

    fn record_failure(&self, source: &Path, name: String, reason: String) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LoadFailure {
                source: source.to_path_buf(),
                name: name.clone(),
                reason: reason.clone(),
            });
        self.events.emit(EngineEvent::PluginLoadFailed { name, reason });
    }

    /// Validate `raw` against the plugin's schema and build a fresh instance.
    pub fn instantiate(&self, name: &str, raw: &RawSettings) -> Result<Arc<dyn WeatherProvider>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(name)
            .ok_or_else(|| WeatherError::configuration(name, "no such provider is registered"))?;

        build_instance(name, entry.plugin.as_ref(), raw)
    }

    /// Instantiate and keep the instance as the provider's active one.
    pub fn activate(&self, name: &str, raw: &RawSettings) -> Result<Arc<dyn WeatherProvider>> {
        let instance = self.instantiate(name, raw)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| WeatherError::configuration(name, "provider was unregistered"))?;
        entry.instance = Some(Arc::clone(&instance));
        entry.settings = Some(raw.clone());
        info!(provider = name, "provider activated");

        Ok(instance)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| WeatherError::configuration(name, "no such provider is registered"))?;
        entry.enabled = enabled;
        info!(provider = name, enabled, "provider toggled");
        Ok(())
    }

    /// The active instance, if the provider is enabled and was activated.
    pub fn active(&self, name: &str) -> Option<Arc<dyn WeatherProvider>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(name)
            .filter(|e| e.enabled)
            .and_then(|e| e.instance.clone())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).is_some_and(|e| e.enabled)
    }

    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<ProviderDescriptor> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|e| e.plugin.descriptor().clone())
    }

    /// Descriptors of every registered plugin, ordered by name.
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(|e| e.plugin.descriptor().clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    pub fn load_failures(&self) -> Vec<LoadFailure> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn build_instance(
    name: &str,
    plugin: &dyn ProviderPlugin,
    raw: &RawSettings,
) -> Result<Arc<dyn WeatherProvider>> {
    let settings = plugin
        .descriptor()
        .settings
        .validate(raw)
        .map_err(|problems| WeatherError::Configuration {
            provider: name.to_string(),
            problems,
        })?;

    debug!(provider = name, settings = ?settings, "instantiating provider");
    plugin.create(&settings)
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Parse and validate a manifest; on failure returns the best name known
/// for it (the file stem until the manifest parses) and the reason.
fn load_manifest(path: &Path) -> Result<ManifestPlugin, (String, String)> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let contents =
        fs::read_to_string(path).map_err(|e| (stem.clone(), format!("cannot read manifest: {e}")))?;
    let manifest: PluginManifest =
        toml::from_str(&contents).map_err(|e| (stem, format!("invalid manifest: {e}")))?;

    let name = manifest.name.clone();
    manifest.into_plugin().map_err(|reason| (name, reason))
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(PluginDirs::default(), EventBus::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingValue;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn registry_with(dir: &TempDir) -> (PluginRegistry, broadcast::Receiver<EngineEvent>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let registry = PluginRegistry::new(
            PluginDirs {
                builtin: None,
                user: Some(dir.path().to_path_buf()),
            },
            events,
        );
        registry.register_builtins();
        (registry, rx)
    }

    fn write(dir: &TempDir, file: &str, contents: &str) {
        fs::write(dir.path().join(file), contents).unwrap();
    }

    #[test]
    fn builtins_are_registered_and_enabled() {
        let registry = PluginRegistry::default();
        registry.register_builtins();
        assert_eq!(registry.names(), vec!["openmeteo", "openweather", "weatherapi"]);
        assert!(registry.is_enabled("openmeteo"));
        // nothing is active until activated
        assert!(registry.active("openmeteo").is_none());
    }

    #[test]
    fn one_malformed_manifest_among_many() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "meteo-eu.toml",
            r#"
                name = "meteo-eu"
                display_name = "Open-Meteo (EU)"
                backend = "openmeteo"
                max_days = 7
                [defaults]
                language = "de"
            "#,
        );
        write(
            &dir,
            "wapi-lite.toml",
            r#"
                name = "wapi-lite"
                backend = "weatherapi"
                capabilities = { forecast = true }
            "#,
        );
        write(&dir, "broken.toml", "name = ");
        write(&dir, "notes.txt", "not a manifest");

        let (registry, mut rx) = registry_with(&dir);
        let descriptors = registry.discover();

        // 3 builtins + 2 valid manifests
        assert_eq!(descriptors.len(), 5);
        let eu = registry.descriptor("meteo-eu").unwrap();
        assert_eq!(eu.forecast_days.max, 7);
        assert_eq!(
            eu.settings.field("language").unwrap().default,
            Some(SettingValue::from("de"))
        );
        assert!(!registry.descriptor("wapi-lite").unwrap().capabilities.alerts);

        let failures = registry.load_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "broken");
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::PluginLoadFailed { name, .. } if name == "broken"
        ));
    }

    #[test]
    fn manifests_cannot_exceed_their_backend() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "a.toml",
            "name = \"owm-alerts\"\nbackend = \"openweather\"\ncapabilities = { alerts = true }\n",
        );
        write(&dir, "b.toml", "name = \"owm-long\"\nbackend = \"openweather\"\nmax_days = 10\n");
        write(&dir, "c.toml", "name = \"mystery\"\nbackend = \"darksky\"\n");
        write(
            &dir,
            "d.toml",
            "name = \"bad-default\"\nbackend = \"openmeteo\"\n[defaults]\nunits = \"metric\"\n",
        );

        let (registry, _rx) = registry_with(&dir);
        registry.discover();

        let mut names: Vec<_> = registry.load_failures().into_iter().map(|f| f.name).collect();
        names.sort();
        assert_eq!(names, vec!["bad-default", "mystery", "owm-alerts", "owm-long"]);
        assert_eq!(registry.names().len(), 3);
    }

    #[test]
    fn manifest_overrides_builtin_until_removed() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "openmeteo.toml",
            "name = \"openmeteo\"\nbackend = \"openmeteo\"\nmax_days = 3\n",
        );

        let (registry, _rx) = registry_with(&dir);
        registry.discover();
        assert_eq!(registry.descriptor("openmeteo").unwrap().forecast_days.max, 3);
        registry.activate("openmeteo", &RawSettings::new()).unwrap();

        fs::remove_file(dir.path().join("openmeteo.toml")).unwrap();
        registry.rescan();
        assert_eq!(registry.descriptor("openmeteo").unwrap().forecast_days.max, 14);
        assert!(registry.active("openmeteo").is_some());
    }

    fn meteo_eu(max_days: u8, backend: &str) -> String {
        format!("name = \"meteo-eu\"\nbackend = \"{backend}\"\nmax_days = {max_days}\n")
    }

    fn german() -> RawSettings {
        let mut raw = RawSettings::new();
        raw.insert("language".into(), "de".into());
        raw
    }

    #[test]
    fn edited_manifest_keeps_state_across_rescan() {
        let dir = TempDir::new().unwrap();
        write(&dir, "meteo-eu.toml", &meteo_eu(7, "openmeteo"));

        let (registry, _rx) = registry_with(&dir);
        registry.discover();
        registry.activate("meteo-eu", &german()).unwrap();
        registry.set_enabled("meteo-eu", false).unwrap();

        write(&dir, "meteo-eu.toml", &meteo_eu(5, "openmeteo"));
        registry.rescan();

        assert_eq!(registry.descriptor("meteo-eu").unwrap().forecast_days.max, 5);
        assert!(!registry.is_enabled("meteo-eu"));
        registry.set_enabled("meteo-eu", true).unwrap();
        assert!(registry.active("meteo-eu").is_some());
    }

    #[test]
    fn backend_swap_drops_an_instance_whose_settings_no_longer_fit() {
        let dir = TempDir::new().unwrap();
        write(&dir, "meteo-eu.toml", &meteo_eu(7, "openmeteo"));

        let (registry, _rx) = registry_with(&dir);
        registry.discover();
        registry.activate("meteo-eu", &german()).unwrap();

        // weatherapi wants an api key and has no language setting
        write(&dir, "meteo-eu.toml", &meteo_eu(7, "weatherapi"));
        registry.rescan();

        assert!(registry.is_enabled("meteo-eu"));
        assert!(registry.active("meteo-eu").is_none());

        let mut raw = RawSettings::new();
        raw.insert("api_key".into(), "k".into());
        registry.activate("meteo-eu", &raw).unwrap();
        assert!(registry.active("meteo-eu").is_some());
    }

    #[test]
    fn user_manifest_shadowing_a_builtin_dir_one_is_stable() {
        let builtin = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        write(&builtin, "meteo-eu.toml", &meteo_eu(7, "openmeteo"));
        write(&user, "meteo-eu.toml", &meteo_eu(3, "openmeteo"));

        let registry = PluginRegistry::new(
            PluginDirs {
                builtin: Some(builtin.path().to_path_buf()),
                user: Some(user.path().to_path_buf()),
            },
            EventBus::new(),
        );
        registry.discover();
        assert_eq!(registry.descriptor("meteo-eu").unwrap().forecast_days.max, 3);

        let active = registry.activate("meteo-eu", &german()).unwrap();
        registry.set_enabled("meteo-eu", false).unwrap();
        registry.rescan();
        registry.rescan();

        assert!(!registry.is_enabled("meteo-eu"));
        registry.set_enabled("meteo-eu", true).unwrap();
        let after = registry.active("meteo-eu").unwrap();
        // an unchanged manifest keeps the very same instance
        assert!(Arc::ptr_eq(&active, &after));
        assert_eq!(registry.descriptor("meteo-eu").unwrap().forecast_days.max, 3);
    }

    #[test]
    fn instantiate_reports_every_problem() {
        let registry = PluginRegistry::default();
        registry.register_builtins();

        let mut raw = RawSettings::new();
        raw.insert("language".into(), SettingValue::Number(3.0));
        raw.insert("colour".into(), "blue".into());

        match registry.instantiate("weatherapi", &raw).unwrap_err() {
            WeatherError::Configuration { provider, problems } => {
                assert_eq!(provider, "weatherapi");
                assert_eq!(problems.len(), 3, "{problems:?}");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(registry.instantiate("nope", &RawSettings::new()).is_err());
    }

    #[test]
    fn activation_and_enable_toggle() {
        let registry = PluginRegistry::default();
        registry.register_builtins();

        registry.activate("openmeteo", &RawSettings::new()).unwrap();
        assert!(registry.active("openmeteo").is_some());

        registry.set_enabled("openmeteo", false).unwrap();
        assert!(registry.active("openmeteo").is_none());
        assert!(!registry.is_enabled("openmeteo"));
        assert!(registry.set_enabled("ghost", false).is_err());
    }

    #[test]
    fn duplicate_registration_last_wins() {
        let registry = PluginRegistry::default();
        registry.register_builtins();
        registry.activate("openmeteo", &RawSettings::new()).unwrap();

        let class = LegacyClass::new("Imposter", Default::default(), |_| {
            Err(crate::legacy::LegacyError::Other("never built".into()))
        });
        registry.register_legacy("openmeteo", class);

        let descriptor = registry.descriptor("openmeteo").unwrap();
        assert_eq!(descriptor.display_name, "Imposter");
        // the replaced plugin's instance is gone
        assert!(registry.active("openmeteo").is_none());
    }
}
