//! Wiring of registry, cache and dispatcher from a [`Config`].

use std::sync::Arc;

use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    cache::WeatherCache,
    config::Config,
    dispatcher::{FallbackDispatcher, FallbackOrder},
    error::{Result, WeatherError},
    events::{EngineEvent, EventBus},
    legacy::LegacyClass,
    provider::{ProviderDescriptor, ProviderPlugin},
    registry::PluginRegistry,
    settings::RawSettings,
};

/// A provider that could not be activated at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Excluded {
    pub provider: String,
    pub error: WeatherError,
}

pub struct WeatherEngine {
    registry: Arc<PluginRegistry>,
    cache: Arc<WeatherCache>,
    dispatcher: FallbackDispatcher,
    events: EventBus,
    excluded: Vec<Excluded>,
    sweeper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WeatherEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherEngine")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .field("excluded", &self.excluded)
            .finish_non_exhaustive()
    }
}

impl WeatherEngine {
    /// Build an engine from configuration. Must be called inside a tokio
    /// runtime: the cache sweeper is spawned here.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Like [`WeatherEngine::from_config`], with extra plugins registered
    /// before providers are activated.
    pub fn builder(config: &Config) -> EngineBuilder<'_> {
        EngineBuilder {
            config,
            plugins: Vec::new(),
            legacy: Vec::new(),
            sweep: true,
        }
    }

    pub fn dispatcher(&self) -> &FallbackDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &WeatherCache {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Providers left out of the fallback order because they failed to
    /// activate.
    pub fn excluded(&self) -> &[Excluded] {
        &self.excluded
    }

    /// Disable a provider and drop everything it put in the cache.
    pub fn disable_provider(&self, name: &str) -> Result<usize> {
        self.registry.set_enabled(name, false)?;
        let dropped = self.cache.invalidate_provider(name);
        info!(provider = name, dropped, "provider disabled");
        Ok(dropped)
    }

    pub fn enable_provider(&self, name: &str) -> Result<()> {
        self.registry.set_enabled(name, true)
    }

    /// Re-scan the plugin directories.
    pub fn rescan(&self) -> Vec<ProviderDescriptor> {
        self.registry.rescan()
    }
}

impl Drop for WeatherEngine {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

pub struct EngineBuilder<'a> {
    config: &'a Config,
    plugins: Vec<Arc<dyn ProviderPlugin>>,
    legacy: Vec<(String, LegacyClass)>,
    sweep: bool,
}

impl EngineBuilder<'_> {
    pub fn plugin(mut self, plugin: Arc<dyn ProviderPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn legacy(mut self, name: &str, class: LegacyClass) -> Self {
        self.legacy.push((name.to_string(), class));
        self
    }

    /// Skip the background cache sweeper; expired entries are still
    /// evicted on read.
    pub fn without_sweeper(mut self) -> Self {
        self.sweep = false;
        self
    }

    pub fn build(self) -> Result<WeatherEngine> {
        let config = self.config;
        let events = EventBus::new();

        let registry = Arc::new(PluginRegistry::new(config.plugin_dirs(), events.clone()));
        registry.register_builtins();
        for plugin in self.plugins {
            registry.register(plugin);
        }
        for (name, class) in self.legacy {
            registry.register_legacy(&name, class);
        }
        let discovered = registry.discover();
        info!(providers = discovered.len(), "plugin discovery finished");

        let empty = RawSettings::new();
        let mut order = Vec::new();
        let mut excluded = Vec::new();

        for name in &config.fallback_order {
            if order.contains(name) {
                continue;
            }
            if !registry.contains(name) {
                warn!(provider = %name, "fallback order names an unknown provider");
                excluded.push(Excluded {
                    provider: name.clone(),
                    error: WeatherError::configuration(
                        name.as_str(),
                        "no such provider is registered",
                    ),
                });
                continue;
            }

            let settings = config.provider_settings(name).unwrap_or(&empty);
            match registry.activate(name, settings) {
                Ok(_) => {
                    if !config.is_enabled(name) {
                        registry.set_enabled(name, false)?;
                    }
                    order.push(name.clone());
                }
                Err(error) => {
                    warn!(provider = %name, %error, "provider left out of the fallback order");
                    excluded.push(Excluded {
                        provider: name.clone(),
                        error,
                    });
                }
            }
        }

        // providers configured but not ordered can still be asked for by name
        for (name, provider_cfg) in &config.providers {
            if config.fallback_order.contains(name) || !registry.contains(name) {
                continue;
            }
            if let Err(error) = registry.activate(name, &provider_cfg.settings) {
                warn!(provider = %name, %error, "provider could not be activated");
                excluded.push(Excluded {
                    provider: name.clone(),
                    error,
                });
            } else if !provider_cfg.enabled {
                registry.set_enabled(name, false)?;
            }
        }

        let cache = Arc::new(WeatherCache::new());
        let sweeper = self
            .sweep
            .then(|| cache.spawn_sweeper(config.sweep_interval()));

        let dispatcher = FallbackDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            FallbackOrder::new(order)?,
            config.dispatch_policy(),
            events.clone(),
        );

        Ok(WeatherEngine {
            registry,
            cache,
            dispatcher,
            events,
            excluded,
            sweeper,
        })
    }
}
