use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

const CAPACITY: usize = 64;

/// Notifications for whoever is presenting the engine (CLI, status bar, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A request was served by a provider other than the first candidate.
    ProviderFallback {
        from: String,
        to: String,
        reason: String,
    },
    /// A plugin manifest could not be loaded; discovery carried on.
    PluginLoadFailed { name: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::ProviderFallback { from, to, reason } => {
                info!(from = %from, to = %to, reason = %reason, "provider fallback");
            }
            EngineEvent::PluginLoadFailed { name, reason } => {
                warn!(plugin = %name, reason = %reason, "plugin failed to load");
            }
        }
        let _ = self.tx.send(event);
    }
}
