//! Core library for the `weather` CLI.
//!
//! This crate defines:
//! - The provider contract and the built-in providers
//! - A plugin registry with manifest discovery and a legacy adapter
//! - A TTL cache and the fallback dispatcher that resolves requests
//! - Configuration & credentials handling
//!
//! [`WeatherEngine`] wires all of it from a [`Config`]. It is used by
//! `weather-cli`, but can also be reused by other binaries or services.

pub mod alert;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod legacy;
pub mod model;
pub mod provider;
pub mod registry;
pub mod settings;

pub use alert::{AlertSeverity, WeatherAlert};
pub use config::{Config, ProviderConfig};
pub use dispatcher::{FallbackDispatcher, FallbackOrder, RetryPolicy, Served};
pub use engine::WeatherEngine;
pub use error::{ProviderFailure, Result, WeatherError};
pub use events::EngineEvent;
pub use model::{AirQualityReading, WeatherCondition, WeatherDataPoint, WeatherForecast};
pub use provider::{ProviderDescriptor, ProviderPlugin, WeatherProvider};
pub use registry::PluginRegistry;
