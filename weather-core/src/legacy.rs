//! Adapter for weather sources written before the async provider contract.
//!
//! A legacy source is synchronous, may implement only some operations and
//! hands back loose key/value records. [`LegacyAdapter`] runs it on the
//! blocking pool and turns its records and errors into the normalized model.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{
    alert::{AlertCategory, AlertSeverity, WeatherAlert},
    error::{Result, WeatherError},
    model::{
        STANDARD_PRESSURE_HPA, WeatherCondition, WeatherDataPoint, WeatherForecast, humidity_pct,
        wind_direction_deg,
    },
    provider::{Capabilities, ForecastDays, ProviderDescriptor, ProviderPlugin, WeatherProvider},
    settings::{ProviderSettings, SettingsSchema},
};

/// A loose record as produced by a legacy source.
pub type LegacyRecord = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LegacyError {
    #[error("operation not implemented")]
    NotImplemented,
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("api key rejected")]
    BadKey,
    #[error("location not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl LegacyError {
    fn into_weather_error(self, provider: &str, operation: &'static str) -> WeatherError {
        match self {
            LegacyError::NotImplemented => WeatherError::unsupported(provider, operation),
            LegacyError::Http { status: 401 | 403, message } => WeatherError::Auth(message),
            LegacyError::Http { status: 404, message } => WeatherError::LocationNotFound(message),
            LegacyError::Http { status: 429, message } => WeatherError::RateLimited {
                message,
                retry_after: None,
            },
            LegacyError::Http { status, message } if status == 408 || status >= 500 => {
                WeatherError::TransientNetwork(format!("{provider} returned {status}: {message}"))
            }
            LegacyError::Http { status, message } => {
                WeatherError::Provider(format!("{provider} returned {status}: {message}"))
            }
            LegacyError::Timeout => {
                WeatherError::TransientNetwork(format!("{provider} request timed out"))
            }
            LegacyError::Connection(msg) => WeatherError::TransientNetwork(msg),
            LegacyError::BadKey => WeatherError::Auth(format!("{provider} rejected the api key")),
            LegacyError::NotFound(location) => WeatherError::LocationNotFound(location),
            LegacyError::Other(msg) => WeatherError::Provider(msg),
        }
    }
}

/// Which operations a legacy source actually implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyOperations {
    pub current: bool,
    pub forecast: bool,
    pub alerts: bool,
}

/// The pre-contract source interface. Every method blocks the caller.
pub trait LegacyWeatherSource: Send + Sync {
    fn operations(&self) -> LegacyOperations;

    fn fetch_current(&self, _location: &str) -> Result<LegacyRecord, LegacyError> {
        Err(LegacyError::NotImplemented)
    }

    fn fetch_forecast(&self, _location: &str, _days: u8) -> Result<Vec<LegacyRecord>, LegacyError> {
        Err(LegacyError::NotImplemented)
    }

    fn fetch_alerts(&self, _location: &str) -> Result<Vec<LegacyRecord>, LegacyError> {
        Err(LegacyError::NotImplemented)
    }
}

pub type LegacyConstructor = Arc<
    dyn Fn(&ProviderSettings) -> Result<Arc<dyn LegacyWeatherSource>, LegacyError> + Send + Sync,
>;

/// Everything needed to register a legacy source: metadata plus a constructor.
#[derive(Clone)]
pub struct LegacyClass {
    pub class_name: String,
    pub display_name: String,
    pub version: String,
    pub author: String,
    pub settings: SettingsSchema,
    /// Operations the class implements; drives the descriptor's capabilities.
    pub operations: LegacyOperations,
    pub constructor: LegacyConstructor,
}

impl fmt::Debug for LegacyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyClass")
            .field("class_name", &self.class_name)
            .field("version", &self.version)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

impl LegacyClass {
    pub fn new<F>(class_name: &str, operations: LegacyOperations, constructor: F) -> Self
    where
        F: Fn(&ProviderSettings) -> Result<Arc<dyn LegacyWeatherSource>, LegacyError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            class_name: class_name.to_string(),
            display_name: class_name.to_string(),
            version: "0.0.0".to_string(),
            author: String::new(),
            settings: SettingsSchema::default(),
            operations,
            constructor: Arc::new(constructor),
        }
    }

    pub fn with_settings(mut self, settings: SettingsSchema) -> Self {
        self.settings = settings;
        self
    }
}

/// Registry-facing plugin built from a [`LegacyClass`].
pub struct LegacyPlugin {
    descriptor: ProviderDescriptor,
    constructor: LegacyConstructor,
}

impl LegacyPlugin {
    pub fn new(name: &str, class: LegacyClass) -> Self {
        let descriptor = ProviderDescriptor {
            name: name.to_string(),
            display_name: class.display_name,
            version: class.version,
            author: class.author,
            description: format!("legacy source {}", class.class_name),
            settings: class.settings,
            capabilities: Capabilities {
                forecast: class.operations.forecast,
                alerts: class.operations.alerts,
                air_quality: false,
            },
            forecast_days: ForecastDays::default(),
        };
        Self {
            descriptor,
            constructor: class.constructor,
        }
    }
}

impl ProviderPlugin for LegacyPlugin {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>> {
        let name = self.descriptor.name.as_str();
        let source = (self.constructor)(settings)
            .map_err(|e| WeatherError::configuration(name, e.to_string()))?;

        Ok(Arc::new(LegacyAdapter {
            name: name.to_string(),
            source,
        }))
    }
}

/// Presents a [`LegacyWeatherSource`] as a [`WeatherProvider`].
pub struct LegacyAdapter {
    name: String,
    source: Arc<dyn LegacyWeatherSource>,
}

impl fmt::Debug for LegacyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyAdapter").field("name", &self.name).finish_non_exhaustive()
    }
}

impl LegacyAdapter {
    async fn blocking<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LegacyWeatherSource) -> Result<T, LegacyError> + Send + 'static,
    {
        let source = Arc::clone(&self.source);
        let outcome = tokio::task::spawn_blocking(move || call(source.as_ref()))
            .await
            .map_err(|e| WeatherError::Provider(format!("{} panicked: {e}", self.name)))?;

        outcome.map_err(|e| e.into_weather_error(&self.name, operation))
    }
}

#[async_trait]
impl WeatherProvider for LegacyAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_current_weather(&self, location: &str) -> Result<WeatherDataPoint> {
        if !self.source.operations().current {
            return Err(WeatherError::unsupported(&self.name, "current weather"));
        }
        debug!(provider = %self.name, location, "legacy current weather");
        let loc = location.to_string();
        let record = self
            .blocking("current weather", move |s| s.fetch_current(&loc))
            .await?;
        normalize_record(&self.name, &record, Some(Utc::now()))
    }

    async fn get_forecast(&self, location: &str, days: u8) -> Result<WeatherForecast> {
        if !self.source.operations().forecast {
            return Err(WeatherError::unsupported(&self.name, "forecast"));
        }
        debug!(provider = %self.name, location, days, "legacy forecast");
        let loc = location.to_string();
        let records = self
            .blocking("forecast", move |s| s.fetch_forecast(&loc, days))
            .await?;

        let now = Utc::now();
        let entries = records
            .iter()
            .map(|r| normalize_record(&self.name, r, None))
            .collect::<Result<Vec<_>>>()?;
        WeatherForecast::new(location, days, now, entries)
    }

    async fn get_alerts(&self, location: &str) -> Result<Vec<WeatherAlert>> {
        if !self.source.operations().alerts {
            return Err(WeatherError::unsupported(&self.name, "alerts"));
        }
        let loc = location.to_string();
        let records = self.blocking("alerts", move |s| s.fetch_alerts(&loc)).await?;

        records
            .iter()
            .map(|r| normalize_alert(&self.name, r))
            .collect()
    }
}

fn number(record: &LegacyRecord, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match record.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn text<'a>(record: &'a LegacyRecord, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| record.get(*k)?.as_str())
}

/// Unix seconds (number or numeric string) or RFC 3339.
fn timestamp(record: &LegacyRecord, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|k| match record.get(*k)? {
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(secs) => DateTime::from_timestamp(secs, 0),
            Err(_) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        },
        _ => None,
    })
}

/// Forecast records carry their own time; only a current-weather record may
/// fall back to `observed_at`.
fn normalize_record(
    provider: &str,
    record: &LegacyRecord,
    observed_at: Option<DateTime<Utc>>,
) -> Result<WeatherDataPoint> {
    let timestamp = timestamp(record, &["timestamp", "time", "dt"])
        .or(observed_at)
        .ok_or_else(|| {
            WeatherError::Provider(format!("{provider} returned a forecast record without a time"))
        })?;
    let temperature_c = number(record, &["temperature", "temp", "temp_c"]).ok_or_else(|| {
        WeatherError::Provider(format!("{provider} returned a record without a temperature"))
    })?;
    let condition_text = text(record, &["condition", "description", "summary"])
        .unwrap_or("Unknown")
        .to_string();

    Ok(WeatherDataPoint {
        timestamp,
        temperature_c,
        feels_like_c: number(record, &["feels_like", "apparent_temperature"])
            .unwrap_or(temperature_c),
        humidity_pct: humidity_pct(number(record, &["humidity"]).unwrap_or_default()),
        wind_speed_mps: number(record, &["wind_speed", "wind"]).unwrap_or_default(),
        wind_direction_deg: wind_direction_deg(
            number(record, &["wind_direction", "wind_deg"]).unwrap_or_default(),
        ),
        pressure_hpa: number(record, &["pressure"]).unwrap_or(STANDARD_PRESSURE_HPA),
        visibility_m: number(record, &["visibility"]).map(|v| v.max(0.0).round() as u32),
        condition: WeatherCondition::from_text(&condition_text),
        condition_text,
        precipitation_mm: number(record, &["precipitation", "precip"]).unwrap_or_default(),
    })
}

fn normalize_alert(provider: &str, record: &LegacyRecord) -> Result<WeatherAlert> {
    let starts_at = timestamp(record, &["starts_at", "start", "effective"]).ok_or_else(|| {
        WeatherError::Provider(format!("{provider} returned an alert without a start time"))
    })?;
    let ends_at = timestamp(record, &["ends_at", "end", "expires"]).unwrap_or(starts_at);

    let severity = match text(record, &["severity"]).map(str::to_lowercase).as_deref() {
        Some("critical" | "extreme") => AlertSeverity::Critical,
        Some("error" | "severe") => AlertSeverity::Error,
        Some("warning" | "moderate") => AlertSeverity::Warning,
        _ => AlertSeverity::Info,
    };
    let description = text(record, &["description", "headline", "event"])
        .unwrap_or_default()
        .to_string();
    let category = match WeatherCondition::from_text(&description) {
        WeatherCondition::Rain | WeatherCondition::Snow | WeatherCondition::Drizzle => {
            AlertCategory::Precipitation
        }
        WeatherCondition::Squall | WeatherCondition::Tornado | WeatherCondition::Hurricane => {
            AlertCategory::Wind
        }
        WeatherCondition::Fog | WeatherCondition::Mist => AlertCategory::Travel,
        _ => AlertCategory::Temperature,
    };

    Ok(WeatherAlert {
        severity,
        category,
        starts_at,
        ends_at,
        description,
    })
}
