use std::{
    convert::TryFrom,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use reqwest::{StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};

use crate::{
    alert::WeatherAlert,
    error::{Result, WeatherError},
    model::{AirQualityReading, MAX_FORECAST_DAYS, WeatherDataPoint, WeatherForecast},
    settings::{ProviderSettings, SettingsSchema},
};

pub mod openmeteo;
pub mod openweather;
pub mod weatherapi;

/// Compiled-in provider implementations a plugin manifest can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinProvider {
    OpenWeather,
    WeatherApi,
    OpenMeteo,
}

impl BuiltinProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinProvider::OpenWeather => "openweather",
            BuiltinProvider::WeatherApi => "weatherapi",
            BuiltinProvider::OpenMeteo => "openmeteo",
        }
    }

    pub const fn all() -> &'static [BuiltinProvider] {
        &[
            BuiltinProvider::OpenWeather,
            BuiltinProvider::WeatherApi,
            BuiltinProvider::OpenMeteo,
        ]
    }

    pub fn plugin(&self) -> Arc<dyn ProviderPlugin> {
        match self {
            BuiltinProvider::OpenWeather => Arc::new(openweather::OpenWeatherPlugin),
            BuiltinProvider::WeatherApi => Arc::new(weatherapi::WeatherApiPlugin),
            BuiltinProvider::OpenMeteo => Arc::new(openmeteo::OpenMeteoPlugin),
        }
    }
}

impl std::fmt::Display for BuiltinProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for BuiltinProvider {
    type Error = WeatherError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openweather" => Ok(BuiltinProvider::OpenWeather),
            "weatherapi" => Ok(BuiltinProvider::WeatherApi),
            "openmeteo" => Ok(BuiltinProvider::OpenMeteo),
            _ => Err(WeatherError::configuration(
                value,
                "unknown backend. Supported backends: openweather, weatherapi, openmeteo",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub forecast: bool,
    #[serde(default)]
    pub alerts: bool,
    #[serde(default)]
    pub air_quality: bool,
}

impl Capabilities {
    pub fn is_subset_of(&self, other: &Capabilities) -> bool {
        (!self.forecast || other.forecast)
            && (!self.alerts || other.alerts)
            && (!self.air_quality || other.air_quality)
    }
}

/// What a provider does with a forecast length outside its range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaysPolicy {
    #[default]
    Clamp,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastDays {
    pub min: u8,
    pub max: u8,
    #[serde(default)]
    pub policy: DaysPolicy,
}

impl Default for ForecastDays {
    fn default() -> Self {
        Self {
            min: 1,
            max: MAX_FORECAST_DAYS,
            policy: DaysPolicy::Clamp,
        }
    }
}

impl ForecastDays {
    /// Fit a requested day count into this range according to the policy.
    pub fn fit(&self, days: u8) -> Result<u8> {
        if (self.min..=self.max).contains(&days) {
            return Ok(days);
        }
        match self.policy {
            DaysPolicy::Clamp => Ok(days.clamp(self.min, self.max)),
            DaysPolicy::Reject => Err(WeatherError::InvalidParameter(format!(
                "{days} forecast days requested, supported range is {}..={}",
                self.min, self.max
            ))),
        }
    }
}

/// Static description of a provider plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub settings: SettingsSchema,
    pub capabilities: Capabilities,
    pub forecast_days: ForecastDays,
}

/// The contract every weather source implements.
///
/// Implementations must be safe to call concurrently; rate-limit
/// bookkeeping is the only state shared between calls.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn get_current_weather(&self, location: &str) -> Result<WeatherDataPoint>;

    /// `days` has already been fitted to the descriptor's range.
    async fn get_forecast(&self, location: &str, days: u8) -> Result<WeatherForecast>;

    async fn get_air_quality(&self, _location: &str) -> Result<AirQualityReading> {
        Err(WeatherError::unsupported(self.name(), "air quality"))
    }

    async fn get_alerts(&self, _location: &str) -> Result<Vec<WeatherAlert>> {
        Err(WeatherError::unsupported(self.name(), "alerts"))
    }
}

/// A loadable provider: a descriptor plus a factory for instances.
pub trait ProviderPlugin: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Build an instance from settings already validated against
    /// `descriptor().settings`.
    fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>>;
}

/// Tracks a provider-imposed cool-down after a throttling response.
///
/// Calls made before the deadline fail fast with `RateLimited` instead of
/// hitting the network again.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    blocked_until_ms: AtomicU64,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, provider: &str) -> Result<()> {
        let until = self.blocked_until_ms.load(Ordering::Acquire);
        let now = now_ms();
        if until > now {
            return Err(WeatherError::RateLimited {
                message: format!("{provider} is cooling down after a rate limit"),
                retry_after: Some(Duration::from_millis(until - now)),
            });
        }
        Ok(())
    }

    pub fn block_for(&self, duration: Duration) {
        let until = now_ms().saturating_add(duration.as_millis() as u64);
        self.blocked_until_ms.fetch_max(until, Ordering::AcqRel);
    }

    /// Record the cool-down carried by a `RateLimited` error, if any.
    pub fn observe(&self, err: &WeatherError) {
        if let WeatherError::RateLimited {
            retry_after: Some(after),
            ..
        } = err
        {
            self.block_for(*after);
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Send a request and return the body of a successful response.
pub(crate) async fn fetch_body(
    provider: &str,
    gate: &RateLimitGate,
    request: reqwest::RequestBuilder,
    location: &str,
) -> Result<String> {
    gate.check(provider)?;

    let res = request.send().await?;
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.text().await?;

    if !status.is_success() {
        let err = classify_status(provider, status, &headers, &body, location);
        gate.observe(&err);
        return Err(err);
    }

    Ok(body)
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(provider: &str, body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| WeatherError::Provider(format!("failed to parse {provider} response: {e}")))
}

/// Map a non-success HTTP response onto the error taxonomy.
pub(crate) fn classify_status(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    location: &str,
) -> WeatherError {
    let detail = format!("{provider} returned {status}: {}", truncate_body(body));
    match status.as_u16() {
        401 | 403 => WeatherError::Auth(detail),
        404 => WeatherError::LocationNotFound(location.to_string()),
        429 => WeatherError::RateLimited {
            message: detail,
            retry_after: retry_after(headers),
        },
        408 | 500..=599 => WeatherError::TransientNetwork(detail),
        _ => WeatherError::Provider(detail),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

/// Parse "lat,lon" into coordinates, if the location has that shape.
pub(crate) fn parse_coordinates(location: &str) -> Option<(f64, f64)> {
    let (lat, lon) = location.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("weather-core/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
