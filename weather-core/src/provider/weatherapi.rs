use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    alert::{AlertCategory, AlertSeverity, WeatherAlert},
    error::{Result, WeatherError},
    model::{
        AirQualityReading, STANDARD_PRESSURE_HPA, WeatherCondition, WeatherDataPoint,
        WeatherForecast, humidity_pct, wind_direction_deg,
    },
    provider::{
        Capabilities, DaysPolicy, ForecastDays, ProviderDescriptor, ProviderPlugin, RateLimitGate,
        WeatherProvider, fetch_body, http_client, parse_json,
    },
    settings::{ProviderSettings, SettingField, SettingsSchema},
};

const NAME: &str = "weatherapi";
const BASE_URL: &str = "https://api.weatherapi.com/v1";
/// WeatherAPI answers an unknown location with HTTP 400 and this error code.
const NO_LOCATION_FOUND: &str = "1006";

static DESCRIPTOR: LazyLock<ProviderDescriptor> = LazyLock::new(|| ProviderDescriptor {
    name: NAME.to_string(),
    display_name: "WeatherAPI.com".to_string(),
    version: "2.0.0".to_string(),
    author: "weather-task".to_string(),
    description: "Current conditions, 14-day forecast, alerts and air quality from WeatherAPI.com"
        .to_string(),
    settings: SettingsSchema::new(vec![SettingField::api_key()]),
    capabilities: Capabilities {
        forecast: true,
        alerts: true,
        air_quality: true,
    },
    forecast_days: ForecastDays {
        min: 1,
        max: 14,
        policy: DaysPolicy::Clamp,
    },
});

#[derive(Debug, Clone, Copy, Default)]
pub struct WeatherApiPlugin;

impl ProviderPlugin for WeatherApiPlugin {
    fn descriptor(&self) -> &ProviderDescriptor {
        &DESCRIPTOR
    }

    fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>> {
        let api_key = settings
            .str("api_key")
            .ok_or_else(|| WeatherError::configuration(NAME, "missing required setting 'api_key'"))?;

        Ok(Arc::new(WeatherApiProvider::new(api_key.to_owned())))
    }
}

#[derive(Debug)]
pub struct WeatherApiProvider {
    api_key: String,
    http: Client,
    gate: RateLimitGate,
}

impl WeatherApiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: http_client(),
            gate: RateLimitGate::new(),
        }
    }

    async fn fetch(&self, endpoint: &str, location: &str, extra: &[(&str, String)]) -> Result<String> {
        let mut query = vec![("key", self.api_key.clone()), ("q", location.to_string())];
        query.extend(extra.iter().cloned());

        let request = self.http.get(format!("{BASE_URL}/{endpoint}")).query(&query);
        fetch_body(NAME, &self.gate, request, location)
            .await
            .map_err(|err| match err {
                WeatherError::Provider(detail) if detail.contains(NO_LOCATION_FOUND) => {
                    WeatherError::LocationNotFound(location.to_string())
                }
                other => other,
            })
    }
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    name: String,
    country: String,
}

#[derive(Debug, Deserialize)]
struct WaCondition {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WaAirQuality {
    pm2_5: Option<f64>,
    pm10: Option<f64>,
    o3: Option<f64>,
    no2: Option<f64>,
    #[serde(rename = "us-epa-index")]
    us_epa_index: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    last_updated_epoch: i64,
    temp_c: f64,
    feelslike_c: f64,
    humidity: f64,
    wind_kph: f64,
    wind_degree: f64,
    pressure_mb: f64,
    vis_km: Option<f64>,
    #[serde(default)]
    precip_mm: f64,
    condition: WaCondition,
    air_quality: Option<WaAirQuality>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    current: WaCurrent,
}

#[derive(Debug, Deserialize)]
struct WaDay {
    avgtemp_c: f64,
    maxwind_kph: f64,
    totalprecip_mm: f64,
    avgvis_km: Option<f64>,
    avghumidity: f64,
    condition: WaCondition,
}

#[derive(Debug, Deserialize)]
struct WaHour {
    pressure_mb: f64,
    wind_degree: f64,
    feelslike_c: f64,
}

#[derive(Debug, Deserialize)]
struct WaForecastDay {
    date_epoch: i64,
    day: WaDay,
    #[serde(default)]
    hour: Vec<WaHour>,
}

#[derive(Debug, Deserialize)]
struct WaForecast {
    forecastday: Vec<WaForecastDay>,
}

#[derive(Debug, Deserialize)]
struct WaForecastResponse {
    location: WaLocation,
    forecast: WaForecast,
}

#[derive(Debug, Deserialize)]
struct WaAlert {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    desc: String,
    effective: String,
    expires: String,
}

#[derive(Debug, Default, Deserialize)]
struct WaAlerts {
    #[serde(default)]
    alert: Vec<WaAlert>,
}

#[derive(Debug, Deserialize)]
struct WaAlertsResponse {
    #[serde(default)]
    alerts: WaAlerts,
}

fn kph_to_mps(kph: f64) -> f64 {
    kph / 3.6
}

fn km_to_m(km: f64) -> u32 {
    (km * 1000.0).round().max(0.0) as u32
}

fn parse_current(body: &str) -> Result<WeatherDataPoint> {
    let parsed: WaResponse = parse_json(NAME, body)?;
    let c = parsed.current;

    Ok(WeatherDataPoint {
        timestamp: DateTime::from_timestamp(c.last_updated_epoch, 0).unwrap_or_else(Utc::now),
        temperature_c: c.temp_c,
        feels_like_c: c.feelslike_c,
        humidity_pct: humidity_pct(c.humidity),
        wind_speed_mps: kph_to_mps(c.wind_kph),
        wind_direction_deg: wind_direction_deg(c.wind_degree),
        pressure_hpa: c.pressure_mb,
        visibility_m: c.vis_km.map(km_to_m),
        condition: WeatherCondition::from_text(&c.condition.text),
        condition_text: c.condition.text,
        precipitation_mm: c.precip_mm,
    })
}

fn parse_forecast(body: &str, days: u8, now: DateTime<Utc>) -> Result<WeatherForecast> {
    let parsed: WaForecastResponse = parse_json(NAME, body)?;

    let entries = parsed
        .forecast
        .forecastday
        .into_iter()
        .map(|fd| {
            let hours = fd.hour.len().max(1) as f64;
            let (pressure, bearing, feels_like) = if fd.hour.is_empty() {
                (STANDARD_PRESSURE_HPA, 0.0, fd.day.avgtemp_c)
            } else {
                fd.hour.iter().fold((0.0, 0.0, 0.0), |acc, h| {
                    (
                        acc.0 + h.pressure_mb / hours,
                        acc.1 + h.wind_degree / hours,
                        acc.2 + h.feelslike_c / hours,
                    )
                })
            };

            WeatherDataPoint {
                timestamp: DateTime::from_timestamp(fd.date_epoch, 0).unwrap_or(now),
                temperature_c: fd.day.avgtemp_c,
                feels_like_c: feels_like,
                humidity_pct: humidity_pct(fd.day.avghumidity),
                wind_speed_mps: kph_to_mps(fd.day.maxwind_kph),
                wind_direction_deg: wind_direction_deg(bearing),
                pressure_hpa: pressure,
                visibility_m: fd.day.avgvis_km.map(km_to_m),
                condition: WeatherCondition::from_text(&fd.day.condition.text),
                condition_text: fd.day.condition.text,
                precipitation_mm: fd.day.totalprecip_mm,
            }
        })
        .collect::<Vec<_>>();

    if entries.is_empty() {
        return Err(WeatherError::Provider(
            "WeatherAPI response contained no forecastday data".to_string(),
        ));
    }

    let location = format!("{}, {}", parsed.location.name, parsed.location.country);
    WeatherForecast::new(location, days, now, entries)
}

fn parse_air_quality(body: &str) -> Result<AirQualityReading> {
    let parsed: WaResponse = parse_json(NAME, body)?;
    let aq = parsed.current.air_quality.ok_or_else(|| {
        WeatherError::Provider("WeatherAPI response contained no air quality data".to_string())
    })?;

    Ok(AirQualityReading {
        timestamp: DateTime::from_timestamp(parsed.current.last_updated_epoch, 0)
            .unwrap_or_else(Utc::now),
        aqi: aq.us_epa_index.unwrap_or_default(),
        pm2_5: aq.pm2_5,
        pm10: aq.pm10,
        o3: aq.o3,
        no2: aq.no2,
    })
}

fn alert_severity(raw: &str) -> AlertSeverity {
    match raw.to_lowercase().as_str() {
        "extreme" => AlertSeverity::Critical,
        "severe" => AlertSeverity::Error,
        "moderate" => AlertSeverity::Warning,
        _ => AlertSeverity::Info,
    }
}

fn alert_category(event: &str) -> AlertCategory {
    let lower = event.to_lowercase();
    if lower.contains("wind") || lower.contains("gale") || lower.contains("hurricane") {
        AlertCategory::Wind
    } else if ["rain", "flood", "snow", "ice", "storm"].iter().any(|k| lower.contains(k)) {
        AlertCategory::Precipitation
    } else if ["heat", "cold", "freeze", "frost", "chill"].iter().any(|k| lower.contains(k)) {
        AlertCategory::Temperature
    } else {
        AlertCategory::Travel
    }
}

fn parse_alerts(body: &str) -> Result<Vec<WeatherAlert>> {
    let parsed: WaAlertsResponse = parse_json(NAME, body)?;

    parsed
        .alerts
        .alert
        .into_iter()
        .map(|a| {
            let parse_time = |raw: &str| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| WeatherError::Provider(format!("bad alert time '{raw}': {e}")))
            };
            let description = if a.desc.is_empty() { a.headline } else { a.desc };

            Ok(WeatherAlert {
                severity: alert_severity(&a.severity),
                category: alert_category(&a.event),
                starts_at: parse_time(&a.effective)?,
                ends_at: parse_time(&a.expires)?,
                description,
            })
        })
        .collect()
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_weather(&self, location: &str) -> Result<WeatherDataPoint> {
        debug!(provider = NAME, location, "fetching current weather");
        let body = self.fetch("current.json", location, &[]).await?;
        parse_current(&body)
    }

    async fn get_forecast(&self, location: &str, days: u8) -> Result<WeatherForecast> {
        debug!(provider = NAME, location, days, "fetching forecast");
        let body = self
            .fetch("forecast.json", location, &[("days", days.to_string())])
            .await?;
        parse_forecast(&body, days, Utc::now())
    }

    async fn get_air_quality(&self, location: &str) -> Result<AirQualityReading> {
        let body = self
            .fetch("current.json", location, &[("aqi", "yes".to_string())])
            .await?;
        parse_air_quality(&body)
    }

    async fn get_alerts(&self, location: &str) -> Result<Vec<WeatherAlert>> {
        let body = self
            .fetch(
                "forecast.json",
                location,
                &[("days", "1".to_string()), ("alerts", "yes".to_string())],
            )
            .await?;
        parse_alerts(&body)
    }
}
