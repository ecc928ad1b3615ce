use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{Result, WeatherError},
    model::{
        AirQualityReading, WeatherCondition, WeatherDataPoint, WeatherForecast, humidity_pct,
        wind_direction_deg,
    },
    provider::{
        Capabilities, DaysPolicy, ForecastDays, ProviderDescriptor, ProviderPlugin, RateLimitGate,
        WeatherProvider, fetch_body, http_client, parse_coordinates, parse_json,
    },
    settings::{ProviderSettings, SettingField, SettingType, SettingsSchema},
};

const NAME: &str = "openmeteo";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const AIR_QUALITY_URL: &str = "https://air-quality-api.open-meteo.com/v1/air-quality";

const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,weather_code,\
surface_pressure,wind_speed_10m,wind_direction_10m,visibility,precipitation";
const DAILY_FIELDS: &str = "weather_code,temperature_2m_max,temperature_2m_min,\
apparent_temperature_max,apparent_temperature_min,precipitation_sum,wind_speed_10m_max,\
wind_direction_10m_dominant,relative_humidity_2m_mean,surface_pressure_mean";

static DESCRIPTOR: LazyLock<ProviderDescriptor> = LazyLock::new(|| ProviderDescriptor {
    name: NAME.to_string(),
    display_name: "Open-Meteo".to_string(),
    version: "2.0.0".to_string(),
    author: "weather-task".to_string(),
    description: "Free Open-Meteo forecasts and air quality; no API key required".to_string(),
    settings: SettingsSchema::new(vec![
        SettingField::new("language", SettingType::String, "Language")
            .describe("Language used when geocoding place names")
            .default_value("en"),
    ]),
    capabilities: Capabilities {
        forecast: true,
        alerts: false,
        air_quality: true,
    },
    forecast_days: ForecastDays {
        min: 1,
        max: 14,
        policy: DaysPolicy::Clamp,
    },
});

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMeteoPlugin;

impl ProviderPlugin for OpenMeteoPlugin {
    fn descriptor(&self) -> &ProviderDescriptor {
        &DESCRIPTOR
    }

    fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>> {
        let language = settings.str("language").unwrap_or("en");
        Ok(Arc::new(OpenMeteoProvider::new(language.to_owned())))
    }
}

#[derive(Debug)]
pub struct OpenMeteoProvider {
    language: String,
    http: Client,
    gate: RateLimitGate,
}

impl OpenMeteoProvider {
    pub fn new(language: String) -> Self {
        Self {
            language,
            http: http_client(),
            gate: RateLimitGate::new(),
        }
    }

    /// Resolve a place name to coordinates; "lat,lon" passes through.
    async fn resolve(&self, location: &str) -> Result<(f64, f64)> {
        if let Some(coords) = parse_coordinates(location) {
            return Ok(coords);
        }

        let request = self.http.get(GEOCODING_URL).query(&[
            ("name", location),
            ("count", "1"),
            ("language", self.language.as_str()),
            ("format", "json"),
        ]);
        let body = fetch_body(NAME, &self.gate, request, location).await?;
        parse_geocoding(&body, location)
    }

    async fn forecast_body(&self, location: &str, params: &[(&str, String)]) -> Result<String> {
        let (lat, lon) = self.resolve(location).await?;

        let mut query = vec![
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
            ("wind_speed_unit", "ms".to_string()),
            ("timezone", "UTC".to_string()),
            ("timeformat", "unixtime".to_string()),
        ];
        query.extend(params.iter().cloned());

        let request = self.http.get(FORECAST_URL).query(&query);
        fetch_body(NAME, &self.gate, request, location).await
    }
}

#[derive(Debug, Deserialize)]
struct GeoResult {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    results: Vec<GeoResult>,
}

fn parse_geocoding(body: &str, location: &str) -> Result<(f64, f64)> {
    let parsed: GeoResponse = parse_json(NAME, body)?;
    parsed
        .results
        .first()
        .map(|r| (r.latitude, r.longitude))
        .ok_or_else(|| WeatherError::LocationNotFound(location.to_string()))
}

#[derive(Debug, Deserialize)]
struct OmCurrent {
    time: i64,
    temperature_2m: f64,
    relative_humidity_2m: f64,
    apparent_temperature: f64,
    weather_code: u16,
    surface_pressure: f64,
    wind_speed_10m: f64,
    wind_direction_10m: f64,
    visibility: Option<f64>,
    #[serde(default)]
    precipitation: f64,
}

#[derive(Debug, Deserialize)]
struct OmCurrentResponse {
    current: OmCurrent,
}

#[derive(Debug, Deserialize)]
struct OmDaily {
    time: Vec<i64>,
    weather_code: Vec<u16>,
    temperature_2m_max: Vec<f64>,
    temperature_2m_min: Vec<f64>,
    apparent_temperature_max: Vec<f64>,
    apparent_temperature_min: Vec<f64>,
    precipitation_sum: Vec<f64>,
    wind_speed_10m_max: Vec<f64>,
    wind_direction_10m_dominant: Vec<f64>,
    relative_humidity_2m_mean: Vec<f64>,
    surface_pressure_mean: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct OmDailyResponse {
    daily: OmDaily,
}

#[derive(Debug, Deserialize)]
struct OmAirCurrent {
    time: i64,
    us_aqi: Option<f64>,
    pm2_5: Option<f64>,
    pm10: Option<f64>,
    ozone: Option<f64>,
    nitrogen_dioxide: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OmAirResponse {
    current: OmAirCurrent,
}

fn describe_wmo(code: u16) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Foggy",
        48 => "Depositing rime fog",
        51 | 53 | 55 => "Drizzle",
        56 | 57 => "Freezing drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        66 | 67 => "Freezing rain",
        71 => "Slight snow fall",
        73 => "Moderate snow fall",
        75 => "Heavy snow fall",
        77 => "Snow grains",
        80..=82 => "Rain showers",
        85 | 86 => "Snow showers",
        95 => "Thunderstorm",
        96 | 99 => "Thunderstorm with hail",
        _ => "Unknown weather conditions",
    }
}

fn parse_current(body: &str) -> Result<WeatherDataPoint> {
    let parsed: OmCurrentResponse = parse_json(NAME, body)?;
    let c = parsed.current;

    Ok(WeatherDataPoint {
        timestamp: DateTime::from_timestamp(c.time, 0).unwrap_or_else(Utc::now),
        temperature_c: c.temperature_2m,
        feels_like_c: c.apparent_temperature,
        humidity_pct: humidity_pct(c.relative_humidity_2m),
        wind_speed_mps: c.wind_speed_10m,
        wind_direction_deg: wind_direction_deg(c.wind_direction_10m),
        pressure_hpa: c.surface_pressure,
        visibility_m: c.visibility.map(|v| v.max(0.0).round() as u32),
        condition: WeatherCondition::from_wmo(c.weather_code),
        condition_text: describe_wmo(c.weather_code).to_string(),
        precipitation_mm: c.precipitation,
    })
}

fn parse_daily(body: &str, location: &str, days: u8, now: DateTime<Utc>) -> Result<WeatherForecast> {
    let parsed: OmDailyResponse = parse_json(NAME, body)?;
    let d = parsed.daily;

    let len = d.time.len();
    let columns = [
        d.weather_code.len(),
        d.temperature_2m_max.len(),
        d.temperature_2m_min.len(),
        d.apparent_temperature_max.len(),
        d.apparent_temperature_min.len(),
        d.precipitation_sum.len(),
        d.wind_speed_10m_max.len(),
        d.wind_direction_10m_dominant.len(),
        d.relative_humidity_2m_mean.len(),
        d.surface_pressure_mean.len(),
    ];
    if len == 0 || columns.iter().any(|&c| c != len) {
        return Err(WeatherError::Provider(
            "Open-Meteo daily response has missing or ragged columns".to_string(),
        ));
    }

    let entries = (0..len)
        .map(|i| {
            let code = d.weather_code[i];
            WeatherDataPoint {
                timestamp: DateTime::from_timestamp(d.time[i], 0).unwrap_or(now),
                temperature_c: (d.temperature_2m_max[i] + d.temperature_2m_min[i]) / 2.0,
                feels_like_c: (d.apparent_temperature_max[i] + d.apparent_temperature_min[i]) / 2.0,
                humidity_pct: humidity_pct(d.relative_humidity_2m_mean[i]),
                wind_speed_mps: d.wind_speed_10m_max[i],
                wind_direction_deg: wind_direction_deg(d.wind_direction_10m_dominant[i]),
                pressure_hpa: d.surface_pressure_mean[i],
                visibility_m: None,
                condition: WeatherCondition::from_wmo(code),
                condition_text: describe_wmo(code).to_string(),
                precipitation_mm: d.precipitation_sum[i],
            }
        })
        .collect();

    WeatherForecast::new(location, days, now, entries)
}

fn parse_air_quality(body: &str) -> Result<AirQualityReading> {
    let parsed: OmAirResponse = parse_json(NAME, body)?;
    let c = parsed.current;

    Ok(AirQualityReading {
        timestamp: DateTime::from_timestamp(c.time, 0).unwrap_or_else(Utc::now),
        aqi: c.us_aqi.map(|v| v.max(0.0).round() as u16).unwrap_or_default(),
        pm2_5: c.pm2_5,
        pm10: c.pm10,
        o3: c.ozone,
        no2: c.nitrogen_dioxide,
    })
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_weather(&self, location: &str) -> Result<WeatherDataPoint> {
        debug!(provider = NAME, location, "fetching current weather");
        let body = self
            .forecast_body(location, &[("current", CURRENT_FIELDS.to_string())])
            .await?;
        parse_current(&body)
    }

    async fn get_forecast(&self, location: &str, days: u8) -> Result<WeatherForecast> {
        debug!(provider = NAME, location, days, "fetching forecast");
        let body = self
            .forecast_body(
                location,
                &[
                    ("daily", DAILY_FIELDS.to_string()),
                    ("forecast_days", days.to_string()),
                ],
            )
            .await?;
        parse_daily(&body, location, days, Utc::now())
    }

    async fn get_air_quality(&self, location: &str) -> Result<AirQualityReading> {
        let (lat, lon) = self.resolve(location).await?;
        let request = self.http.get(AIR_QUALITY_URL).query(&[
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
            ("current", "us_aqi,pm2_5,pm10,ozone,nitrogen_dioxide".to_string()),
            ("timeformat", "unixtime".to_string()),
        ]);
        let body = fetch_body(NAME, &self.gate, request, location).await?;
        parse_air_quality(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geocoding_miss_is_location_not_found() {
        let err = parse_geocoding(r#"{"generationtime_ms": 0.5}"#, "Atlantis").unwrap_err();
        assert_eq!(err, WeatherError::LocationNotFound("Atlantis".into()));

        let coords = parse_geocoding(
            r#"{"results": [{"name": "Rome", "latitude": 41.89, "longitude": 12.48}]}"#,
            "Rome",
        )
        .unwrap();
        assert_eq!(coords, (41.89, 12.48));
    }

    #[test]
    fn parses_current_conditions() {
        let body = r#"{"current": {
            "time": 1700000000, "temperature_2m": 14.2, "relative_humidity_2m": 71,
            "apparent_temperature": 12.9, "weather_code": 61, "surface_pressure": 1009.4,
            "wind_speed_10m": 5.3, "wind_direction_10m": 200, "visibility": 24140.0,
            "precipitation": 0.3
        }}"#;

        let point = parse_current(body).unwrap();
        assert_eq!(point.condition, WeatherCondition::Rain);
        assert_eq!(point.condition_text, "Slight rain");
        assert_eq!(point.visibility_m, Some(24_140));
        assert_eq!(point.humidity_pct, 71);
    }

    #[test]
    fn parses_daily_columns() {
        let body = r#"{"daily": {
            "time": [1700006400, 1700092800],
            "weather_code": [3, 95],
            "temperature_2m_max": [16.0, 20.0],
            "temperature_2m_min": [8.0, 12.0],
            "apparent_temperature_max": [15.0, 19.0],
            "apparent_temperature_min": [7.0, 11.0],
            "precipitation_sum": [0.0, 12.5],
            "wind_speed_10m_max": [4.0, 9.0],
            "wind_direction_10m_dominant": [180, 270],
            "relative_humidity_2m_mean": [64, 81],
            "surface_pressure_mean": [1012.5, 1004.0]
        }}"#;

        let fc = parse_daily(body, "Rome", 2, Utc::now()).unwrap();
        assert_eq!(fc.entries().len(), 2);
        assert_eq!(fc.entries()[0].temperature_c, 12.0);
        assert_eq!(fc.entries()[1].condition, WeatherCondition::Thunderstorm);
        assert_eq!(fc.entries()[1].humidity_pct, 81);
        assert_eq!(fc.entries()[1].pressure_hpa, 1004.0);
        assert_eq!(fc.location, "Rome");
    }

    #[test]
    fn ragged_daily_columns_are_rejected() {
        let body = r#"{"daily": {
            "time": [1700006400, 1700092800],
            "weather_code": [3],
            "temperature_2m_max": [16.0, 20.0],
            "temperature_2m_min": [8.0, 12.0],
            "apparent_temperature_max": [15.0, 19.0],
            "apparent_temperature_min": [7.0, 11.0],
            "precipitation_sum": [0.0, 12.5],
            "wind_speed_10m_max": [4.0, 9.0],
            "wind_direction_10m_dominant": [180, 270],
            "relative_humidity_2m_mean": [64, 81],
            "surface_pressure_mean": [1012.5, 1004.0]
        }}"#;

        assert!(matches!(
            parse_daily(body, "Rome", 2, Utc::now()),
            Err(WeatherError::Provider(_))
        ));
    }

    #[test]
    fn parses_air_quality() {
        let body = r#"{"current": {"time": 1700000000, "us_aqi": 42.4, "pm2_5": 9.8,
            "pm10": 15.0, "ozone": 60.0, "nitrogen_dioxide": null}}"#;
        let aq = parse_air_quality(body).unwrap();
        assert_eq!(aq.aqi, 42);
        assert_eq!(aq.no2, None);
    }
}
