use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{Result, WeatherError},
    model::{WeatherCondition, WeatherDataPoint, WeatherForecast, humidity_pct, wind_direction_deg},
    provider::{
        Capabilities, DaysPolicy, ForecastDays, ProviderDescriptor, ProviderPlugin, RateLimitGate,
        WeatherProvider, fetch_body, http_client, parse_coordinates, parse_json,
    },
    settings::{ProviderSettings, SettingField, SettingType, SettingsSchema},
};

const NAME: &str = "openweather";
const BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

static DESCRIPTOR: LazyLock<ProviderDescriptor> = LazyLock::new(|| ProviderDescriptor {
    name: NAME.to_string(),
    display_name: "OpenWeatherMap".to_string(),
    version: "2.0.0".to_string(),
    author: "weather-task".to_string(),
    description: "Current conditions and 5-day / 3-hour forecast from OpenWeatherMap".to_string(),
    settings: SettingsSchema::new(vec![
        SettingField::api_key(),
        SettingField::new("language", SettingType::String, "Language")
            .describe("Language for condition descriptions")
            .default_value("en"),
    ]),
    capabilities: Capabilities {
        forecast: true,
        alerts: false,
        air_quality: false,
    },
    forecast_days: ForecastDays {
        min: 1,
        max: 5,
        policy: DaysPolicy::Clamp,
    },
});

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWeatherPlugin;

impl ProviderPlugin for OpenWeatherPlugin {
    fn descriptor(&self) -> &ProviderDescriptor {
        &DESCRIPTOR
    }

    fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>> {
        let api_key = settings
            .str("api_key")
            .ok_or_else(|| WeatherError::configuration(NAME, "missing required setting 'api_key'"))?;
        let language = settings.str("language").unwrap_or("en");

        Ok(Arc::new(OpenWeatherProvider::new(api_key.to_owned(), language.to_owned())))
    }
}

#[derive(Debug)]
pub struct OpenWeatherProvider {
    api_key: String,
    language: String,
    http: Client,
    gate: RateLimitGate,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String, language: String) -> Self {
        Self {
            api_key,
            language,
            http: http_client(),
            gate: RateLimitGate::new(),
        }
    }

    fn request(&self, endpoint: &str, location: &str) -> reqwest::RequestBuilder {
        let mut query: Vec<(&str, String)> = vec![
            ("appid", self.api_key.clone()),
            ("units", "metric".to_string()),
            ("lang", self.language.clone()),
        ];
        match parse_coordinates(location) {
            Some((lat, lon)) => {
                query.push(("lat", lat.to_string()));
                query.push(("lon", lon.to_string()));
            }
            None => query.push(("q", location.to_string())),
        }

        self.http.get(format!("{BASE_URL}/{endpoint}")).query(&query)
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    feels_like: f64,
    humidity: f64,
    pressure: f64,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    id: u16,
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
    #[serde(default)]
    deg: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OwPrecip {
    #[serde(rename = "1h", default)]
    one_hour: Option<f64>,
    #[serde(rename = "3h", default)]
    three_hours: Option<f64>,
}

impl OwPrecip {
    fn amount(&self) -> f64 {
        self.one_hour.or(self.three_hours).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
    visibility: Option<u32>,
    #[serde(default)]
    rain: OwPrecip,
    #[serde(default)]
    snow: OwPrecip,
}

#[derive(Debug, Deserialize)]
struct OwCity {
    name: String,
    country: String,
}

#[derive(Debug, Deserialize)]
struct OwForecastEntry {
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
    visibility: Option<u32>,
    #[serde(default)]
    rain: OwPrecip,
    #[serde(default)]
    snow: OwPrecip,
}

#[derive(Debug, Deserialize)]
struct OwForecastResponse {
    city: OwCity,
    list: Vec<OwForecastEntry>,
}

struct OwPoint<'a> {
    dt: i64,
    main: &'a OwMain,
    weather: &'a [OwWeather],
    wind: &'a OwWind,
    visibility: Option<u32>,
    precipitation_mm: f64,
}

impl OwPoint<'_> {
    fn normalize(&self) -> WeatherDataPoint {
        let (condition, condition_text) = self
            .weather
            .first()
            .map(|w| (WeatherCondition::from_owm(w.id), w.description.clone()))
            .unwrap_or_else(|| (WeatherCondition::Unknown, "Unknown".to_string()));

        WeatherDataPoint {
            timestamp: DateTime::from_timestamp(self.dt, 0).unwrap_or_else(Utc::now),
            temperature_c: self.main.temp,
            feels_like_c: self.main.feels_like,
            humidity_pct: humidity_pct(self.main.humidity),
            wind_speed_mps: self.wind.speed,
            wind_direction_deg: wind_direction_deg(self.wind.deg),
            pressure_hpa: self.main.pressure,
            visibility_m: self.visibility,
            condition,
            condition_text,
            precipitation_mm: self.precipitation_mm,
        }
    }
}

fn parse_current(body: &str) -> Result<WeatherDataPoint> {
    let parsed: OwCurrentResponse = parse_json(NAME, body)?;
    Ok(OwPoint {
        dt: parsed.dt,
        main: &parsed.main,
        weather: &parsed.weather,
        wind: &parsed.wind,
        visibility: parsed.visibility,
        precipitation_mm: parsed.rain.amount() + parsed.snow.amount(),
    }
    .normalize())
}

fn parse_forecast(body: &str, days: u8, now: DateTime<Utc>) -> Result<WeatherForecast> {
    let parsed: OwForecastResponse = parse_json(NAME, body)?;
    let horizon = now + Duration::days(i64::from(days));

    let entries = parsed
        .list
        .iter()
        .filter(|e| e.dt <= horizon.timestamp())
        .map(|e| {
            OwPoint {
                dt: e.dt,
                main: &e.main,
                weather: &e.weather,
                wind: &e.wind,
                visibility: e.visibility,
                precipitation_mm: e.rain.amount() + e.snow.amount(),
            }
            .normalize()
        })
        .collect::<Vec<_>>();

    if entries.is_empty() {
        return Err(WeatherError::Provider(
            "OpenWeather forecast response contained no data".to_string(),
        ));
    }

    let location = format!("{}, {}", parsed.city.name, parsed.city.country);
    WeatherForecast::new(location, days, now, entries)
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_weather(&self, location: &str) -> Result<WeatherDataPoint> {
        debug!(provider = NAME, location, "fetching current weather");
        let body = fetch_body(NAME, &self.gate, self.request("weather", location), location).await?;
        parse_current(&body)
    }

    async fn get_forecast(&self, location: &str, days: u8) -> Result<WeatherForecast> {
        debug!(provider = NAME, location, days, "fetching forecast");
        let body = fetch_body(NAME, &self.gate, self.request("forecast", location), location).await?;
        parse_forecast(&body, days, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RawSettings;

    const CURRENT: &str = r#"{
        "dt": 1700000000,
        "name": "Rome",
        "main": {"temp": 18.4, "feels_like": 17.9, "humidity": 63, "pressure": 1016},
        "weather": [{"id": 500, "description": "light rain"}],
        "wind": {"speed": 4.1, "deg": 220},
        "visibility": 9000,
        "rain": {"1h": 0.6}
    }"#;

    #[test]
    fn parses_current_conditions() {
        let point = parse_current(CURRENT).unwrap();
        assert_eq!(point.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(point.temperature_c, 18.4);
        assert_eq!(point.humidity_pct, 63);
        assert_eq!(point.wind_direction_deg, 220);
        assert_eq!(point.condition, WeatherCondition::Rain);
        assert_eq!(point.condition_text, "light rain");
        assert_eq!(point.visibility_m, Some(9000));
        assert_eq!(point.precipitation_mm, 0.6);
    }

    #[test]
    fn forecast_is_cut_at_requested_horizon() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let entry = |dt: i64| {
            format!(
                r#"{{"dt": {dt}, "main": {{"temp": 10, "feels_like": 9, "humidity": 80, "pressure": 1000}},
                    "weather": [{{"id": 800, "description": "clear sky"}}], "wind": {{"speed": 2}}}}"#
            )
        };
        let body = format!(
            r#"{{"city": {{"name": "Rome", "country": "IT"}}, "list": [{}, {}, {}]}}"#,
            entry(1_700_000_000 + 3 * 3600),
            entry(1_700_000_000 + 20 * 3600),
            entry(1_700_000_000 + 30 * 3600),
        );

        let fc = parse_forecast(&body, 1, now).unwrap();
        assert_eq!(fc.location, "Rome, IT");
        assert_eq!(fc.entries().len(), 2);
        assert_eq!(fc.days, 1);
    }

    #[test]
    fn malformed_body_is_a_provider_error() {
        let err = parse_current("<html>").unwrap_err();
        assert!(matches!(err, WeatherError::Provider(_)));
    }

    #[test]
    fn create_requires_api_key() {
        let plugin = OpenWeatherPlugin;
        let problems = plugin.descriptor().settings.validate(&RawSettings::new()).unwrap_err();
        assert!(problems[0].contains("api_key"));

        let mut raw = RawSettings::new();
        raw.insert("api_key".into(), "KEY".into());
        let settings = plugin.descriptor().settings.validate(&raw).unwrap();
        let provider = plugin.create(&settings).unwrap();
        assert_eq!(provider.name(), "openweather");
    }
}
