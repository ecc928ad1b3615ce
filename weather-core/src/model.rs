use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    alert::WeatherAlert,
    error::{Result, WeatherError},
};

/// Upper bound on forecast length accepted anywhere in the engine.
pub const MAX_FORECAST_DAYS: u8 = 14;

/// Used when a source reports no pressure for a forecast step.
pub const STANDARD_PRESSURE_HPA: f64 = 1013.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    Clear,
    Clouds,
    Fog,
    Drizzle,
    Rain,
    Snow,
    Thunderstorm,
    Mist,
    Smoke,
    Haze,
    Dust,
    Sand,
    Ash,
    Squall,
    Tornado,
    Hurricane,
    Unknown,
}

impl WeatherCondition {
    /// Map a WMO weather interpretation code (used by Open-Meteo).
    pub fn from_wmo(code: u16) -> Self {
        match code {
            0 | 1 => WeatherCondition::Clear,
            2 | 3 => WeatherCondition::Clouds,
            45 | 48 => WeatherCondition::Fog,
            51..=57 => WeatherCondition::Drizzle,
            61..=67 | 80..=82 => WeatherCondition::Rain,
            71..=77 | 85 | 86 => WeatherCondition::Snow,
            95..=99 => WeatherCondition::Thunderstorm,
            _ => WeatherCondition::Unknown,
        }
    }

    /// Map an OpenWeatherMap condition id (2xx thunderstorm, 3xx drizzle, ...).
    pub fn from_owm(id: u16) -> Self {
        match id {
            200..=299 => WeatherCondition::Thunderstorm,
            300..=399 => WeatherCondition::Drizzle,
            500..=599 => WeatherCondition::Rain,
            600..=699 => WeatherCondition::Snow,
            701 => WeatherCondition::Mist,
            711 => WeatherCondition::Smoke,
            721 => WeatherCondition::Haze,
            731 | 761 => WeatherCondition::Dust,
            741 => WeatherCondition::Fog,
            751 => WeatherCondition::Sand,
            762 => WeatherCondition::Ash,
            771 => WeatherCondition::Squall,
            781 => WeatherCondition::Tornado,
            800 => WeatherCondition::Clear,
            801..=804 => WeatherCondition::Clouds,
            _ => WeatherCondition::Unknown,
        }
    }

    /// Best-effort classification of free text such as "Light rain shower".
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        const KEYWORDS: &[(&str, WeatherCondition)] = &[
            ("hurricane", WeatherCondition::Hurricane),
            ("tornado", WeatherCondition::Tornado),
            ("thunder", WeatherCondition::Thunderstorm),
            ("squall", WeatherCondition::Squall),
            ("drizzle", WeatherCondition::Drizzle),
            ("sleet", WeatherCondition::Snow),
            ("snow", WeatherCondition::Snow),
            ("blizzard", WeatherCondition::Snow),
            ("rain", WeatherCondition::Rain),
            ("shower", WeatherCondition::Rain),
            ("fog", WeatherCondition::Fog),
            ("mist", WeatherCondition::Mist),
            ("haze", WeatherCondition::Haze),
            ("smoke", WeatherCondition::Smoke),
            ("dust", WeatherCondition::Dust),
            ("sand", WeatherCondition::Sand),
            ("ash", WeatherCondition::Ash),
            ("overcast", WeatherCondition::Clouds),
            ("cloud", WeatherCondition::Clouds),
            ("clear", WeatherCondition::Clear),
            ("sunny", WeatherCondition::Clear),
        ];

        KEYWORDS
            .iter()
            .find(|(kw, _)| lower.contains(kw))
            .map(|(_, c)| *c)
            .unwrap_or(WeatherCondition::Unknown)
    }
}

/// A single normalized observation or forecast step. Units are metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherDataPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub humidity_pct: u8,
    pub wind_speed_mps: f64,
    pub wind_direction_deg: u16,
    pub pressure_hpa: f64,
    pub visibility_m: Option<u32>,
    pub condition: WeatherCondition,
    pub condition_text: String,
    #[serde(default)]
    pub precipitation_mm: f64,
}

/// Clamp a provider-reported humidity into 0..=100.
pub fn humidity_pct(raw: f64) -> u8 {
    raw.round().clamp(0.0, 100.0) as u8
}

/// Normalize a wind bearing into 0..360.
pub fn wind_direction_deg(raw: f64) -> u16 {
    (raw.round() as i64).rem_euclid(360) as u16
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherForecast {
    pub location: String,
    pub days: u8,
    pub issued_at: DateTime<Utc>,
    entries: Vec<WeatherDataPoint>,
}

impl WeatherForecast {
    /// Builds a forecast, sorting entries chronologically and dropping
    /// entries whose timestamp was already seen.
    pub fn new(
        location: impl Into<String>,
        days: u8,
        issued_at: DateTime<Utc>,
        mut entries: Vec<WeatherDataPoint>,
    ) -> Result<Self> {
        if days == 0 || days > MAX_FORECAST_DAYS {
            return Err(WeatherError::InvalidParameter(format!(
                "forecast length must be between 1 and {MAX_FORECAST_DAYS} days, got {days}"
            )));
        }

        entries.sort_by_key(|e| e.timestamp);
        entries.dedup_by_key(|e| e.timestamp);

        Ok(Self {
            location: location.into(),
            days,
            issued_at,
            entries,
        })
    }

    pub fn entries(&self) -> &[WeatherDataPoint] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry closest to `when`, if any.
    pub fn closest_to(&self, when: DateTime<Utc>) -> Option<&WeatherDataPoint> {
        self.entries
            .iter()
            .min_by_key(|e| (e.timestamp - when).num_seconds().abs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityReading {
    pub timestamp: DateTime<Utc>,
    /// US EPA style index.
    pub aqi: u16,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub o3: Option<f64>,
    pub no2: Option<f64>,
}

/// Query kinds understood by providers and the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Current,
    Forecast,
    AirQuality,
    Alerts,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Current => "current weather",
            QueryKind::Forecast => "forecast",
            QueryKind::AirQuality => "air quality",
            QueryKind::Alerts => "alerts",
        }
    }
}

/// Any payload a provider can produce; this is what the cache stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WeatherData {
    Current(WeatherDataPoint),
    Forecast(WeatherForecast),
    AirQuality(AirQualityReading),
    Alerts(Vec<WeatherAlert>),
}

impl WeatherData {
    pub fn kind(&self) -> QueryKind {
        match self {
            WeatherData::Current(_) => QueryKind::Current,
            WeatherData::Forecast(_) => QueryKind::Forecast,
            WeatherData::AirQuality(_) => QueryKind::AirQuality,
            WeatherData::Alerts(_) => QueryKind::Alerts,
        }
    }
}
