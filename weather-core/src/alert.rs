//! Weather alerts: provider-issued or derived from thresholds on a data point.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{WeatherCondition, WeatherDataPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Precipitation,
    Wind,
    Temperature,
    Travel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherAlert {
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub description: String,
}

impl WeatherAlert {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now <= self.ends_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.ends_at
    }
}

/// Drop every alert whose window has closed. Returns how many were removed.
pub fn purge_expired(alerts: &mut Vec<WeatherAlert>, now: DateTime<Utc>) -> usize {
    let before = alerts.len();
    alerts.retain(|a| !a.is_expired(now));
    before - alerts.len()
}

/// Limits used to derive alerts from a single observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub heat_c: f64,
    pub extreme_heat_c: f64,
    pub frost_c: f64,
    pub high_wind_mps: f64,
    pub storm_wind_mps: f64,
    pub heavy_precipitation_mm: f64,
    pub low_visibility_m: u32,
    /// How long a derived alert stays in effect after the observation.
    pub validity_hours: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            heat_c: 32.0,
            extreme_heat_c: 40.0,
            frost_c: 0.0,
            high_wind_mps: 14.0,
            storm_wind_mps: 25.0,
            heavy_precipitation_mm: 10.0,
            low_visibility_m: 1_000,
            validity_hours: 3,
        }
    }
}

impl AlertThresholds {
    pub fn derive(&self, point: &WeatherDataPoint) -> Vec<WeatherAlert> {
        let starts_at = point.timestamp;
        let ends_at = starts_at + Duration::hours(self.validity_hours);
        let alert = |severity, category, description: String| WeatherAlert {
            severity,
            category,
            starts_at,
            ends_at,
            description,
        };

        let mut alerts = Vec::new();

        if point.temperature_c >= self.extreme_heat_c {
            alerts.push(alert(
                AlertSeverity::Critical,
                AlertCategory::Temperature,
                format!("Extreme heat: {:.1}°C", point.temperature_c),
            ));
        } else if point.temperature_c >= self.heat_c {
            alerts.push(alert(
                AlertSeverity::Warning,
                AlertCategory::Temperature,
                format!("High temperature: {:.1}°C", point.temperature_c),
            ));
        } else if point.temperature_c <= self.frost_c {
            alerts.push(alert(
                AlertSeverity::Warning,
                AlertCategory::Temperature,
                format!("Frost: {:.1}°C", point.temperature_c),
            ));
        }

        if point.wind_speed_mps >= self.storm_wind_mps {
            alerts.push(alert(
                AlertSeverity::Error,
                AlertCategory::Wind,
                format!("Storm-force wind: {:.1} m/s", point.wind_speed_mps),
            ));
        } else if point.wind_speed_mps >= self.high_wind_mps {
            alerts.push(alert(
                AlertSeverity::Warning,
                AlertCategory::Wind,
                format!("Strong wind: {:.1} m/s", point.wind_speed_mps),
            ));
        }

        if point.precipitation_mm >= self.heavy_precipitation_mm {
            alerts.push(alert(
                AlertSeverity::Warning,
                AlertCategory::Precipitation,
                format!("Heavy precipitation: {:.1} mm", point.precipitation_mm),
            ));
        }

        if matches!(
            point.condition,
            WeatherCondition::Thunderstorm | WeatherCondition::Tornado | WeatherCondition::Hurricane
        ) {
            alerts.push(alert(
                AlertSeverity::Critical,
                AlertCategory::Travel,
                format!("Severe weather: {}", point.condition_text),
            ));
        }

        if point.visibility_m.is_some_and(|v| v < self.low_visibility_m) {
            alerts.push(alert(
                AlertSeverity::Info,
                AlertCategory::Travel,
                "Reduced visibility".to_string(),
            ));
        }

        alerts
    }
}
