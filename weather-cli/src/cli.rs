use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use inquire::{Confirm, Password, Text};
use weather_core::{
    Config, WeatherDataPoint, WeatherEngine, WeatherError,
    alert::{AlertThresholds, purge_expired},
    model::MAX_FORECAST_DAYS,
    registry::PluginRegistry,
    settings::{SettingField, SettingType, SettingValue},
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "Weather CLI")]
pub struct Cli {
    /// Log debug output to stderr (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure settings (API key, language, ...) for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "weatherapi".
        provider: String,
    },

    /// Show weather for an address.
    Show {
        /// Address or location name.
        address: String,

        /// Optional date/time ("2024-05-01" or "2024-05-01 15:00"); if absent, means "now".
        #[arg(long)]
        date: Option<String>,

        /// Ask this provider first.
        #[arg(long, short)]
        provider: Option<String>,
    },

    /// Multi-day forecast for an address.
    Forecast {
        address: String,

        #[arg(long, short, default_value_t = 3)]
        days: u8,

        #[arg(long, short)]
        provider: Option<String>,
    },

    /// Air quality for an address.
    Air {
        address: String,

        #[arg(long, short)]
        provider: Option<String>,
    },

    /// Active weather alerts for an address.
    Alerts {
        address: String,

        #[arg(long, short)]
        provider: Option<String>,
    },

    /// List providers, or enable/disable one.
    Providers {
        #[arg(long, conflicts_with = "disable")]
        enable: Option<String>,

        #[arg(long)]
        disable: Option<String>,
    },

    /// Print the fallback order, or replace it.
    Order {
        /// New order, e.g. `weather order weatherapi openmeteo`.
        providers: Vec<String>,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let mut cfg = Config::load()?;

        match self.command {
            Command::Configure { provider } => configure(&mut cfg, &provider)?,
            Command::Show {
                address,
                date,
                provider,
            } => {
                let engine = engine(&cfg)?;
                let when = date.as_deref().map(parse_when).transpose()?;
                show(&engine, &address, when, provider.as_deref()).await?;
            }
            Command::Forecast {
                address,
                days,
                provider,
            } => {
                let engine = engine(&cfg)?;
                let served = engine
                    .dispatcher()
                    .get_forecast(&address, days, provider.as_deref())
                    .await?;

                println!(
                    "{} - {} day(s) (via {}{})",
                    served.data.location,
                    served.data.days,
                    served.provider,
                    cached_marker(served.cached)
                );
                for entry in served.data.entries() {
                    print_point(entry);
                }
            }
            Command::Air { address, provider } => {
                let engine = engine(&cfg)?;
                let served = engine
                    .dispatcher()
                    .get_air_quality(&address, provider.as_deref())
                    .await?;
                let r = &served.data;

                println!(
                    "Air quality for {address} (via {}{})",
                    served.provider,
                    cached_marker(served.cached)
                );
                println!("  AQI:   {}", r.aqi);
                println!("  PM2.5: {}", optional(r.pm2_5, "µg/m³"));
                println!("  PM10:  {}", optional(r.pm10, "µg/m³"));
                println!("  O3:    {}", optional(r.o3, "µg/m³"));
                println!("  NO2:   {}", optional(r.no2, "µg/m³"));
            }
            Command::Alerts { address, provider } => {
                let engine = engine(&cfg)?;
                alerts(&engine, &address, provider.as_deref()).await?;
            }
            Command::Providers { enable, disable } => {
                if let Some(name) = enable.or(disable.clone()) {
                    let enabled = disable.is_none();
                    let registry = registry(&cfg);
                    if registry.descriptor(&name).is_none() {
                        bail!("Unknown provider '{name}'. Run `weather providers` to list them.");
                    }
                    cfg.set_enabled(&name, enabled);
                    cfg.save()?;
                    println!("{name} {}", if enabled { "enabled" } else { "disabled" });
                } else {
                    let engine = WeatherEngine::from_config(&cfg)?;
                    list_providers(&cfg, &engine);
                }
            }
            Command::Order { providers } => {
                if providers.is_empty() {
                    println!("{}", cfg.fallback_order.join(" -> "));
                } else {
                    let registry = registry(&cfg);
                    for name in &providers {
                        if registry.descriptor(name).is_none() {
                            bail!("Unknown provider '{name}'. Run `weather providers` to list them.");
                        }
                    }
                    cfg.set_fallback_order(providers)?;
                    cfg.save()?;
                    println!("Fallback order: {}", cfg.fallback_order.join(" -> "));
                }
            }
        }

        Ok(())
    }
}

fn engine(cfg: &Config) -> anyhow::Result<WeatherEngine> {
    if cfg.fallback_order.is_empty() {
        return Err(anyhow!(
            "No provider configured.\n\
             Hint: run `weather configure <provider>` (e.g. `weather configure openmeteo`) first."
        ));
    }

    let engine = WeatherEngine::from_config(cfg)?;
    for excluded in engine.excluded() {
        eprintln!("warning: {} is unavailable: {}", excluded.provider, excluded.error);
    }
    Ok(engine)
}

/// Registry with built-ins and discovered plugins, without activating anything.
fn registry(cfg: &Config) -> PluginRegistry {
    let registry = PluginRegistry::new(cfg.plugin_dirs(), Default::default());
    registry.register_builtins();
    registry.discover();
    registry
}

fn configure(cfg: &mut Config, provider: &str) -> anyhow::Result<()> {
    let registry = registry(cfg);
    let descriptor = registry.descriptor(provider).ok_or_else(|| {
        anyhow!(
            "Unknown provider '{provider}'. Known providers: {}",
            registry.names().join(", ")
        )
    })?;

    println!("Configuring {} ({})", descriptor.display_name, descriptor.name);
    if descriptor.settings.is_empty() {
        println!("{} needs no settings.", descriptor.display_name);
    }

    let existing = cfg.provider_settings(provider).cloned().unwrap_or_default();
    for field in descriptor.settings.fields() {
        let current = existing.get(&field.key).or(field.default.as_ref());
        if let Some(value) = prompt_field(field, current)? {
            cfg.upsert_setting(provider, &field.key, value);
        }
    }
    // a provider without settings still joins the fallback order
    if !cfg.fallback_order.iter().any(|p| p == provider) {
        let mut order = cfg.fallback_order.clone();
        order.push(provider.to_string());
        cfg.set_fallback_order(order)?;
    }

    let raw = cfg.provider_settings(provider).cloned().unwrap_or_default();
    if let Err(problems) = descriptor.settings.validate(&raw) {
        bail!("Configuration for {provider} is incomplete: {}", problems.join("; "));
    }

    cfg.save()?;
    println!("Saved to {}", Config::config_file_path()?.display());
    Ok(())
}

fn prompt_field(
    field: &SettingField,
    current: Option<&SettingValue>,
) -> anyhow::Result<Option<SettingValue>> {
    let label = format!("{}:", field.display_name);
    let help = (!field.description.is_empty()).then_some(field.description.as_str());

    let answer = match field.kind {
        SettingType::Boolean => {
            let default = matches!(current, Some(SettingValue::Boolean(true)));
            let mut prompt = Confirm::new(&label).with_default(default);
            if let Some(help) = help {
                prompt = prompt.with_help_message(help);
            }
            return Ok(Some(SettingValue::Boolean(prompt.prompt()?)));
        }
        _ if field.secret => {
            let mut prompt = Password::new(&label).without_confirmation();
            if let Some(help) = help {
                prompt = prompt.with_help_message(help);
            }
            prompt.prompt()?
        }
        _ => {
            let default = match current {
                Some(SettingValue::String(s)) => s.clone(),
                Some(SettingValue::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            let mut prompt = Text::new(&label).with_default(&default);
            if let Some(help) = help {
                prompt = prompt.with_help_message(help);
            }
            prompt.prompt()?
        }
    };

    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(None);
    }

    match field.kind {
        SettingType::Number => {
            let n: f64 = answer
                .parse()
                .with_context(|| format!("'{}' must be a number", field.key))?;
            Ok(Some(SettingValue::Number(n)))
        }
        _ => Ok(Some(SettingValue::String(answer.to_string()))),
    }
}

async fn show(
    engine: &WeatherEngine,
    address: &str,
    when: Option<DateTime<Utc>>,
    provider: Option<&str>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let Some(when) = when.filter(|w| (*w - now).num_minutes().abs() > 90) else {
        let served = engine.dispatcher().get_current_weather(address, provider).await?;
        println!(
            "Weather for {address} now (via {}{})",
            served.provider,
            cached_marker(served.cached)
        );
        print_point(&served.data);
        return Ok(());
    };

    if when < now {
        bail!("Historical weather is not available; pick a date from today on.");
    }
    let days_ahead = (when.date_naive() - now.date_naive()).num_days() + 1;
    let days = u8::try_from(days_ahead)
        .ok()
        .filter(|d| *d <= MAX_FORECAST_DAYS)
        .ok_or_else(|| anyhow!("Forecasts reach at most {MAX_FORECAST_DAYS} days ahead"))?;

    let served = engine.dispatcher().get_forecast(address, days, provider).await?;
    let point = served
        .data
        .closest_to(when)
        .ok_or_else(|| anyhow!("{} returned an empty forecast", served.provider))?;

    println!(
        "Weather for {address} at {} (via {}{})",
        when.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        served.provider,
        cached_marker(served.cached)
    );
    print_point(point);
    Ok(())
}

async fn alerts(
    engine: &WeatherEngine,
    address: &str,
    provider: Option<&str>,
) -> anyhow::Result<()> {
    let now = Utc::now();

    let (mut alerts, source) = match engine.dispatcher().get_alerts(address, provider).await {
        Ok(served) => (served.data, served.provider),
        Err(err @ WeatherError::AllProvidersFailed(_)) => {
            let only_unsupported = err
                .failures()
                .iter()
                .all(|f| matches!(f.error, WeatherError::UnsupportedOperation { .. }));
            if !only_unsupported {
                return Err(err.into());
            }
            // nobody issues alerts here; derive them from current conditions
            let served = engine.dispatcher().get_current_weather(address, provider).await?;
            let derived = AlertThresholds::default().derive(&served.data);
            (derived, format!("{}, derived", served.provider))
        }
        Err(err) => return Err(err.into()),
    };

    purge_expired(&mut alerts, now);
    alerts.sort_by(|a, b| b.severity.cmp(&a.severity));

    if alerts.is_empty() {
        println!("No active alerts for {address} (via {source})");
        return Ok(());
    }

    println!("Alerts for {address} (via {source})");
    for alert in &alerts {
        println!(
            "  [{:?}] {} ({} - {})",
            alert.severity,
            alert.description,
            alert.starts_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            alert.ends_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn list_providers(cfg: &Config, engine: &WeatherEngine) {
    let registry = engine.registry();
    let order = engine.dispatcher().fallback_order();

    for descriptor in registry.descriptors() {
        let name = descriptor.name.as_str();
        let status = if !registry.is_enabled(name) {
            "disabled"
        } else if registry.active(name).is_some() {
            "active"
        } else {
            "not configured"
        };
        let position = order
            .names()
            .iter()
            .position(|n| n == name)
            .map(|i| format!("#{}", i + 1))
            .unwrap_or_else(|| "-".to_string());

        let caps = descriptor.capabilities;
        let mut features = vec!["current"];
        if caps.forecast {
            features.push("forecast");
        }
        if caps.air_quality {
            features.push("air");
        }
        if caps.alerts {
            features.push("alerts");
        }

        println!(
            "{position:>3} {name:<14} {status:<15} {} v{} [{}] ttl {}s",
            descriptor.display_name,
            descriptor.version,
            features.join(", "),
            cfg.ttl_for(name).as_secs()
        );
    }

    for failure in registry.load_failures() {
        println!(
            "  ! {} ({}): {}",
            failure.name,
            failure.source.display(),
            failure.reason
        );
    }
}

fn print_point(p: &WeatherDataPoint) {
    println!(
        "  {}  {:>5.1}°C (feels {:.1}°C)  {}",
        p.timestamp.with_timezone(&Local).format("%a %d %b %H:%M"),
        p.temperature_c,
        p.feels_like_c,
        p.condition_text
    );
    println!(
        "      humidity {}%  wind {:.1} m/s @ {}°  pressure {:.0} hPa  precip {:.1} mm{}",
        p.humidity_pct,
        p.wind_speed_mps,
        p.wind_direction_deg,
        p.pressure_hpa,
        p.precipitation_mm,
        p.visibility_m
            .map(|v| format!("  visibility {v} m"))
            .unwrap_or_default()
    );
}

fn cached_marker(cached: bool) -> &'static str {
    if cached { ", cached" } else { "" }
}

fn optional(value: Option<f64>, unit: &str) -> String {
    value
        .map(|v| format!("{v:.1} {unit}"))
        .unwrap_or_else(|| "n/a".to_string())
}

/// Parse "YYYY-MM-DD", "YYYY-MM-DD HH:MM" (local time) or RFC 3339.
fn parse_when(input: &str) -> anyhow::Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = match NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M"))
    {
        Ok(naive) => naive,
        // a bare date means midday
        Err(_) => NaiveDate::parse_from_str(input, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .ok_or_else(|| anyhow!("Could not parse date '{input}'"))?,
    };

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("'{input}' does not exist in the local time zone"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_show_with_provider() {
        let cli = Cli::try_parse_from(["weather", "show", "Rome", "--provider", "openmeteo", "-v"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Show { address, provider, date } => {
                assert_eq!(address, "Rome");
                assert_eq!(provider.as_deref(), Some("openmeteo"));
                assert!(date.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn providers_flags_conflict() {
        let parsed =
            Cli::try_parse_from(["weather", "providers", "--enable", "a", "--disable", "b"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn date_formats() {
        assert_eq!(
            parse_when("2024-05-01T10:00:00Z").unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        assert!(parse_when("2024-05-01").is_ok());
        assert!(parse_when("2024-05-01 15:30").is_ok());
        assert!(parse_when("tomorrow-ish").is_err());
    }
}
