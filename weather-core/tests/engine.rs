use std::{
    fs,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;
use weather_core::{
    Config, EngineEvent, ProviderDescriptor, ProviderPlugin, Result, WeatherDataPoint,
    WeatherEngine, WeatherError, WeatherForecast, WeatherProvider,
    legacy::{LegacyClass, LegacyError, LegacyOperations, LegacyRecord, LegacyWeatherSource},
    model::WeatherCondition,
    provider::{Capabilities, ForecastDays},
    settings::{ProviderSettings, SettingField, SettingType, SettingsSchema},
};

#[derive(Debug)]
struct Canned {
    name: String,
    error: Option<WeatherError>,
    calls: AtomicU32,
}

impl Canned {
    fn point(&self) -> WeatherDataPoint {
        WeatherDataPoint {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            temperature_c: 12.5,
            feels_like_c: 11.0,
            humidity_pct: 70,
            wind_speed_mps: 3.2,
            wind_direction_deg: 90,
            pressure_hpa: 1009.0,
            visibility_m: Some(10_000),
            condition: WeatherCondition::Clouds,
            condition_text: format!("served by {}", self.name),
            precipitation_mm: 0.0,
        }
    }

    fn answer<T>(&self, ok: T) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(ok),
        }
    }
}

#[async_trait]
impl WeatherProvider for Canned {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_current_weather(&self, _location: &str) -> Result<WeatherDataPoint> {
        self.answer(self.point())
    }

    async fn get_forecast(&self, location: &str, days: u8) -> Result<WeatherForecast> {
        let forecast = WeatherForecast::new(location, days, Utc::now(), vec![self.point()])?;
        self.answer(forecast)
    }
}

struct CannedPlugin {
    descriptor: ProviderDescriptor,
    instance: Arc<Canned>,
}

impl ProviderPlugin for CannedPlugin {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn create(&self, _settings: &ProviderSettings) -> Result<Arc<dyn WeatherProvider>> {
        Ok(Arc::clone(&self.instance) as Arc<dyn WeatherProvider>)
    }
}

fn canned(name: &str, error: Option<WeatherError>) -> (Arc<dyn ProviderPlugin>, Arc<Canned>) {
    let instance = Arc::new(Canned {
        name: name.to_string(),
        error,
        calls: AtomicU32::new(0),
    });
    let plugin = CannedPlugin {
        descriptor: ProviderDescriptor {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            version: "1.0.0".into(),
            author: "tests".into(),
            description: "canned answers".into(),
            settings: SettingsSchema::default(),
            capabilities: Capabilities {
                forecast: true,
                ..Default::default()
            },
            forecast_days: ForecastDays::default(),
        },
        instance: Arc::clone(&instance),
    };
    (Arc::new(plugin), instance)
}

/// Config isolated from the real user plugin directory.
fn config(plugins: &TempDir, order: &[&str]) -> Config {
    let mut cfg = Config {
        user_plugin_dir: Some(plugins.path().to_path_buf()),
        ..Config::default()
    };
    cfg.set_fallback_order(order.iter().map(|s| s.to_string()).collect())
        .unwrap();
    cfg
}

#[tokio::test]
async fn falls_back_and_disabling_invalidates_cache() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, &["alpha", "beta"]);
    let (alpha, alpha_calls) = canned("alpha", Some(WeatherError::Auth("revoked".into())));
    let (beta, beta_calls) = canned("beta", None);

    let engine = WeatherEngine::builder(&cfg)
        .plugin(alpha)
        .plugin(beta)
        .without_sweeper()
        .build()
        .unwrap();
    let mut events = engine.subscribe();

    let served = engine
        .dispatcher()
        .get_current_weather("Lisbon", None)
        .await
        .unwrap();
    assert_eq!(served.provider, "beta");
    assert_eq!(served.data.condition_text, "served by beta");
    assert_eq!(alpha_calls.calls.load(Ordering::SeqCst), 1);

    match events.try_recv().unwrap() {
        EngineEvent::ProviderFallback { from, to, .. } => {
            assert_eq!((from.as_str(), to.as_str()), ("alpha", "beta"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let again = engine
        .dispatcher()
        .get_current_weather("lisbon", None)
        .await
        .unwrap();
    assert!(again.cached);
    assert_eq!(beta_calls.calls.load(Ordering::SeqCst), 1);

    assert_eq!(engine.disable_provider("beta").unwrap(), 1);
    assert!(engine.cache().is_empty());

    let err = engine
        .dispatcher()
        .get_current_weather("Lisbon", None)
        .await
        .unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].provider, "alpha");
    assert!(err.to_string().contains("revoked"));
}

#[tokio::test]
async fn misconfigured_providers_are_left_out_of_the_order() {
    let dir = TempDir::new().unwrap();
    // weatherapi needs an api key and none is configured
    let cfg = config(&dir, &["weatherapi", "ghost", "openmeteo"]);

    let engine = WeatherEngine::builder(&cfg).without_sweeper().build().unwrap();

    assert_eq!(engine.dispatcher().fallback_order().names(), ["openmeteo"]);
    let excluded: Vec<_> = engine.excluded().iter().map(|e| e.provider.as_str()).collect();
    assert_eq!(excluded, ["weatherapi", "ghost"]);
    assert!(matches!(
        engine.excluded()[0].error,
        WeatherError::Configuration { .. }
    ));
    assert!(engine.registry().active("openmeteo").is_some());
}

struct Barometer;

impl LegacyWeatherSource for Barometer {
    fn operations(&self) -> LegacyOperations {
        LegacyOperations {
            current: true,
            ..Default::default()
        }
    }

    fn fetch_current(&self, _location: &str) -> std::result::Result<LegacyRecord, LegacyError> {
        match json!({"temperature": 4, "condition": "Snow showers", "timestamp": 1_700_000_000}) {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(LegacyError::Other("not an object".into())),
        }
    }
}

#[tokio::test]
async fn legacy_provider_missing_an_operation() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, &["barometer"]);
    cfg.upsert_setting("barometer", "station", "LPPT");

    let schema = SettingsSchema::new(vec![
        SettingField::new("station", SettingType::String, "Station").required(),
    ]);
    let class = LegacyClass::new("Barometer", Barometer.operations(), |settings| {
        match settings.str("station") {
            Some(_) => Ok(Arc::new(Barometer) as Arc<dyn LegacyWeatherSource>),
            None => Err(LegacyError::Other("station missing".into())),
        }
    })
    .with_settings(schema);

    let engine = WeatherEngine::builder(&cfg)
        .legacy("barometer", class)
        .without_sweeper()
        .build()
        .unwrap();

    let err = engine
        .dispatcher()
        .get_forecast("Lisbon", 3, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.failures()[0].error,
        WeatherError::UnsupportedOperation { .. }
    ));
    assert!(engine.cache().is_empty());

    let served = engine
        .dispatcher()
        .get_current_weather("Lisbon", None)
        .await
        .unwrap();
    assert_eq!(served.provider, "barometer");
    assert_eq!(served.data.temperature_c, 4.0);
    assert_eq!(served.data.condition, WeatherCondition::Snow);
    assert_eq!(engine.cache().len(), 1);
}

#[tokio::test]
async fn discovered_manifests_join_the_engine() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("meteo-de.toml"),
        "name = \"meteo-de\"\nbackend = \"openmeteo\"\nmax_days = 7\n[defaults]\nlanguage = \"de\"\n",
    )
    .unwrap();
    fs::write(dir.path().join("half-written.toml"), "name = \"x\"\nbackend = ").unwrap();

    let cfg = config(&dir, &["meteo-de"]);
    let engine = WeatherEngine::from_config(&cfg).unwrap();

    assert_eq!(engine.dispatcher().fallback_order().names(), ["meteo-de"]);
    assert!(engine.registry().active("meteo-de").is_some());

    let failures = engine.registry().load_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].name, "half-written");

    fs::remove_file(dir.path().join("half-written.toml")).unwrap();
    fs::write(
        dir.path().join("meteo-de.toml"),
        "name = \"meteo-de\"\nbackend = \"openmeteo\"\nmax_days = 5\n",
    )
    .unwrap();
    engine.disable_provider("meteo-de").unwrap();
    engine.rescan();
    assert!(engine.registry().load_failures().is_empty());

    // the edit neither re-enables nor deactivates it
    assert_eq!(engine.registry().descriptor("meteo-de").unwrap().forecast_days.max, 5);
    assert!(!engine.registry().is_enabled("meteo-de"));
    engine.enable_provider("meteo-de").unwrap();
    assert!(engine.registry().active("meteo-de").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_engine() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, &["alpha"]);
    let (alpha, calls) = canned("alpha", None);

    let engine = Arc::new(
        WeatherEngine::builder(&cfg)
            .plugin(alpha)
            .build()
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            let location = format!("city-{}", i % 4);
            engine
                .dispatcher()
                .get_forecast(&location, 3, None)
                .await
                .map(|served| served.data.days)
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 3);
    }
    assert_eq!(engine.cache().len(), 4);
    assert!(calls.calls.load(Ordering::SeqCst) >= 4);
}
