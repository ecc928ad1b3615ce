//! Provider resolution: cache lookup, then the fallback chain with retries.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tracing::{debug, info, instrument, warn};

use crate::{
    alert::WeatherAlert,
    cache::{CacheKey, WeatherCache},
    error::{ProviderFailure, Result, WeatherError},
    events::{EngineEvent, EventBus},
    model::{
        AirQualityReading, MAX_FORECAST_DAYS, QueryKind, WeatherData, WeatherDataPoint,
        WeatherForecast,
    },
    provider::{ProviderDescriptor, WeatherProvider},
    registry::PluginRegistry,
};

/// Ordered provider names tried after the caller's preferred provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackOrder(Vec<String>);

impl FallbackOrder {
    pub fn new(names: Vec<String>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(WeatherError::InvalidParameter(format!(
                    "provider '{name}' appears twice in the fallback order"
                )));
            }
        }
        Ok(Self(names))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls made to one provider before moving on, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempt`-th failed call (1-based): the base delay
    /// doubled per attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exp).min(self.max_delay)
    }

    /// Like [`RetryPolicy::delay_for`], raised to the provider's own
    /// `retry_after` hint when it asks for longer.
    pub fn delay_after(&self, attempt: u32, err: &WeatherError) -> Duration {
        let backoff = self.delay_for(attempt);
        match err {
            WeatherError::RateLimited {
                retry_after: Some(after),
                ..
            } => backoff.max(*after).min(self.max_delay),
            _ => backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub default_ttl: Duration,
    pub provider_ttls: HashMap<String, Duration>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            default_ttl: Duration::from_secs(600),
            provider_ttls: HashMap::new(),
        }
    }
}

impl DispatchPolicy {
    pub fn ttl_for(&self, provider: &str) -> Duration {
        self.provider_ttls
            .get(provider)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

/// A result together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub data: T,
    /// Name of the provider that produced `data`.
    pub provider: String,
    /// True when answered from the cache without calling any provider.
    pub cached: bool,
}

impl Served<WeatherData> {
    fn narrow<T>(self, extract: impl FnOnce(WeatherData) -> Option<T>) -> Result<Served<T>> {
        let Served { data, provider, cached } = self;
        let kind = data.kind();
        match extract(data) {
            Some(data) => Ok(Served { data, provider, cached }),
            None => Err(WeatherError::Provider(format!(
                "{provider} produced {} data for a different query",
                kind.as_str()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Query {
    Current,
    Forecast { days: u8 },
    AirQuality,
    Alerts,
}

impl Query {
    fn kind(&self) -> QueryKind {
        match self {
            Query::Current => QueryKind::Current,
            Query::Forecast { .. } => QueryKind::Forecast,
            Query::AirQuality => QueryKind::AirQuality,
            Query::Alerts => QueryKind::Alerts,
        }
    }

    fn params(&self) -> String {
        match self {
            Query::Forecast { days } => format!("days={days}"),
            _ => String::new(),
        }
    }

    /// The query as this provider will receive it, or why it cannot.
    fn fit(self, descriptor: &ProviderDescriptor) -> Result<Query> {
        let caps = descriptor.capabilities;
        let name = descriptor.name.as_str();
        match self {
            Query::Current => Ok(self),
            Query::Forecast { .. } if !caps.forecast => {
                Err(WeatherError::unsupported(name, QueryKind::Forecast.as_str()))
            }
            Query::Forecast { days } => Ok(Query::Forecast {
                days: descriptor.forecast_days.fit(days)?,
            }),
            Query::AirQuality if !caps.air_quality => {
                Err(WeatherError::unsupported(name, QueryKind::AirQuality.as_str()))
            }
            Query::Alerts if !caps.alerts => {
                Err(WeatherError::unsupported(name, QueryKind::Alerts.as_str()))
            }
            Query::AirQuality | Query::Alerts => Ok(self),
        }
    }

    async fn run(self, provider: &dyn WeatherProvider, location: &str) -> Result<WeatherData> {
        match self {
            Query::Current => {
                provider.get_current_weather(location).await.map(WeatherData::Current)
            }
            Query::Forecast { days } => {
                provider.get_forecast(location, days).await.map(WeatherData::Forecast)
            }
            Query::AirQuality => {
                provider.get_air_quality(location).await.map(WeatherData::AirQuality)
            }
            Query::Alerts => provider.get_alerts(location).await.map(WeatherData::Alerts),
        }
    }
}

pub struct FallbackDispatcher {
    registry: Arc<PluginRegistry>,
    cache: Arc<WeatherCache>,
    order: RwLock<FallbackOrder>,
    policy: DispatchPolicy,
    events: EventBus,
}

impl std::fmt::Debug for FallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackDispatcher")
            .field("order", &self.fallback_order())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FallbackDispatcher {
    pub fn new(
        registry: Arc<PluginRegistry>,
        cache: Arc<WeatherCache>,
        order: FallbackOrder,
        policy: DispatchPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            cache,
            order: RwLock::new(order),
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn fallback_order(&self) -> FallbackOrder {
        self.order.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the fallback order. Every name must be a registered, enabled
    /// provider.
    pub fn set_fallback_order(&self, names: Vec<String>) -> Result<()> {
        let order = FallbackOrder::new(names)?;
        for name in order.names() {
            if !self.registry.contains(name) {
                return Err(WeatherError::configuration(
                    name.as_str(),
                    "no such provider is registered",
                ));
            }
            if !self.registry.is_enabled(name) {
                return Err(WeatherError::configuration(name.as_str(), "provider is disabled"));
            }
        }

        info!(order = ?order.names(), "fallback order updated");
        *self.order.write().unwrap_or_else(PoisonError::into_inner) = order;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_current_weather(
        &self,
        location: &str,
        preferred: Option<&str>,
    ) -> Result<Served<WeatherDataPoint>> {
        self.dispatch(location, preferred, Query::Current)
            .await?
            .narrow(|data| match data {
                WeatherData::Current(point) => Some(point),
                _ => None,
            })
    }

    #[instrument(skip(self))]
    pub async fn get_forecast(
        &self,
        location: &str,
        days: u8,
        preferred: Option<&str>,
    ) -> Result<Served<WeatherForecast>> {
        if days == 0 || days > MAX_FORECAST_DAYS {
            return Err(WeatherError::InvalidParameter(format!(
                "forecast length must be between 1 and {MAX_FORECAST_DAYS} days, got {days}"
            )));
        }

        self.dispatch(location, preferred, Query::Forecast { days })
            .await?
            .narrow(|data| match data {
                WeatherData::Forecast(forecast) => Some(forecast),
                _ => None,
            })
    }

    #[instrument(skip(self))]
    pub async fn get_air_quality(
        &self,
        location: &str,
        preferred: Option<&str>,
    ) -> Result<Served<AirQualityReading>> {
        self.dispatch(location, preferred, Query::AirQuality)
            .await?
            .narrow(|data| match data {
                WeatherData::AirQuality(reading) => Some(reading),
                _ => None,
            })
    }

    #[instrument(skip(self))]
    pub async fn get_alerts(
        &self,
        location: &str,
        preferred: Option<&str>,
    ) -> Result<Served<Vec<WeatherAlert>>> {
        self.dispatch(location, preferred, Query::Alerts)
            .await?
            .narrow(|data| match data {
                WeatherData::Alerts(alerts) => Some(alerts),
                _ => None,
            })
    }

    /// Preferred provider first, then the fallback order; duplicates and
    /// disabled providers are skipped.
    fn candidates(&self, preferred: Option<&str>) -> Vec<String> {
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen = BTreeSet::new();

        preferred
            .into_iter()
            .chain(order.names().iter().map(String::as_str))
            .filter(|name| seen.insert(*name))
            .filter(|name| self.registry.is_enabled(name))
            .map(str::to_string)
            .collect()
    }

    async fn dispatch(
        &self,
        location: &str,
        preferred: Option<&str>,
        query: Query,
    ) -> Result<Served<WeatherData>> {
        let location = location.trim();
        if location.is_empty() {
            return Err(WeatherError::InvalidParameter("location must not be empty".into()));
        }

        let key = CacheKey::new(preferred, location, query.kind(), query.params());
        if let Some(hit) = self.cache.get(&key) {
            debug!(provider = %hit.served_by, "served from cache");
            return Ok(Served {
                data: hit.value.clone(),
                provider: hit.served_by.clone(),
                cached: true,
            });
        }

        let candidates = self.candidates(preferred);
        let skipped = preferred
            .filter(|name| !self.registry.is_enabled(name))
            .map(|name| {
                let reason = if self.registry.contains(name) {
                    "disabled"
                } else {
                    "not registered"
                };
                (name.to_string(), reason.to_string())
            });
        let mut failures: Vec<ProviderFailure> = Vec::with_capacity(candidates.len());

        for name in &candidates {
            let (Some(provider), Some(descriptor)) =
                (self.registry.active(name), self.registry.descriptor(name))
            else {
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    attempts: 0,
                    error: WeatherError::configuration(name.as_str(), "provider is not configured"),
                });
                continue;
            };

            let fitted = match query.fit(&descriptor) {
                Ok(fitted) => fitted,
                Err(error) => {
                    debug!(provider = %name, %error, "skipping provider");
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        attempts: 0,
                        error,
                    });
                    continue;
                }
            };

            match self.attempt(name, provider.as_ref(), location, fitted).await {
                Ok(data) => {
                    let detour = skipped.or_else(|| {
                        failures
                            .first()
                            .map(|first| (first.provider.clone(), first.error.to_string()))
                    });
                    if let Some((from, reason)) = detour {
                        self.events.emit(EngineEvent::ProviderFallback {
                            from,
                            to: name.clone(),
                            reason,
                        });
                    }
                    self.cache
                        .put(key, data.clone(), name, self.policy.ttl_for(name));
                    return Ok(Served {
                        data,
                        provider: name.clone(),
                        cached: false,
                    });
                }
                Err((attempts, error)) => {
                    warn!(provider = %name, attempts, kind = error.kind(), %error, "provider failed");
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        attempts,
                        error,
                    });
                }
            }
        }

        Err(WeatherError::AllProvidersFailed(failures))
    }

    /// Call one provider, retrying transient failures within the budget.
    /// On failure returns the number of calls made and the last error.
    async fn attempt(
        &self,
        name: &str,
        provider: &dyn WeatherProvider,
        location: &str,
        query: Query,
    ) -> Result<WeatherData, (u32, WeatherError)> {
        let retry = self.policy.retry;
        let budget = retry.max_attempts.max(1);
        let timeout = self.policy.attempt_timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, query.run(provider, location)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(WeatherError::TransientNetwork(format!(
                    "{name} did not answer within {}s",
                    timeout.as_secs_f32()
                ))),
            };

            match outcome {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && attempt < budget => {
                    let delay = retry.delay_after(attempt, &err);
                    debug!(provider = name, attempt, ?delay, %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }
}
