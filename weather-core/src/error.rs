use std::{fmt, time::Duration};

use thiserror::Error;

pub type Result<T, E = WeatherError> = std::result::Result<T, E>;

/// Error taxonomy shared by providers, the registry and the dispatcher.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WeatherError {
    #[error("location '{0}' could not be resolved")]
    LocationNotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("invalid configuration for provider '{provider}': {}", .problems.join("; "))]
    Configuration {
        provider: String,
        problems: Vec<String>,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("provider '{provider}' does not support {operation}")]
    UnsupportedOperation {
        provider: String,
        operation: &'static str,
    },

    #[error("all providers failed: {}", FailureList(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),

    #[error("provider error: {0}")]
    Provider(String),
}

impl WeatherError {
    /// Transient errors are retried within a provider attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, WeatherError::TransientNetwork(_) | WeatherError::RateLimited { .. })
    }

    pub fn configuration(provider: impl Into<String>, problem: impl Into<String>) -> Self {
        WeatherError::Configuration {
            provider: provider.into(),
            problems: vec![problem.into()],
        }
    }

    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        WeatherError::UnsupportedOperation {
            provider: provider.into(),
            operation,
        }
    }

    /// Short stable name of the error class, used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            WeatherError::LocationNotFound(_) => "location_not_found",
            WeatherError::Auth(_) => "auth",
            WeatherError::RateLimited { .. } => "rate_limited",
            WeatherError::TransientNetwork(_) => "transient_network",
            WeatherError::Configuration { .. } => "configuration",
            WeatherError::InvalidParameter(_) => "invalid_parameter",
            WeatherError::UnsupportedOperation { .. } => "unsupported_operation",
            WeatherError::AllProvidersFailed(_) => "all_providers_failed",
            WeatherError::Provider(_) => "provider",
        }
    }

    /// Per-provider failures when this is an aggregate error.
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            WeatherError::AllProvidersFailed(failures) => failures,
            _ => &[],
        }
    }
}

/// One provider's outcome inside an exhausted fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    /// Number of calls actually made; zero when the provider was skipped.
    pub attempts: u32,
    pub error: WeatherError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} attempt(s)): {}", self.provider, self.attempts, self.error)
    }
}

struct FailureList<'a>(&'a [ProviderFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no provider available");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl From<reqwest::Error> for WeatherError {
    fn from(err: reqwest::Error) -> Self {
        // request urls carry api keys in their query
        let err = err.without_url();
        if err.is_timeout() || err.is_connect() || err.is_request() {
            WeatherError::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            WeatherError::Provider(format!("malformed response: {err}"))
        } else {
            WeatherError::Provider(err.to_string())
        }
    }
}
