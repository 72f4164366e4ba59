use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::delivery::{RetryPolicy, DEFAULT_DEDUP_WINDOW};
use crate::error::CourierError;

/// Deployment environment.
///
/// Outside production, untyped handler errors carry the debug rendering of
/// their error chain in `details.stack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = CourierError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(CourierError::InvalidConfig {
                message: format!("unknown environment {:?}", other),
            }),
        }
    }
}

/// Router configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub environment: Environment,
    /// Used by at-least-once events registered without a policy.
    pub default_retry_policy: RetryPolicy,
    /// Used by at-most-once events registered without a window.
    pub default_deduplication_window: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            default_retry_policy: RetryPolicy::default(),
            default_deduplication_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl RouterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = RetryPolicy::default();

        let environment = match lookup("COURIER_ENV") {
            Some(raw) => raw.parse().context("COURIER_ENV must be production or development")?,
            None => Environment::default(),
        };

        let max_attempts: u32 = parse_or(
            &lookup,
            "COURIER_RETRY_MAX_ATTEMPTS",
            defaults.max_attempts,
        )
        .context("COURIER_RETRY_MAX_ATTEMPTS must be a valid number")?;
        let initial_delay_ms: u64 = parse_or(
            &lookup,
            "COURIER_RETRY_INITIAL_DELAY_MS",
            defaults.initial_delay.as_millis() as u64,
        )
        .context("COURIER_RETRY_INITIAL_DELAY_MS must be a valid number")?;
        let max_delay_ms: u64 = parse_or(
            &lookup,
            "COURIER_RETRY_MAX_DELAY_MS",
            defaults.max_delay.as_millis() as u64,
        )
        .context("COURIER_RETRY_MAX_DELAY_MS must be a valid number")?;
        let backoff_multiplier: f64 = parse_or(
            &lookup,
            "COURIER_RETRY_BACKOFF_MULTIPLIER",
            defaults.backoff_multiplier,
        )
        .context("COURIER_RETRY_BACKOFF_MULTIPLIER must be a valid number")?;
        let dedup_window_ms: u64 = parse_or(
            &lookup,
            "COURIER_DEDUP_WINDOW_MS",
            DEFAULT_DEDUP_WINDOW.as_millis() as u64,
        )
        .context("COURIER_DEDUP_WINDOW_MS must be a valid number")?;

        let config = Self {
            environment,
            default_retry_policy: RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(initial_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                backoff_multiplier,
            },
            default_deduplication_window: Duration::from_millis(dedup_window_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject policies the delivery engine cannot honor.
    pub fn validate(&self) -> std::result::Result<(), CourierError> {
        let policy = &self.default_retry_policy;
        if policy.max_attempts == 0 {
            return Err(CourierError::InvalidConfig {
                message: "retry max_attempts must be at least 1".into(),
            });
        }
        if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
            return Err(CourierError::InvalidConfig {
                message: format!(
                    "retry backoff_multiplier must be >= 1.0, got {}",
                    policy.backoff_multiplier
                ),
            });
        }
        if policy.max_delay < policy.initial_delay {
            return Err(CourierError::InvalidConfig {
                message: "retry max_delay must not be shorter than initial_delay".into(),
            });
        }
        Ok(())
    }

    /// Whether untyped errors may carry debug details.
    pub fn expose_internal_errors(&self) -> bool {
        !self.environment.is_production()
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => Ok(raw.trim().parse()?),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RouterConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RouterConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config, RouterConfig::default());
        assert!(config.expose_internal_errors());
        assert_eq!(config.default_retry_policy.max_attempts, 5);
        assert_eq!(config.default_deduplication_window, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("COURIER_ENV", "production"),
            ("COURIER_RETRY_MAX_ATTEMPTS", "3"),
            ("COURIER_RETRY_INITIAL_DELAY_MS", "250"),
            ("COURIER_RETRY_MAX_DELAY_MS", "2000"),
            ("COURIER_RETRY_BACKOFF_MULTIPLIER", "3"),
            ("COURIER_DEDUP_WINDOW_MS", "5000"),
        ])
        .unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert!(!config.expose_internal_errors());
        assert_eq!(config.default_retry_policy.max_attempts, 3);
        assert_eq!(
            config.default_retry_policy.initial_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.default_retry_policy.backoff_multiplier, 3.0);
        assert_eq!(config.default_deduplication_window, Duration::from_secs(5));
    }

    #[test]
    fn test_unparseable_value_names_variable() {
        let err = load(&[("COURIER_RETRY_MAX_ATTEMPTS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("COURIER_RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_unknown_environment_is_rejected() {
        assert!(load(&[("COURIER_ENV", "staging")]).is_err());
        assert_eq!(
            "PROD".parse::<Environment>().unwrap(),
            Environment::Production
        );
    }

    #[test]
    fn test_zero_attempts_is_invalid() {
        let err = load(&[("COURIER_RETRY_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }
}
