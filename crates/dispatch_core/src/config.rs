//! Engine configuration: defaults, then `dispatch.toml`, then environment.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::GeoBackend;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("invalid config:\n - {}", .0.join("\n - "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub match_radius_km: f64,
    pub acceptance_window_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub idempotency_capacity: usize,
    pub driver_ttl_secs: u64,
    pub prune_interval_secs: u64,
    pub subscriber_buffer: usize,
    pub geo_backend: GeoBackend,
    /// Refuse acceptance from drivers whose heartbeat is older than `driver_ttl_secs`.
    pub enforce_fresh_heartbeat: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            match_radius_km: 3.0,
            acceptance_window_secs: 15,
            idempotency_ttl_secs: 30 * 60,
            idempotency_capacity: 100_000,
            driver_ttl_secs: 5 * 60,
            prune_interval_secs: 60,
            subscriber_buffer: 64,
            geo_backend: GeoBackend::Scan,
            enforce_fresh_heartbeat: true,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::Env {
        var,
        reason: format!("cannot parse {raw:?}"),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Env {
            var,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

impl DispatchConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid by `path` when given, overlaid by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup("DISPATCH_MATCH_RADIUS_KM") {
            self.match_radius_km = parse_env("DISPATCH_MATCH_RADIUS_KM", &raw)?;
        }
        if let Some(raw) = lookup("DISPATCH_ACCEPT_WINDOW_SECS") {
            self.acceptance_window_secs = parse_env("DISPATCH_ACCEPT_WINDOW_SECS", &raw)?;
        }
        if let Some(raw) = lookup("IDEMPOTENCY_TTL_SECS") {
            self.idempotency_ttl_secs = parse_env("IDEMPOTENCY_TTL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("IDEMPOTENCY_CAPACITY") {
            self.idempotency_capacity = parse_env("IDEMPOTENCY_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("DRIVER_TTL_SECS") {
            self.driver_ttl_secs = parse_env("DRIVER_TTL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("DRIVER_PRUNE_INTERVAL_SECS") {
            self.prune_interval_secs = parse_env("DRIVER_PRUNE_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("HUB_SUBSCRIBER_BUFFER") {
            self.subscriber_buffer = parse_env("HUB_SUBSCRIBER_BUFFER", &raw)?;
        }
        if let Some(raw) = lookup("GEO_BACKEND") {
            self.geo_backend = match raw.trim().to_ascii_lowercase().as_str() {
                "scan" | "memory" => GeoBackend::Scan,
                "cell" | "h3" => GeoBackend::Cell,
                other => {
                    return Err(ConfigError::Env {
                        var: "GEO_BACKEND",
                        reason: format!("unknown backend {other:?}, expected scan or cell"),
                    })
                }
            };
        }
        if let Some(raw) = lookup("ENFORCE_FRESH_HEARTBEAT") {
            self.enforce_fresh_heartbeat = parse_bool("ENFORCE_FRESH_HEARTBEAT", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();
        if !self.match_radius_km.is_finite() || self.match_radius_km <= 0.0 {
            issues.push("match_radius_km must be a positive number".to_string());
        }
        if self.acceptance_window_secs == 0 {
            issues.push("acceptance_window_secs must be > 0".to_string());
        }
        if self.idempotency_ttl_secs == 0 {
            issues.push("idempotency_ttl_secs must be > 0".to_string());
        }
        if self.idempotency_capacity == 0 {
            issues.push("idempotency_capacity must be > 0".to_string());
        }
        if self.driver_ttl_secs == 0 {
            issues.push("driver_ttl_secs must be > 0".to_string());
        }
        if self.prune_interval_secs == 0 {
            issues.push("prune_interval_secs must be > 0".to_string());
        }
        if self.subscriber_buffer == 0 {
            issues.push("subscriber_buffer must be > 0".to_string());
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    pub fn acceptance_window(&self) -> Duration {
        Duration::from_secs(self.acceptance_window_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn idempotency_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.idempotency_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn driver_ttl(&self) -> Duration {
        Duration::from_secs(self.driver_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}
