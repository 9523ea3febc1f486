//! Environment variable overrides
//!
//! Scalar settings use fixed names (`WAGGLE_SWARM_MAX_WORKERS`); provider
//! caps use the dynamic form `WAGGLE_PROVIDER_<NAME>_<SETTING>=value`.

use crate::schema::{ConfigError, DegradationMode, ProviderLimits, WaggleConfig};

/// Apply `WAGGLE_*` environment overrides to a loaded configuration.
pub fn apply_env_overrides(config: &mut WaggleConfig) -> Result<(), ConfigError> {
    if let Ok(v) = std::env::var("WAGGLE_SWARM_MAX_WORKERS") {
        config.swarm.max_workers = parse(&v, "WAGGLE_SWARM_MAX_WORKERS")?;
    }
    if let Ok(v) = std::env::var("WAGGLE_SWARM_FAULT_TOLERANCE") {
        config.swarm.fault_tolerance = parse(&v, "WAGGLE_SWARM_FAULT_TOLERANCE")?;
    }
    if let Ok(v) = std::env::var("WAGGLE_SWARM_HEARTBEAT_INTERVAL_MS") {
        config.swarm.heartbeat_interval_ms = parse(&v, "WAGGLE_SWARM_HEARTBEAT_INTERVAL_MS")?;
    }
    if let Ok(v) = std::env::var("WAGGLE_SWARM_WORKER_TIMEOUT_MS") {
        config.swarm.worker_timeout_ms = parse(&v, "WAGGLE_SWARM_WORKER_TIMEOUT_MS")?;
    }
    if let Ok(v) = std::env::var("WAGGLE_QUEUE_MAX_SIZE") {
        config.queue.max_size = parse(&v, "WAGGLE_QUEUE_MAX_SIZE")?;
    }
    if let Ok(v) = std::env::var("WAGGLE_ROUTER_CACHE_ENABLED") {
        config.router.cache.enabled = parse_bool(&v, "WAGGLE_ROUTER_CACHE_ENABLED")?;
    }
    if let Ok(v) = std::env::var("WAGGLE_ADMISSION_DEGRADATION_MODE") {
        config.admission.degradation_mode = match v.to_lowercase().as_str() {
            "reject" => DegradationMode::Reject,
            "queue" => DegradationMode::Queue,
            "shed" => DegradationMode::Shed,
            "priority" => DegradationMode::Priority,
            other => {
                return Err(ConfigError::Validation(format!(
                    "invalid degradation mode: {}",
                    other
                )))
            }
        };
    }

    // WAGGLE_PROVIDER_<NAME>_<SETTING>=value
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix("WAGGLE_PROVIDER_") else {
            continue;
        };
        let Some((name, setting)) = rest.split_once('_') else {
            continue;
        };
        let provider = config
            .admission
            .providers
            .entry(name.to_lowercase())
            .or_insert_with(ProviderLimits::default);

        match setting.to_lowercase().as_str() {
            "rpm" => provider.rpm = parse(&value, &key)?,
            "tpm" => provider.tpm = parse(&value, &key)?,
            "concurrent" => provider.concurrent = parse(&value, &key)?,
            "burst" => provider.burst = parse_bool(&value, &key)?,
            "cost_per_minute" => provider.cost_per_minute = parse(&value, &key)?,
            "cost_per_hour" => provider.cost_per_hour = parse(&value, &key)?,
            "cost_per_day" => provider.cost_per_day = parse(&value, &key)?,
            _ => {}
        }
    }

    Ok(())
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("invalid value for {}: {}", key, value)))
}

fn parse_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Validation(format!(
            "invalid boolean for {}: {}",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the process environment is shared state, and parallel
    // mutation would make the cases race each other.
    #[test]
    fn test_env_overrides() {
        std::env::set_var("WAGGLE_QUEUE_MAX_SIZE", "42");
        std::env::set_var("WAGGLE_PROVIDER_OPENAI_RPM", "90");
        let mut config = WaggleConfig::default();
        apply_env_overrides(&mut config).unwrap();
        assert_eq!(config.queue.max_size, 42);
        assert_eq!(config.admission.providers["openai"].rpm, 90);
        std::env::remove_var("WAGGLE_QUEUE_MAX_SIZE");
        std::env::remove_var("WAGGLE_PROVIDER_OPENAI_RPM");

        std::env::set_var("WAGGLE_SWARM_MAX_WORKERS", "many");
        let mut config = WaggleConfig::default();
        assert!(apply_env_overrides(&mut config).is_err());
        std::env::remove_var("WAGGLE_SWARM_MAX_WORKERS");
    }
}
