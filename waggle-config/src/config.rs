//! Configuration loading and validation
//!
//! Loading hierarchy: env > file > defaults.

use crate::env::apply_env_overrides;
use crate::schema::{ConfigError, WaggleConfig};
use std::path::Path;

/// Load configuration from an optional file path plus environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<WaggleConfig, ConfigError> {
    let mut config = match path {
        Some(p) if p.exists() => load_from_path(p)?,
        _ => WaggleConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Load configuration from a TOML file.
pub fn load_from_path(path: &Path) -> Result<WaggleConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    load_from_str(&content)
}

/// Parse configuration from a TOML string.
pub fn load_from_str(content: &str) -> Result<WaggleConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Validate cross-field invariants.
pub fn validate_config(config: &WaggleConfig) -> Result<(), ConfigError> {
    let swarm = &config.swarm;
    // Byzantine tolerance requires n >= 3f + 1 including the queen.
    let min_workers = 3 * swarm.fault_tolerance + 1;
    if swarm.fault_tolerance > 0 && swarm.max_workers < min_workers {
        return Err(ConfigError::Validation(format!(
            "swarm.max_workers ({}) must be >= 3f+1 ({}) for fault_tolerance {}",
            swarm.max_workers, min_workers, swarm.fault_tolerance
        )));
    }
    if swarm.heartbeat_interval_ms == 0 || swarm.worker_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "swarm heartbeat and worker timeout must be non-zero".to_string(),
        ));
    }
    if swarm.worker_timeout_ms <= swarm.heartbeat_interval_ms {
        return Err(ConfigError::Validation(format!(
            "swarm.worker_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
            swarm.worker_timeout_ms, swarm.heartbeat_interval_ms
        )));
    }

    let global = &config.admission.global;
    if !(0.0..=1.0).contains(&global.throttle_threshold) || global.throttle_threshold == 0.0 {
        return Err(ConfigError::Validation(format!(
            "admission.global.throttle_threshold {} must be in (0, 1]",
            global.throttle_threshold
        )));
    }
    if !(0.0..=1.0).contains(&global.shed_probability) {
        return Err(ConfigError::Validation(format!(
            "admission.global.shed_probability {} must be in [0, 1]",
            global.shed_probability
        )));
    }

    let retry = &config.queue.retry;
    if retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(format!(
            "queue.retry.backoff_multiplier {} must be >= 1.0",
            retry.backoff_multiplier
        )));
    }
    if config.queue.max_size == 0 || config.queue.workers == 0 {
        return Err(ConfigError::Validation(
            "queue.max_size and queue.workers must be non-zero".to_string(),
        ));
    }
    let breaker = &config.queue.circuit_breaker;
    if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
        return Err(ConfigError::Validation(
            "circuit breaker thresholds must be non-zero".to_string(),
        ));
    }

    let cache = &config.router.cache;
    if cache.enabled && cache.max_entries == 0 {
        return Err(ConfigError::Validation(
            "router.cache.max_entries must be non-zero when the cache is enabled".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.router.budget_warn_fraction) {
        return Err(ConfigError::Validation(format!(
            "router.budget_warn_fraction {} must be in [0, 1]",
            config.router.budget_warn_fraction
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::*;

    #[test]
    fn test_defaults_validate() {
        let config = WaggleConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_fault_tolerance_bound() {
        let mut config = WaggleConfig::default();
        config.swarm.fault_tolerance = 2;
        config.swarm.max_workers = 6; // needs 7
        assert!(validate_config(&config).is_err());

        config.swarm.max_workers = 7;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = load_from_str(
            r#"
            [swarm]
            max_workers = 8
            fault_tolerance = 1

            [admission.providers.anthropic]
            rpm = 120
            tpm = 200000
            burst = true

            [queue.retry]
            max_retries = 5

            [router]
            fallback_chain = ["gpt-4o", "claude-sonnet"]
            "#,
        )
        .unwrap();

        assert_eq!(config.swarm.max_workers, 8);
        assert_eq!(config.admission.providers["anthropic"].rpm, 120);
        assert!(config.admission.providers["anthropic"].burst);
        assert_eq!(config.queue.retry.max_retries, 5);
        assert_eq!(config.router.fallback_chain.len(), 2);
        // Untouched sections keep defaults.
        assert_eq!(config.task.default_max_retries, 3);
    }

    #[test]
    fn test_bad_multiplier_rejected() {
        let mut config = WaggleConfig::default();
        config.queue.retry.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config = load_from_str("").unwrap();
        assert_eq!(config.queue.max_size, 1_000);
        assert_eq!(config.swarm.heartbeat_interval_ms, 1_000);
        assert!(config.router.cache.enabled);
    }
}
