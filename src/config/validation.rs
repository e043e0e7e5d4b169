//! Configuration validation.

use crate::config::Config;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - A known log level
/// - Non-zero timeouts and health check delay
/// - A metrics path starting with `/`
/// - Distinct control and metrics addresses
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    let durations: [(&str, Duration); 5] = [
        ("tcp.timeout", config.tcp.timeout),
        ("udp.timeout", config.udp.timeout),
        ("udp.idle_timeout", config.udp.idle_timeout),
        ("health_check.delay", config.health_check.delay),
        ("control.timeout", config.control.timeout),
    ];
    for (name, value) in durations {
        if value.is_zero() {
            errors.push(format!("{name} must be greater than zero"));
        }
    }

    let metrics = &config.global.metrics;
    if !metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            metrics.path
        ));
    }

    if metrics.enabled && metrics.address == config.control.listen {
        errors.push(format!(
            "control and metrics servers cannot share address {}",
            metrics.address
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
