/*!
 * Logging functionality for the wallpad gateway.
 *
 * This module provides tracing setup and the span helpers used by the
 * scheduler and the bridges. Raw bus frames and MQTT publishes are logged
 * under their own targets so they can be switched on separately.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Target for raw RS485 frames
pub const BUS_TARGET: &str = "wallpad::bus";

/// Target for MQTT publishes
pub const MQTT_TARGET: &str = "wallpad::mqtt";

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "wallpad::bus=debug")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Initialize logging from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = filter_directives(config);
    if !config.json_format {
        return init_with_filter(&filter);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Build the filter string for a logging configuration
///
/// The bus and MQTT targets are raised to `debug` when their flag is set and
/// held at `warn` otherwise, regardless of the base level.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let level_for = |enabled: bool| if enabled { "debug" } else { "warn" };
    format!(
        "{},{}={},{}={}",
        config.level,
        BUS_TARGET,
        level_for(config.bus_log),
        MQTT_TARGET,
        level_for(config.mqtt_log)
    )
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // Only the first initialization in a process succeeds
        let _ = init();
    }

    #[test]
    fn test_filter_directives() {
        let mut config = LoggingConfig::default();
        assert_eq!(
            filter_directives(&config),
            "info,wallpad::bus=warn,wallpad::mqtt=warn"
        );

        config.level = "debug".to_string();
        config.bus_log = true;
        assert_eq!(
            filter_directives(&config),
            "debug,wallpad::bus=debug,wallpad::mqtt=warn"
        );
    }

    #[test]
    fn test_component_span() {
        let span = component_span("scheduler", Some("commax"));
        assert!(span.is_none());

        let span = component_span("scheduler", None);
        assert!(span.is_none());
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("tick", "scheduler");
        assert!(span.is_none());
    }
}
