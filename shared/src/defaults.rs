//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

/// Default HTTP scrape server port.
pub fn default_port() -> u16 {
    9560
}

/// Default database `autocommit` flag.
pub fn default_autocommit() -> bool {
    true
}

/// Default database `keep-connected` flag.
pub fn default_keep_connected() -> bool {
    true
}

/// Default alert condition ("fires when the metric value is greater than zero").
pub fn default_alert_condition() -> String {
    "> 0".to_string()
}

/// Default `for` duration string for an alert (no sustained-duration requirement).
pub fn default_alert_for() -> String {
    "0m".to_string()
}

/// Default alert severity.
pub fn default_alert_severity() -> String {
    "warning".to_string()
}

/// Default idle age after which an alert state is garbage collected (1 hour).
pub fn default_alert_max_age_seconds() -> u64 {
    3600
}

/// Default overall timeout for an Alertmanager dispatch HTTP POST (30 seconds).
pub fn default_alertmanager_timeout_seconds() -> u64 {
    30
}

/// Default metric description (empty, matching the source's `description: str = ""`).
pub fn default_metric_description() -> String {
    String::new()
}

/// Default query execution timeout when a query declares none (seconds).
pub fn default_query_timeout_secs() -> u64 {
    30
}
