//! Monitor configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::retention::DEFAULT_RETENTION_DAYS;

/// Runtime configuration for the gear-watch binaries.
///
/// Every field has a default so the monitor runs without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite catalog database (default: `gear-watch.db`).
    pub database_path: PathBuf,

    /// Root of the submitted-media tree swept for expired batches.
    pub media_root: PathBuf,

    /// Pause between two cycles (default: 30 minutes).
    pub interval: Duration,

    /// Age in whole days at which a media batch is deleted (default: 30).
    pub retention_days: u32,

    /// Upper bound on a single vendor fetch (default: 20 s).
    pub fetch_timeout: Duration,

    /// Where dead-link alerts are POSTed; log-only when unset.
    pub alert_webhook: Option<String>,

    /// `tracing` filter string, e.g. `"info"` or `"gear_watch=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Operator API listen address (server binary only).
    pub bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("gear-watch.db"),
            media_root: PathBuf::from("static/submissions"),
            interval: Duration::from_secs(30 * 60),
            retention_days: DEFAULT_RETENTION_DAYS,
            fetch_timeout: Duration::from_secs(20),
            alert_webhook: None,
            log_level: "info".to_owned(),
            log_json: false,
            bind_address: "0.0.0.0:3000".to_owned(),
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            database_path: lookup("GEARWATCH_DATABASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            media_root: lookup("GEARWATCH_MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_root),
            interval: parse_or(&lookup, "GEARWATCH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            retention_days: parse_or(&lookup, "GEARWATCH_RETENTION_DAYS")
                .unwrap_or(defaults.retention_days),
            fetch_timeout: parse_or(&lookup, "GEARWATCH_FETCH_TIMEOUT_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            alert_webhook: lookup("GEARWATCH_ALERT_WEBHOOK").filter(|v| !v.trim().is_empty()),
            log_level: lookup("GEARWATCH_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("GEARWATCH_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.log_json),
            bind_address: lookup("GEARWATCH_BIND").unwrap_or(defaults.bind_address),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_or<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = config_with(&[]);

        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.interval, Duration::from_secs(1800));
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(20));
        assert!(cfg.alert_webhook.is_none());
        assert!(!cfg.log_json);
    }

    #[test]
    fn reads_overrides() {
        let cfg = config_with(&[
            ("GEARWATCH_DATABASE", "/var/lib/gear.db"),
            ("GEARWATCH_INTERVAL_SECS", "30"),
            ("GEARWATCH_RETENTION_DAYS", "7"),
            ("GEARWATCH_ALERT_WEBHOOK", "https://hooks.example/alerts"),
            ("GEARWATCH_LOG_JSON", "TRUE"),
        ]);

        assert_eq!(cfg.database_path, PathBuf::from("/var/lib/gear.db"));
        assert_eq!(cfg.interval, Duration::from_secs(30));
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.alert_webhook.as_deref(), Some("https://hooks.example/alerts"));
        assert!(cfg.log_json);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config_with(&[
            ("GEARWATCH_INTERVAL_SECS", "soon"),
            ("GEARWATCH_RETENTION_DAYS", "-3"),
            ("GEARWATCH_FETCH_TIMEOUT_SECS", "0"),
            ("GEARWATCH_ALERT_WEBHOOK", "  "),
        ]);

        assert_eq!(cfg.interval, Duration::from_secs(1800));
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(20));
        assert!(cfg.alert_webhook.is_none());
    }
}
