//! Tracing subscriber setup shared by both binaries.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level; an invalid configured filter
/// warns on stderr and falls back to `info`. Safe to call more than once,
/// later calls are ignored.
pub fn init_tracing(log_level: &str, json: bool) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: GEARWATCH_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    let _ = if json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
}
