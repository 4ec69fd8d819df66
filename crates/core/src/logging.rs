use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn build_env_filter_from(mediavault_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");

    if let Some(v) = mediavault_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("MEDIAVAULT_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the process-wide `tracing` subscriber. Idempotent: later calls
/// from other crates in the same process are no-ops.
pub fn init_logging(json: bool) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter();

        if json {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());
            let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
            let _ = subscriber.try_init();
        } else {
            let layer = tracing_subscriber::fmt::layer().with_timer(
                tracing_subscriber::fmt::time::UtcTime::rfc_3339(),
            );
            let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
            let _ = subscriber.try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_mediavault_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("info"), Some("debug"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "info");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "debug");
    }
}
