use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global tracing subscriber. A malformed filter falls back to
/// `info` plus this crate's session-lifecycle debug logs. Targets are
/// suppressed; session logs identify themselves by their `session_id` field.
pub fn init_tracing(filter: &str) {
    let env_filter =
        EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info,beach_pier=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();
    Registry::default().with(env_filter).with(fmt_layer).init();
}
