use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, in `tracing_subscriber::EnvFilter` syntax.
pub const LOG_ENV: &str = "ENTRYPOINT_LOG";

/// Configure `tracing` to write to stderr.
///
/// Only warnings and errors are shown unless [`LOG_ENV`] says otherwise, so the wrapped
/// command's output stays clean.
pub fn configure_logging() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    // A second initialization (e.g. from tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_target(false)
        .try_init();
}
