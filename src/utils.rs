use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the default tracing subscriber.
///
/// Defaults to INFO, overridable through `RUST_LOG`. Called fallibly by the
/// runner, so embedders that install their own subscriber first win.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(tracing_subscriber::fmt::time::uptime())
                // Hides the module path like purple_titanium::executor
                .with_target(false)
                .compact(),
        )
        .with(filter)
        .try_init()
}
