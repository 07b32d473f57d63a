use tracing_subscriber::{prelude::*, util::SubscriberInitExt, EnvFilter};

/// Log directives used when `RUST_LOG` is not set.
const DEFAULT_DIRECTIVES: &str = "info";

/// Installs a plain-text subscriber filtered by `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_filter(filter),
        )
        .init();
}
