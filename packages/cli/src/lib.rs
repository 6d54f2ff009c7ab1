// ABOUTME: Shared pieces of the warden command line tool
// ABOUTME: Logging setup, token import parsing, and terminal rendering

pub mod display;
pub mod import;

/// Install the global tracing subscriber, honouring RUST_LOG
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}
