use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the process-wide `tracing` subscriber, the way the teacher's
/// `main.rs` does for its reverse proxy. The teacher's `LogManager` (access
/// logs, rotation, compression) is the "logging setup" external collaborator
/// spec.md section 1 places out of scope — this crate only emits structured
/// `tracing` events, it does not manage log files.
pub fn init() {
    let default_filter = "raftkv=info,tower_http=info";

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
