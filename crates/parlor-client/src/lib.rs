//! Chat client engine: REST history and mutations, a push channel for
//! live delivery, and the orchestrator tying both into one session.

pub mod api;
pub mod config;
pub mod engine;
pub mod events;

pub use api::{ApiError, ChatApi, HttpApi};
pub use config::EngineConfig;
pub use engine::ChatEngine;
pub use events::EngineEvent;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber for an embedding application.
/// `RUST_LOG` overrides the default filter.  Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parlor_client=debug,parlor_net=debug,parlor_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Convenience constructor: engine over the real HTTP backend, configured
/// from the environment.
pub fn build_engine(viewer: parlor_shared::types::User) -> api::Result<ChatEngine> {
    let config = EngineConfig::from_env();
    let http = HttpApi::new(config.api_url.clone(), config.token.clone())?;
    Ok(ChatEngine::new(std::sync::Arc::new(http), viewer, config))
}
