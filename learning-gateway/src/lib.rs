//! Learning Gateway - transport for adaptive narrative sessions
//!
//! Exposes the session coordinator over REST and a WebSocket channel:
//!
//! - **REST**: session start/snapshot/turn/choice/complete, learner progress
//! - **WebSocket**: per-session real-time events with initiator-first fan-out
//! - **Bootstrap**: model backend, usage log, seed library from [`config::Args`]

pub mod config;
pub mod realtime;
pub mod routes;
pub mod seed;

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use narrative_engine::{MemoryStore, NarrativeStore, SessionCoordinator};
use tutor_agent::{JsonlUsageLogger, LlmBackend, MockBackend, NoopUsageCollector, OpenAiBackend, UsageCollector};

pub use config::Args;
pub use routes::create_router;

/// State shared across handlers
pub struct AppState {
    pub coordinator: SessionCoordinator,
    pub dev_mode: bool,
}

pub type SharedState = Arc<AppState>;

/// Build the engine from validated arguments.
pub async fn bootstrap(args: &Args) -> anyhow::Result<SharedState> {
    let engine_config = args
        .load_engine_config()
        .context("failed to load engine config")?;

    let backend: Arc<dyn LlmBackend> = if args.dev_mode {
        warn!("Development mode: tutor replies come from the mock backend");
        Arc::new(MockBackend::default().with_response(
            "(development mode) No language model is connected, but your message was recorded.",
        ))
    } else {
        let base_url = args
            .llm_base_url
            .clone()
            .context("LLM_BASE_URL is required outside development mode")?;
        let backend = OpenAiBackend::new(base_url, args.llm_model.clone(), args.llm_api_key.clone())?
            .with_provider(args.llm_provider.clone());
        Arc::new(backend)
    };

    let usage: Arc<dyn UsageCollector> = match &args.usage_log {
        Some(path) => {
            let logger = JsonlUsageLogger::open(path)
                .with_context(|| format!("failed to open usage log {}", path.display()))?;
            info!(path = %path.display(), "Recording usage to JSONL");
            Arc::new(logger)
        }
        None => Arc::new(NoopUsageCollector),
    };

    let store: Arc<dyn NarrativeStore> = Arc::new(MemoryStore::new());
    if let Some(path) = &args.seed_library {
        seed::load_file(path, store.as_ref())
            .await
            .with_context(|| format!("failed to load seed library {}", path.display()))?;
    }

    let coordinator = SessionCoordinator::new(store, backend, usage, engine_config).await;

    Ok(Arc::new(AppState {
        coordinator,
        dev_mode: args.dev_mode,
    }))
}
