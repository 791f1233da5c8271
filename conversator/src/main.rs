use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use ractor::Actor;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};

use conversator::actors::{EventStoreActor, EventStoreArguments, OrchestratorMsg};
use conversator::api;
use conversator::app_state::AppState;
use conversator::builders::BuilderRegistry;
use conversator::config::Config;
use conversator::context::NoopContextLookup;
use conversator::conversation::ConversationLog;
use conversator::prompts::PromptWorkspace;
use conversator::supervisor::{ApplicationSupervisor, SupervisorArguments, SupervisorMsg};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("Starting Conversator core");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    for dir in [
        config.workspace_root.join("state"),
        config.prompts_root(),
        config.cache_root(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    let registry = Arc::new(
        BuilderRegistry::from_config(&config.builders, &config.timeouts)
            .map_err(|e| std::io::Error::other(e.to_string()))?,
    );
    tracing::info!(builders = ?registry.names(), "Builder registry loaded");

    let prompts = Arc::new(PromptWorkspace::new(config.prompts_root()));

    // The event store replays the log before anything can issue commands.
    let db_path = config.database_path().to_string_lossy().to_string();
    tracing::info!(database_path = %db_path, "Opening event log");
    let (event_store, _store_handle) = Actor::spawn(
        None,
        EventStoreActor,
        EventStoreArguments::File(db_path),
    )
    .await
    .map_err(|e| std::io::Error::other(format!("failed to start event store: {e}")))?;

    let (supervisor, _supervisor_handle) = Actor::spawn(
        None,
        ApplicationSupervisor,
        SupervisorArguments {
            event_store: event_store.clone(),
            prompts,
            registry: registry.clone(),
            context: Arc::new(NoopContextLookup),
            config: config.clone(),
        },
    )
    .await
    .map_err(|e| std::io::Error::other(format!("failed to start supervisor: {e}")))?;

    let (orchestrator, notifier) =
        ractor::call!(supervisor, |reply| SupervisorMsg::GetRefs { reply })
            .map_err(|e| std::io::Error::other(e.to_string()))?;

    // Settle sessions recorded before the restart: resume live streams,
    // synthesize terminal events for finished ones, fail the lost ones.
    match ractor::call!(orchestrator, |reply| OrchestratorMsg::Reconcile { reply }) {
        Ok(count) => tracing::info!(sessions = count, "Reconciled recorded builder sessions"),
        Err(e) => tracing::error!(error = %e, "Reconciliation failed"),
    }

    let conversation = Arc::new(ConversationLog::new(config.conversation_capacity));
    let app_state = AppState::new(
        event_store,
        orchestrator,
        notifier,
        registry,
        conversation,
        config.command_queue_depth,
    );

    let allowed_origins = ["http://localhost:3000", "http://127.0.0.1:3000"]
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    let app = api::router().with_state(api::ApiState { app: app_state }).layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(%addr, "Starting fan-out HTTP server");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}
