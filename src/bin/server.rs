//! ConvoCart Memory Server
//!
//! HTTP API for cache observability and conversational memory management.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convocart_memory::{
    memory::ProfileInsights, Config, ConversationContext, CustomerId, Error, InteractionOutcome,
    MemoryOrchestrator, MemoryProfile, Namespace, NamespaceStats, OrderSummary, Recommendation,
    SessionState, SessionStateUpdate,
};

/// Application state shared across handlers
struct AppState {
    memory: Arc<MemoryOrchestrator>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting ConvoCart Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let port = config.server_port;
    let memory = Arc::new(MemoryOrchestrator::new(config)?);
    let maintenance = memory.spawn_maintenance();

    let state = Arc::new(AppState { memory });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Cache management
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        // Customer memory
        .route("/customers/:id/invalidate", post(invalidate_customer))
        .route("/customers/:id/context", get(get_context))
        .route("/customers/:id/turns", post(add_turns))
        .route(
            "/customers/:id/session",
            axum::routing::put(update_session).delete(expire_session),
        )
        .route("/customers/:id/outcomes", post(record_outcome))
        .route("/customers/:id/profile", get(get_profile))
        .route("/customers/:id/recommendations", get(get_recommendations))
        // Long-term aggregation
        .route("/orders", post(record_order))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    for handle in maintenance {
        handle.abort();
    }

    Ok(())
}

/// Map a crate error to an HTTP status, logging server-side failures
fn status_for(err: Error) -> StatusCode {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::Oversize { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    status
}

fn parse_namespace(raw: Option<&str>) -> Result<Option<Namespace>, StatusCode> {
    raw.map(|ns| ns.parse::<Namespace>())
        .transpose()
        .map_err(|_| StatusCode::BAD_REQUEST)
}

// === Handlers ===

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    cache_bytes: u64,
    rebuilds: u64,
    namespaces: Vec<NamespaceStats>,
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cache_bytes: state.memory.cache().total_bytes(),
        rebuilds: state.memory.rebuild_count(),
        namespaces: state.memory.cache_stats(None),
    })
}

// --- Cache handlers ---

#[derive(Debug, Deserialize)]
struct NamespaceQuery {
    namespace: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatsEntry {
    #[serde(flatten)]
    stats: NamespaceStats,
    hit_rate: f64,
}

async fn cache_stats(
    State(state): State<SharedState>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<Vec<StatsEntry>>, StatusCode> {
    let namespace = parse_namespace(query.namespace.as_deref())?;

    let stats = state
        .memory
        .cache_stats(namespace)
        .into_iter()
        .map(|stats| StatsEntry {
            hit_rate: stats.hit_rate(),
            stats,
        })
        .collect();

    Ok(Json(stats))
}

#[derive(Debug, Default, Deserialize)]
struct ClearRequest {
    namespace: Option<String>,
}

#[derive(Debug, Serialize)]
struct CountResponse {
    count: usize,
}

async fn clear_cache(
    State(state): State<SharedState>,
    body: Option<Json<ClearRequest>>,
) -> Result<Json<CountResponse>, StatusCode> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let namespace = parse_namespace(req.namespace.as_deref())?;

    let count = state.memory.clear_cache(namespace);
    Ok(Json(CountResponse { count }))
}

async fn invalidate_customer(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
) -> Json<CountResponse> {
    let count = state.memory.invalidate_customer(customer_id);
    Json(CountResponse { count })
}

// --- Conversation handlers ---

#[derive(Debug, Serialize)]
struct ContextResponse {
    #[serde(flatten)]
    context: ConversationContext,
    formatted_context: String,
}

async fn get_context(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
) -> Result<Json<ContextResponse>, StatusCode> {
    let context = state
        .memory
        .get_conversation_context(customer_id)
        .await
        .map_err(status_for)?;

    Ok(Json(ContextResponse {
        formatted_context: context.format_for_prompt(),
        context,
    }))
}

#[derive(Debug, Deserialize)]
struct AddTurnRequest {
    user_message: String,
    assistant_response: String,
}

async fn add_turns(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
    Json(req): Json<AddTurnRequest>,
) -> Result<Json<SessionState>, StatusCode> {
    let session = state
        .memory
        .add_conversation_turn(customer_id, &req.user_message, &req.assistant_response)
        .await
        .map_err(status_for)?;

    Ok(Json(session))
}

async fn update_session(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
    Json(update): Json<SessionStateUpdate>,
) -> Result<Json<SessionState>, StatusCode> {
    let session = state
        .memory
        .update_session_state(customer_id, update)
        .await
        .map_err(status_for)?;

    Ok(Json(session))
}

async fn expire_session(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
) -> Result<StatusCode, StatusCode> {
    let ended = state
        .memory
        .expire_session(customer_id)
        .await
        .map_err(status_for)?;

    if ended {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct OutcomeRequest {
    outcome: String,
    #[serde(default)]
    details: serde_json::Map<String, serde_json::Value>,
}

async fn record_outcome(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
    Json(req): Json<OutcomeRequest>,
) -> Result<Json<InteractionOutcome>, StatusCode> {
    let outcome = state
        .memory
        .store_interaction_outcome(customer_id, &req.outcome, req.details)
        .await
        .map_err(status_for)?;

    Ok(Json(outcome))
}

// --- Long-term handlers ---

#[derive(Debug, Serialize)]
struct ProfileResponse {
    profile: MemoryProfile,
    insights: ProfileInsights,
}

async fn get_profile(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
) -> Result<Json<ProfileResponse>, StatusCode> {
    let profile = state
        .memory
        .get_customer_memory_profile(customer_id)
        .await
        .map_err(status_for)?;

    Ok(Json(ProfileResponse {
        insights: profile.insights(),
        profile,
    }))
}

async fn get_recommendations(
    State(state): State<SharedState>,
    Path(customer_id): Path<CustomerId>,
) -> Result<Json<Vec<Recommendation>>, StatusCode> {
    let context = state
        .memory
        .get_conversation_context(customer_id)
        .await
        .map_err(status_for)?;

    let recommendations = state
        .memory
        .get_contextual_recommendations(customer_id, &context)
        .await
        .map_err(status_for)?;

    Ok(Json(recommendations))
}

#[derive(Debug, Serialize)]
struct RecordOrderResponse {
    recorded: bool,
}

async fn record_order(
    State(state): State<SharedState>,
    Json(order): Json<OrderSummary>,
) -> Result<Json<RecordOrderResponse>, StatusCode> {
    let recorded = state
        .memory
        .record_order_completed(order)
        .await
        .map_err(status_for)?;

    Ok(Json(RecordOrderResponse { recorded }))
}
