//! Aviary tile cache HTTP server.
//!
//! Thin axum transport over `aviary_cdn::Engine`, modeled on
//! `sx9-cdn-geospatial`'s `geospatial_server.rs` bin: env-driven startup,
//! `tracing_subscriber::fmt` init, a single `Arc<Engine>` as axum state,
//! one route per engine operation.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aviary_cdn::cache::CacheStats;
use aviary_cdn::config::EngineConfig;
use aviary_cdn::fetcher::ReqwestUpstreamClient;
use aviary_cdn::models::Viewport;
use aviary_cdn::{Engine, QueryResponse, TileDebugResponse};

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt as _};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

type AppState = Arc<Engine>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewportQuery {
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
    client_id: Option<String>,
}

impl From<&ViewportQuery> for Viewport {
    fn from(q: &ViewportQuery) -> Self {
        Viewport {
            min_lat: q.min_lat,
            max_lat: q.max_lat,
            min_lng: q.min_lng,
            max_lng: q.max_lng,
        }
    }
}

/// `GET /birds?minLat=&maxLat=&minLng=&maxLng=&clientId=` (spec.md §6
/// "Query endpoint").
async fn get_birds(
    State(engine): State<AppState>,
    Query(q): Query<ViewportQuery>,
) -> Result<Json<QueryResponse>, aviary_cdn::error::EngineError> {
    let viewport = Viewport::from(&q);
    let client_id = q.client_id.clone();
    let response = engine.query(viewport, client_id.as_deref()).await?;
    Ok(Json(response))
}

/// `GET /tiles/debug?minLat=&maxLat=&minLng=&maxLng=` — administrative
/// tile-grid introspection endpoint (spec.md §6).
async fn get_tile_debug(
    State(engine): State<AppState>,
    Query(q): Query<ViewportQuery>,
) -> Result<Json<TileDebugResponse>, aviary_cdn::error::EngineError> {
    let viewport = Viewport::from(&q);
    Ok(Json(engine.tile_debug(viewport)?))
}

/// `GET /notifications/:clientId` — server-sent events stream of
/// background-completion notifications (spec.md §4.7).
async fn notifications(
    State(engine): State<AppState>,
    Path(client_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = engine.subscribe(&client_id);
    let connected = futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().event("connected").data("{}"))
    });
    let updates = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("tileUpdate").data(data))
    });
    let stream = connected.chain(updates);

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn cache_stats(State(engine): State<AppState>) -> Json<CacheStats> {
    Json(engine.cache_stats())
}

async fn clear_expired_cache(State(engine): State<AppState>) -> Json<serde_json::Value> {
    let removed = engine.clear_expired_cache();
    Json(json!({ "removed": removed }))
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

fn router(engine: AppState) -> Router {
    Router::new()
        .route("/birds", get(get_birds))
        .route("/tiles/debug", get(get_tile_debug))
        .route("/notifications/:clientId", get(notifications))
        .route("/admin/cache-stats", get(cache_stats))
        .route("/admin/clear-expired-cache", post(clear_expired_cache))
        .route("/health", get(health))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aviary_cdn=info".parse()?),
        )
        .init();

    let config = EngineConfig::from_env()?;

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    info!("Starting aviary tile cache");
    info!("  Port: {}", port);
    info!("  Upstream: {}", config.upstream_base_url);
    info!("  Tile side: {} km", config.tile_side_km);

    let upstream = Arc::new(ReqwestUpstreamClient::new(
        config.upstream_base_url.clone(),
        config.upstream_api_key.clone(),
    ));

    let engine = Arc::new(Engine::new(config, upstream));
    Engine::spawn_sweeper(engine.clone());

    let app = router(engine);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
