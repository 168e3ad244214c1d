//! HTTP surface
//!
//! Routes viewer and uploader requests to the per-protocol registries. All
//! endpoints share permissive CORS; handler faults are converted to plain
//! error responses by explicit `Result` returns, with a single
//! catch-panic layer as the last-resort 500.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::RelayError;
use crate::relay::{
    Broadcaster, HlsBroker, HlsBrokerStats, PulledBrokerStats, PulledFlvBroker, PushedBrokerStats,
    PushedFlvBroker, ViewerStream,
};
use crate::server::config::RelayConfig;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub http: reqwest::Client,
    pub flv: Arc<Broadcaster<PulledFlvBroker>>,
    pub camera: Arc<Broadcaster<PushedFlvBroker>>,
    pub hls: Arc<Broadcaster<HlsBroker>>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            flv: Arc::new(Broadcaster::new()),
            camera: Arc::new(Broadcaster::new()),
            hls: Arc::new(Broadcaster::new()),
        }
    }
}

/// Relay errors mapped onto HTTP responses.
struct HttpError(RelayError);

impl From<RelayError> for HttpError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(ping))
        .route("/live/stats", get(stats))
        .route("/live/flv/:broker_key/:client_id", get(flv_attach))
        .route("/live/camera/ingest/:broker_key", post(camera_ingest))
        .route("/live/camera/:broker_key/:client_id", get(camera_attach))
        .route("/live/hls/:broker_key/:client_id/*filepath", get(hls_serve))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

/// Viewer attaches to a pulled-FLV broker.
async fn flv_attach(
    State(state): State<AppState>,
    Path((broker_key, client_id)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    let broker = state.flv.find(&broker_key)?;
    let stream = broker.attach(&client_id)?;
    Ok(flv_response(stream))
}

/// Viewer attaches to a pushed-FLV broker.
async fn camera_attach(
    State(state): State<AppState>,
    Path((broker_key, client_id)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    let broker = state.camera.find(&broker_key)?;
    let stream = broker.attach(&client_id)?;
    Ok(flv_response(stream))
}

fn flv_response(stream: ViewerStream) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "video/x-flv")
        .header(header::TRANSFER_ENCODING, "chunked")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Uploader pushes raw FLV bytes into a pushed-FLV broker.
///
/// The broker is created on receipt of the request and stays registered
/// for a grace period after EOF so viewers drain gracefully.
async fn camera_ingest(
    State(state): State<AppState>,
    Path(broker_key): Path<String>,
    body: Body,
) -> Result<StatusCode, HttpError> {
    if let Some(old) = state.camera.remove(&broker_key) {
        old.close();
    }

    let broker = PushedFlvBroker::spawn(&broker_key, state.config.pushed.clone());
    state.camera.add(&broker_key, Arc::clone(&broker));

    broker.ingest(body.into_data_stream()).await?;

    let registry = Arc::clone(&state.camera);
    let key = broker_key.clone();
    let grace = broker.ingest_grace();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        // Only retire the broker this upload created; a newer upload under
        // the same key manages its own lifetime
        let still_ours = registry
            .find(&key)
            .map(|current| Arc::ptr_eq(&current, &broker))
            .unwrap_or(false);
        if still_ours {
            if let Some(broker) = registry.remove(&key) {
                broker.close();
            }
        }
    });

    Ok(StatusCode::OK)
}

/// Dual-purpose HLS endpoint: `.../index.m3u8` serves the synthesized
/// playlist, anything else serves segment bytes by local name.
async fn hls_serve(
    State(state): State<AppState>,
    Path((broker_key, client_id, filepath)): Path<(String, String, String)>,
) -> Result<Response, HttpError> {
    let broker = state.hls.find(&broker_key)?;

    if filepath.ends_with("index.m3u8") {
        let base = format!("/live/hls/{broker_key}/{client_id}");
        let playlist = broker.playlist(&base);
        return Ok(Response::builder()
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            )
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::from(playlist))
            .unwrap());
    }

    let name = filepath.rsplit('/').next().unwrap_or(filepath.as_str());
    let segment = broker.segment(name)?;

    let content_type = if name.ends_with(".ts") {
        "video/mp2t"
    } else if name.ends_with(".m4s") || name.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    };

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "public, max-age=60")
        .body(Body::from(segment.data))
        .unwrap())
}

#[derive(Serialize)]
struct StatsResponse {
    flv: Vec<PulledBrokerStats>,
    camera: Vec<PushedBrokerStats>,
    hls: Vec<HlsBrokerStats>,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        flv: state
            .flv
            .snapshot()
            .into_iter()
            .map(|(_, broker)| broker.stats())
            .collect(),
        camera: state
            .camera
            .snapshot()
            .into_iter()
            .map(|(_, broker)| broker.stats())
            .collect(),
        hls: state
            .hls
            .snapshot()
            .into_iter()
            .map(|(_, broker)| broker.stats())
            .collect(),
    })
}
