//! HTTP server for sensor ingestion, dashboard queries and taste prediction.
//!
//! # Routes
//!
//! ```text
//! GET  /health                 liveness and version
//! POST /api/sensor             store one reading            → 201
//! GET  /api/sensor?limit=N     newest N readings, newest first
//! GET  /api/sensor/last24h     trailing window, oldest first
//! GET  /api/sensor/window?hours=H
//! POST /api/predict-taste      only when classifier credentials are set
//! ```

use crate::classifier::{ClassificationError, ClassifierConfig, Taste, TasteClassifier};
use crate::core::{
    IngestError, IngestionService, QueryService, ReadingPayload, StoredId, StoredReading,
    DEFAULT_RECENT_LIMIT, DEFAULT_WINDOW,
};
use crate::store::{PersistenceError, SharedStore};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: IpAddr,
    /// Port to bind to (0 for random)
    pub port: u16,
    /// Reading store shared by all requests
    pub store: SharedStore,
    /// Classifier endpoint; `None` leaves `/api/predict-taste` unrouted
    pub classifier: Option<ClassifierConfig>,
    /// Limit used by `GET /api/sensor` without `limit`
    pub default_limit: usize,
    /// Window served by `GET /api/sensor/last24h`
    pub window: Duration,
}

impl ServerConfig {
    /// Create a new server configuration bound to localhost
    pub fn new(port: u16, store: SharedStore) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            store,
            classifier: None,
            default_limit: DEFAULT_RECENT_LIMIT,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_classifier(mut self, classifier: Option<ClassifierConfig>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Shared server state
pub struct ServerState {
    ingestion: IngestionService,
    query: QueryService,
    classifier: Option<TasteClassifier>,
}

impl ServerState {
    /// Create new server state
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let classifier = match &config.classifier {
            Some(classifier_config) => Some(TasteClassifier::new(classifier_config.clone())?),
            None => None,
        };

        Ok(Self {
            ingestion: IngestionService::new(config.store.clone()),
            query: QueryService::new(config.store.clone())
                .with_default_limit(config.default_limit)
                .with_default_window(config.window),
            classifier,
        })
    }
}

/// Response from the ingest endpoint
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub message: String,
    pub id: StoredId,
}

/// Response from the predict-taste endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TasteResponse {
    pub taste: Taste,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn validation_error(error: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", error)
}

fn persistence_error(e: PersistenceError) -> ApiError {
    tracing::error!("Storage failure: {}", e);
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "PERSISTENCE_ERROR",
        e.to_string(),
    )
}

fn classification_error(e: ClassificationError) -> ApiError {
    let code = match e {
        ClassificationError::Transient(_) => "CLASSIFIER_UNAVAILABLE",
        ClassificationError::InvalidResponse(_) => "CLASSIFIER_INVALID_RESPONSE",
    };
    api_error(StatusCode::INTERNAL_SERVER_ERROR, code, e.to_string())
}

/// Query parameters for `GET /api/sensor`
#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

/// Query parameters for `GET /api/sensor/window`
#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub hours: Option<f64>,
}

/// Body of `POST /api/predict-taste`
#[derive(Debug, Deserialize)]
struct PredictRequest {
    #[serde(default)]
    readings: Option<ReadingPayload>,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/sensor
///
/// Accepts a partial reading from a sensor node and appends it to the store.
async fn post_reading(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let ingestion = state.ingestion.clone();
    let result = tokio::task::spawn_blocking(move || ingestion.ingest_json(&body))
        .await
        .map_err(|e| {
            tracing::error!("Ingest task failed: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "ingest task failed",
            )
        })?;

    match result {
        Ok(id) => Ok((
            StatusCode::CREATED,
            Json(IngestResponse {
                message: "Success".to_string(),
                id,
            }),
        )),
        Err(IngestError::Validation(e)) => {
            tracing::debug!("Rejected reading: {}", e);
            Err(validation_error(e.to_string()))
        }
        Err(IngestError::Persistence(e)) => Err(persistence_error(e)),
    }
}

/// GET /api/sensor
async fn list_readings(
    State(state): State<Arc<ServerState>>,
    params: Result<Query<RecentParams>, QueryRejection>,
) -> Result<Json<Vec<StoredReading>>, ApiError> {
    let Query(params) = params.map_err(|e| validation_error(e.body_text()))?;
    state
        .query
        .recent(params.limit)
        .map(Json)
        .map_err(persistence_error)
}

/// GET /api/sensor/last24h
async fn last_window(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<StoredReading>>, ApiError> {
    state.query.window(None).map(Json).map_err(persistence_error)
}

/// GET /api/sensor/window
async fn window_readings(
    State(state): State<Arc<ServerState>>,
    params: Result<Query<WindowParams>, QueryRejection>,
) -> Result<Json<Vec<StoredReading>>, ApiError> {
    let Query(params) = params.map_err(|e| validation_error(e.body_text()))?;

    let window = match params.hours {
        Some(hours) if hours.is_finite() && hours > 0.0 => {
            Some(Duration::try_from_secs_f64(hours * 3600.0).map_err(|_| {
                validation_error(format!("hours out of range: {hours}"))
            })?)
        }
        Some(hours) => {
            return Err(validation_error(format!(
                "hours must be a positive number, got {hours}"
            )))
        }
        None => None,
    };

    state.query.window(window).map(Json).map_err(persistence_error)
}

/// POST /api/predict-taste
///
/// Classifies the reading supplied by the dashboard. The store is not read.
async fn predict_taste(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<TasteResponse>, ApiError> {
    let classifier = state.classifier.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "CLASSIFIER_DISABLED",
            "taste classification is not configured",
        )
    })?;

    let request: PredictRequest = serde_json::from_slice(&body)
        .map_err(|e| validation_error(format!("Invalid request body: {e}")))?;
    let readings = request
        .readings
        .ok_or_else(|| validation_error("readings is required"))?;

    let taste = classifier
        .classify(&readings.values)
        .await
        .map_err(classification_error)?;

    Ok(Json(TasteResponse { taste }))
}

/// Build the application router
pub fn router(state: Arc<ServerState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/api/sensor", post(post_reading).get(list_readings))
        .route("/api/sensor/last24h", get(last_window))
        .route("/api/sensor/window", get(window_readings));

    if state.classifier.is_some() {
        app = app.route("/api/predict-taste", post(predict_taste));
    } else {
        tracing::warn!("Classifier credentials not configured; /api/predict-taste disabled");
    }

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .with_state(state)
}

async fn bind(config: ServerConfig) -> anyhow::Result<(TcpListener, Router)> {
    let state = Arc::new(ServerState::new(&config)?);
    let app = router(state);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Taste sensor hub listening on http://{}", listener.local_addr()?);
    Ok((listener, app))
}

/// Run the HTTP server until `shutdown` resolves
pub async fn serve<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (listener, app) = bind(config).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Run the HTTP server in the background
pub async fn run(config: ServerConfig) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let (listener, app) = bind(config).await?;
    let actual_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
