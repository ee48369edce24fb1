use std::{sync::Arc, time::Instant};

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::{
    config::ServerConfig,
    error::{ConfigError, PredictError, ServerError},
    inference::Classifier,
};

/// Name of the multipart field holding the image.
pub const FILE_FIELD: &str = "file";

/// Body of a successful prediction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub predicted_class: String,
}

/// Body of every error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Failure of a `/predict` request.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{detail}")]
    Multipart { status: StatusCode, detail: String },

    #[error("Missing multipart field `{0}`")]
    MissingField(&'static str),

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error("Inference task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Multipart { status, .. } => *status,
            Self::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Predict(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Predict(_) | Self::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::Multipart {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::Multipart {
            status: err.status(),
            detail: err.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Prediction failed: {self}");
        } else {
            log::warn!("Rejected prediction request: {self}");
        }

        let body = ErrorResponse {
            detail: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Shared, read-only state of the handlers.
pub struct AppState<B: Backend> {
    classifier: Arc<Classifier<B>>,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            classifier: self.classifier.clone(),
        }
    }
}

/// Builds the application: the `/predict` route, the body limit and the CORS policy.
pub fn router<B: Backend>(
    classifier: Arc<Classifier<B>>,
    config: &ServerConfig,
) -> Result<Router, ConfigError> {
    let cors = cors_layer(&config.allowed_origin)?;

    Ok(Router::new()
        .route("/predict", post(predict::<B>))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .with_state(AppState { classifier }))
}

/// Allows one origin with credentials, echoing back whatever method and headers the
/// browser asks for. Requests from any other origin get no `Access-Control-Allow-Origin`.
fn cors_layer(origin: &str) -> Result<CorsLayer, ConfigError> {
    let origin = HeaderValue::from_str(origin)
        .map_err(|_| ConfigError::InvalidOrigin(origin.to_string()))?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list([origin]))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

async fn predict<B: Backend>(
    State(state): State<AppState<B>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let bytes = read_file_field(multipart?).await?;
    let start = Instant::now();
    let size = bytes.len();

    // The forward pass is CPU bound, keep it off the async workers.
    let classifier = state.classifier.clone();
    let prediction = tokio::task::spawn_blocking(move || classifier.classify(&bytes)).await??;

    log::info!(
        "Predicted {} for a {size} byte upload in {:?}",
        prediction.label,
        start.elapsed()
    );
    log::debug!("Scores: {:?}", prediction.scores);

    Ok(Json(PredictResponse {
        predicted_class: prediction.label,
    }))
}

async fn read_file_field(mut multipart: Multipart) -> Result<axum::body::Bytes, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }

    Err(ApiError::MissingField(FILE_FIELD))
}

/// Serves `classifier` until Ctrl-C or SIGTERM.
pub async fn serve<B: Backend>(
    classifier: Classifier<B>,
    config: &ServerConfig,
) -> Result<(), ServerError> {
    let app = router(Arc::new(classifier), config)?;
    let address = config.address();
    let listener = TcpListener::bind(&address).await?;

    log::info!(
        "Listening on {address}, allowing cross-origin requests from {}",
        config.allowed_origin
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                log::error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received");
}
