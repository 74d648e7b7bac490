use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use burn::prelude::Backend;
use log::{error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::error::ClassifierError;
use crate::infer::{format_percent, Classifier, Prediction};

const INDEX_HTML: &str = include_str!("../static/index.html");
const SCRIPT_JS: &str = include_str!("../static/script.js");

/// Multipart field the drawing is uploaded under.
pub const IMAGE_FIELD: &str = "image";

/// The model is only ever read, the mutex is there because burn modules are `Send` but not `Sync`.
pub struct AppState<B: Backend> {
	classifier: Arc<Mutex<Classifier<B>>>,
}

impl<B: Backend> Clone for AppState<B> {
	fn clone(&self) -> Self {
		Self { classifier: Arc::clone(&self.classifier) }
	}
}

impl<B: Backend> AppState<B> {
	pub fn new(classifier: Classifier<B>) -> Self {
		Self { classifier: Arc::new(Mutex::new(classifier)) }
	}
}

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("No image uploaded")]
	MissingImage,
	#[error("Could not read image: {0}")]
	InvalidImage(String),
	#[error("Invalid query: {0}")]
	InvalidQuery(String),
	#[error("Could not read upload: {message}")]
	UnreadableUpload { status: StatusCode, message: String },
	#[error("{0}")]
	Internal(String),
}

impl From<MultipartError> for ApiError {
	fn from(err: MultipartError) -> Self {
		ApiError::UnreadableUpload { status: err.status(), message: err.body_text() }
	}
}

impl From<ClassifierError> for ApiError {
	fn from(err: ClassifierError) -> Self {
		match err {
			ClassifierError::Image(err) => ApiError::InvalidImage(err.to_string()),
			other => ApiError::Internal(other.to_string()),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: String,
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self {
			ApiError::MissingImage | ApiError::InvalidImage(_) | ApiError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
			ApiError::UnreadableUpload { status, .. } => *status,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		if status.is_server_error() {
			error!("Prediction failed: {self}");
		}

		(status, Json(ErrorBody { error: self.to_string() })).into_response()
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictParams {
	#[serde(default)]
	pub probabilities: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfidence {
	pub label: String,
	pub confidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
	pub label: String,
	pub confidence: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub probabilities: Option<Vec<ClassConfidence>>,
}

impl PredictResponse {
	fn new(prediction: Prediction, classes: &[String], with_probabilities: bool) -> Self {
		let probabilities = with_probabilities.then(|| {
			prediction
				.breakdown(classes)
				.into_iter()
				.map(|(label, probability)| ClassConfidence {
					label: label.to_string(),
					confidence: format_percent(probability),
				})
				.collect()
		});

		Self {
			confidence: prediction.confidence_percent(),
			label: prediction.label,
			probabilities,
		}
	}
}

pub fn router<B: Backend>(classifier: Classifier<B>) -> Router {
	Router::new()
		.route("/", get(index))
		.route("/static/script.js", get(script))
		.route("/predict", post(predict::<B>))
		.route("/health", get(health))
		.layer(TraceLayer::new_for_http())
		.with_state(AppState::new(classifier))
}

pub async fn serve<B: Backend>(addr: SocketAddr, classifier: Classifier<B>) -> std::io::Result<()> {
	let app = router(classifier);
	let listener = TcpListener::bind(addr).await?;
	info!("Listening on http://{}", listener.local_addr()?);

	axum::serve(listener, app).await
}

async fn index() -> Html<&'static str> {
	Html(INDEX_HTML)
}

async fn script() -> impl IntoResponse {
	([(header::CONTENT_TYPE, "application/javascript")], SCRIPT_JS)
}

async fn health() -> &'static str {
	"OK"
}

async fn predict<B: Backend>(
	State(state): State<AppState<B>>,
	params: Result<Query<PredictParams>, QueryRejection>,
	multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
	let Query(params) = params.map_err(|rejection| ApiError::InvalidQuery(rejection.body_text()))?;
	let bytes = read_image_field(multipart.map_err(|_| ApiError::MissingImage)?).await?;

	let classifier = Arc::clone(&state.classifier);
	let response = tokio::task::spawn_blocking(move || {
		let classifier = classifier
			.lock()
			.map_err(|_| ApiError::Internal("Classifier lock poisoned".to_string()))?;
		let prediction = classifier.predict_bytes(&bytes)?;

		Ok::<_, ApiError>(PredictResponse::new(prediction, classifier.classes(), params.probabilities))
	})
	.await
	.map_err(|err| ApiError::Internal(err.to_string()))??;

	info!("Predicted {} with confidence {}", response.label, response.confidence);
	Ok(Json(response))
}

async fn read_image_field(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
	while let Some(field) = multipart.next_field().await? {
		if field.name() != Some(IMAGE_FIELD) {
			continue;
		}

		let bytes = field.bytes().await?;
		if bytes.is_empty() {
			return Err(ApiError::MissingImage);
		}
		return Ok(bytes.to_vec());
	}

	Err(ApiError::MissingImage)
}
