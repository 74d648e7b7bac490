use std::io::Cursor;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use burn::backend::NdArray;
use http_body_util::BodyExt;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use quickdraw_cnn::config::default_classes;
use quickdraw_cnn::infer::Classifier;
use quickdraw_cnn::model::SketchCnnConfig;
use quickdraw_cnn::server::{router, ErrorBody, PredictResponse};
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "sketch-boundary";

fn app() -> Router {
	let device = Default::default();
	let classes = default_classes();
	let model = SketchCnnConfig::new(classes.len())
		.with_channels([4, 4, 4])
		.with_hidden_size(8)
		.init::<NdArray>(&device);

	router(Classifier::<NdArray>::new(model, classes, device))
}

fn circle_png() -> Vec<u8> {
	let image = GrayImage::from_fn(280, 280, |x, y| {
		let (dx, dy) = (x as f32 - 140.0, y as f32 - 140.0);
		if dx * dx + dy * dy <= 80.0 * 80.0 { Luma([0]) } else { Luma([255]) }
	});

	let mut bytes = Cursor::new(Vec::new());
	DynamicImage::ImageLuma8(image).write_to(&mut bytes, ImageFormat::Png).unwrap();
	bytes.into_inner()
}

fn multipart(field: &str, content: &[u8]) -> Vec<u8> {
	let mut body = format!(
		"--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"canvas.png\"\r\nContent-Type: image/png\r\n\r\n"
	)
	.into_bytes();
	body.extend_from_slice(content);
	body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
	body
}

fn predict_request(uri: &str, body: Vec<u8>) -> Request<Body> {
	Request::builder()
		.method("POST")
		.uri(uri)
		.header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
		.body(Body::from(body))
		.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
	response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

fn is_percent(confidence: &str) -> bool {
	let Some(number) = confidence.strip_suffix('%') else {
		return false;
	};
	let Some((whole, fraction)) = number.split_once('.') else {
		return false;
	};

	!whole.is_empty()
		&& whole.chars().all(|c| c.is_ascii_digit())
		&& fraction.len() == 2
		&& fraction.chars().all(|c| c.is_ascii_digit())
}

#[tokio::test]
async fn predict_without_image_field_is_rejected() {
	let response = app()
		.oneshot(predict_request("/predict", multipart("drawing", &circle_png())))
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert_eq!(body.error, "No image uploaded");
}

#[tokio::test]
async fn predict_without_multipart_body_is_rejected() {
	let request = Request::builder()
		.method("POST")
		.uri("/predict")
		.body(Body::empty())
		.unwrap();

	let response = app().oneshot(request).await.unwrap();

	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert!(body.get("error").is_some());
}

#[tokio::test]
async fn predict_circle_returns_a_known_label() {
	let response = app()
		.oneshot(predict_request("/predict", multipart("image", &circle_png())))
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::OK);
	let body: PredictResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();

	assert!(default_classes().contains(&body.label), "unexpected label {}", body.label);
	assert!(is_percent(&body.confidence), "unexpected confidence {}", body.confidence);
	assert!(body.probabilities.is_none());
}

#[tokio::test]
async fn predict_can_list_every_class() {
	let response = app()
		.oneshot(predict_request("/predict?probabilities=true", multipart("image", &circle_png())))
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::OK);
	let body: PredictResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
	let probabilities = body.probabilities.unwrap();

	assert_eq!(probabilities.len(), default_classes().len());
	assert!(probabilities.iter().all(|class| is_percent(&class.confidence)));
}

#[tokio::test]
async fn undecodable_upload_is_a_bad_request() {
	let response = app()
		.oneshot(predict_request("/predict", multipart("image", b"not an image")))
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert!(body.error.starts_with("Could not read image"));
}

#[tokio::test]
async fn malformed_probabilities_flag_gets_a_json_error() {
	let response = app()
		.oneshot(predict_request("/predict?probabilities=maybe", multipart("image", &circle_png())))
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert!(body.error.starts_with("Invalid query"), "unexpected error {}", body.error);
}

#[tokio::test]
async fn oversized_upload_is_not_reported_as_missing() {
	let oversized = vec![0u8; 3 * 1024 * 1024];

	let response = app()
		.oneshot(predict_request("/predict", multipart("image", &oversized)))
		.await
		.unwrap();

	assert!(response.status().is_client_error(), "unexpected status {}", response.status());
	let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
	assert!(body.error.starts_with("Could not read upload"), "unexpected error {}", body.error);
}

#[tokio::test]
async fn health_reports_ok() {
	let response = app()
		.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_bytes(response).await, b"OK");
}

#[tokio::test]
async fn index_serves_the_drawing_page() {
	let response = app()
		.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::OK);
	let page = String::from_utf8(body_bytes(response).await).unwrap();
	assert!(page.contains("drawingCanvas"));
	assert!(page.contains("/static/script.js"));
}
