//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::{Rgba, RgbaImage};
use layerflow::backends::{DecompositionBackend, DecompositionRequest};
use layerflow::{BackendKind, ImageCodec, LayerFlowError, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_KEY: &str = "test-key";
pub const MODEL_PATH: &str = "fal-ai/qwen-image-layered";
const BOUNDARY: &str = "layerflow-test-boundary";

/// One part of a multipart form
pub struct Part {
    pub name: &'static str,
    pub filename: Option<&'static str>,
    pub content_type: Option<&'static str>,
    pub data: Vec<u8>,
}

impl Part {
    pub fn file(filename: &'static str, content_type: &'static str, data: Vec<u8>) -> Self {
        Self {
            name: "image",
            filename: Some(filename),
            content_type: Some(content_type),
            data,
        }
    }

    pub fn text(name: &'static str, value: &str) -> Self {
        Self {
            name,
            filename: None,
            content_type: None,
            data: value.as_bytes().to_vec(),
        }
    }
}

/// `POST /api/decompose` with the given form parts
pub fn decompose_request(parts: &[Part]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", part.name);
        if let Some(filename) = part.filename {
            disposition.push_str(&format!("; filename=\"{filename}\""));
        }
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"\r\n");
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/decompose")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    ImageCodec::encode_png(&RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255])))
        .unwrap()
}

pub async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Backend returning a fixed result and counting its invocations
pub struct StubBackend {
    kind: BackendKind,
    result: std::result::Result<Vec<String>, fn() -> LayerFlowError>,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<DecompositionRequest>>,
}

impl StubBackend {
    pub fn returning(kind: BackendKind, layers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Ok(layers.iter().map(|s| (*s).to_string()).collect()),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn failing(kind: BackendKind, error: fn() -> LayerFlowError) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Err(error),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecompositionBackend for StubBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn decompose(&self, request: DecompositionRequest) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        match &self.result {
            Ok(layers) => Ok(layers.clone()),
            Err(make_error) => Err(make_error()),
        }
    }
}

/// In-process stand-in for the fal queue API
pub struct MockFal {
    pub base_url: String,
    pub state: Arc<MockFalState>,
}

pub struct MockFalState {
    /// Result payload served once the job completes
    pub payload: Value,
    /// Status polls answered `IN_PROGRESS` before `COMPLETED`
    pub pending_polls: usize,
    /// Terminal status reported after the pending polls
    pub final_status: &'static str,
    pub status_polls: AtomicUsize,
    pub submitted: Mutex<Option<Value>>,
}

impl MockFal {
    pub async fn start(payload: Value) -> Self {
        Self::start_with(payload, 1, "COMPLETED").await
    }

    pub async fn start_with(
        payload: Value,
        pending_polls: usize,
        final_status: &'static str,
    ) -> Self {
        let state = Arc::new(MockFalState {
            payload,
            pending_polls,
            final_status,
            status_polls: AtomicUsize::new(0),
            submitted: Mutex::new(None),
        });

        let app = Router::new()
            .route(&format!("/{MODEL_PATH}"), post(submit))
            .route(&format!("/{MODEL_PATH}/requests/:id/status"), get(status))
            .route(&format!("/{MODEL_PATH}/requests/:id"), get(result))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn submitted(&self) -> Option<Value> {
        self.state.submitted.lock().unwrap().clone()
    }

    pub fn status_polls(&self) -> usize {
        self.state.status_polls.load(Ordering::SeqCst)
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Key {TEST_KEY}"))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Invalid key"}))).into_response()
}

async fn submit(
    State(state): State<Arc<MockFalState>>,
    headers: HeaderMap,
    Json(arguments): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    *state.submitted.lock().unwrap() = Some(arguments);
    Json(json!({"request_id": "req-1"})).into_response()
}

async fn status(
    State(state): State<Arc<MockFalState>>,
    headers: HeaderMap,
    Path(_id): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let poll = state.status_polls.fetch_add(1, Ordering::SeqCst);
    let status = if poll < state.pending_polls {
        "IN_PROGRESS"
    } else {
        state.final_status
    };
    Json(json!({"status": status})).into_response()
}

async fn result(
    State(state): State<Arc<MockFalState>>,
    headers: HeaderMap,
    Path(_id): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(state.payload.clone()).into_response()
}
