//! Fake Swift + Keystone server for end-to-end tests.
//!
//! ## Routes
//! - `POST /v2.0/tokens`: Keystone v2 password auth, returns a catalog
//!   pointing at this server
//! - `PUT  /v1/{account}/{container}/{*key}`: store an object, or a manifest
//!   with `?multipart-manifest=put`
//! - `HEAD /v1/{account}/{container}/{*key}`: object metadata
//! - `POST /v1/{account}/{container}/{*key}`: update `X-Delete-At`

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{post, put},
};
use futures::StreamExt;
use md5::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;

pub const TOKEN: &str = "fake-token";
pub const PASSWORD: &str = "fake-password";

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: String,
    pub delete_at: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SloEntry {
    pub path: String,
    pub etag: String,
    pub size_bytes: u64,
}

#[derive(Default)]
struct Store {
    objects: HashMap<String, StoredObject>,
    manifests: HashMap<String, Vec<SloEntry>>,
    segment_puts: usize,
    heads: usize,
}

#[derive(Clone)]
pub struct FakeSwift {
    store: Arc<Mutex<Store>>,
    pub base_url: String,
}

/// Error rendered as a plain status + JSON body.
#[derive(Debug)]
struct FakeError {
    status: StatusCode,
    message: String,
}

impl FakeError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl IntoResponse for FakeError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));
        (self.status, body).into_response()
    }
}

impl FakeSwift {
    /// Bind a loopback port and serve in the background.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let fake = Self {
            store: Arc::new(Mutex::new(Store::default())),
            base_url: format!("http://{}", addr),
        };
        let app = routes().with_state(fake.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        fake
    }

    pub fn auth_url(&self) -> String {
        format!("{}/v2.0/", self.base_url)
    }

    pub fn object(&self, path: &str) -> Option<StoredObject> {
        self.store.lock().unwrap().objects.get(path).cloned()
    }

    pub fn manifest(&self, path: &str) -> Option<Vec<SloEntry>> {
        self.store.lock().unwrap().manifests.get(path).cloned()
    }

    /// Reassemble a manifest object from its segments.
    pub fn read_large_object(&self, path: &str) -> Option<Vec<u8>> {
        let store = self.store.lock().unwrap();
        let entries = store.manifests.get(path)?;
        let mut out = Vec::new();
        for entry in entries {
            out.extend_from_slice(&store.objects.get(&entry.path)?.data);
        }
        Some(out)
    }

    pub fn segment_puts(&self) -> usize {
        self.store.lock().unwrap().segment_puts
    }

    pub fn heads(&self) -> usize {
        self.store.lock().unwrap().heads
    }
}

fn routes() -> Router<FakeSwift> {
    Router::new()
        .route("/v2.0/tokens", post(issue_token))
        .route(
            "/v1/{account}/{container}/{*key}",
            put(upload_object).head(head_object).post(update_object),
        )
}

fn ensure_token(headers: &HeaderMap) -> Result<(), FakeError> {
    match headers.get("x-auth-token").and_then(|v| v.to_str().ok()) {
        Some(TOKEN) => Ok(()),
        _ => Err(FakeError::new(StatusCode::UNAUTHORIZED, "bad token")),
    }
}

fn delete_at_header(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("x-delete-at")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

async fn issue_token(State(fake): State<FakeSwift>, Json(body): Json<Value>) -> Response {
    if body["auth"]["passwordCredentials"]["password"].as_str() != Some(PASSWORD) {
        return FakeError::new(StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }
    Json(json!({
        "access": {
            "token": { "id": TOKEN },
            "serviceCatalog": [
                {
                    "name": "swift",
                    "endpoints": [{ "publicURL": format!("{}/v1/AUTH_test", fake.base_url) }]
                }
            ]
        }
    }))
    .into_response()
}

async fn upload_object(
    State(fake): State<FakeSwift>,
    Path((_account, container, key)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, FakeError> {
    ensure_token(&headers)?;
    let path = format!("{}/{}", container, key);

    let mut data = Vec::new();
    let mut digest = Context::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| FakeError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
        digest.consume(&chunk);
        data.extend_from_slice(&chunk);
    }
    let etag = format!("{:x}", digest.compute());
    let delete_at = delete_at_header(&headers);

    let mut store = fake.store.lock().unwrap();
    if query.get("multipart-manifest").map(String::as_str) == Some("put") {
        let entries: Vec<SloEntry> = serde_json::from_slice(&data)
            .map_err(|err| FakeError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
        for entry in &entries {
            let ok = store
                .objects
                .get(&entry.path)
                .map(|segment| segment.etag == entry.etag && segment.data.len() as u64 == entry.size_bytes)
                .unwrap_or(false);
            if !ok {
                return Err(FakeError::new(
                    StatusCode::BAD_REQUEST,
                    format!("invalid segment {}", entry.path),
                ));
            }
        }
        store.manifests.insert(path.clone(), entries);
        store.objects.insert(
            path,
            StoredObject {
                data: Vec::new(),
                etag: format!("\"{}\"", etag),
                delete_at,
            },
        );
        return Ok(StatusCode::CREATED.into_response());
    }

    if let Some(expected) = headers.get(header::ETAG).and_then(|v| v.to_str().ok()) {
        if expected != etag {
            return Err(FakeError::new(StatusCode::UNPROCESSABLE_ENTITY, "etag mismatch"));
        }
    }
    if key.starts_with("segments/") {
        store.segment_puts += 1;
    }
    store.manifests.remove(&path);
    store.objects.insert(
        path,
        StoredObject {
            data,
            etag: etag.clone(),
            delete_at,
        },
    );

    let mut response = StatusCode::CREATED.into_response();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

async fn head_object(
    State(fake): State<FakeSwift>,
    Path((_account, container, key)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, FakeError> {
    ensure_token(&headers)?;
    let mut store = fake.store.lock().unwrap();
    store.heads += 1;
    let object = store
        .objects
        .get(&format!("{}/{}", container, key))
        .ok_or_else(|| FakeError::new(StatusCode::NOT_FOUND, "no such object"))?;

    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&object.etag) {
        out.insert(header::ETAG, value);
    }
    if let Some(at) = object.delete_at {
        out.insert("x-delete-at", HeaderValue::from(at));
    }
    Ok(response)
}

async fn update_object(
    State(fake): State<FakeSwift>,
    Path((_account, container, key)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, FakeError> {
    ensure_token(&headers)?;
    let mut store = fake.store.lock().unwrap();
    let object = store
        .objects
        .get_mut(&format!("{}/{}", container, key))
        .ok_or_else(|| FakeError::new(StatusCode::NOT_FOUND, "no such object"))?;
    if headers.contains_key("x-remove-delete-at") {
        object.delete_at = None;
    } else if let Some(at) = delete_at_header(&headers) {
        object.delete_at = Some(at);
    }
    Ok(StatusCode::ACCEPTED.into_response())
}
