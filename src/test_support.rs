//! In-memory Swift + Keystone double used by the unit tests.

use crate::errors::TransportError;
use crate::models::manifest::ManifestEntry;
use crate::services::auth::{Credentials, StorageEndpoint};
use crate::services::transport::{
    Method, RequestBody, Transport, TransportRequest, TransportResponse,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub(crate) const MOCK_AUTH_URL: &str = "http://identity.test/v2.0/";
pub(crate) const MOCK_ENDPOINT: &str = "http://swift.test/v1/AUTH_test";

pub(crate) fn test_credentials() -> Credentials {
    Credentials {
        auth_url: MOCK_AUTH_URL.into(),
        username: "uploader".into(),
        password: MemorySwift::PASSWORD.into(),
        tenant: "tenant".into(),
    }
}

pub(crate) fn test_endpoint() -> StorageEndpoint {
    StorageEndpoint {
        base_url: MOCK_ENDPOINT.into(),
        token: MemorySwift::TOKEN.into(),
    }
}

pub(crate) fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Deterministic bytes whose fixed-size windows all differ.
pub(crate) fn patterned(len: usize) -> Bytes {
    (0..len).map(|i| ((i * 7 + 3) % 251) as u8).collect::<Vec<_>>().into()
}

#[derive(Clone, Debug)]
pub(crate) struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub delete_at: Option<i64>,
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub url: String,
    /// `<container>/<object>` relative to the storage endpoint.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct Failure {
    method: Method,
    prefix: String,
    remaining: u32,
    status: u16,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    manifests: HashMap<String, Vec<ManifestEntry>>,
    requests: Vec<RecordedRequest>,
    failures: Vec<Failure>,
    concurrent: usize,
    max_concurrent: usize,
}

pub(crate) struct MemorySwift {
    state: Mutex<State>,
    latency: Duration,
}

struct InflightGuard<'a>(&'a Mutex<State>);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.concurrent -= 1;
        }
    }
}

impl MemorySwift {
    pub const TOKEN: &'static str = "tok-123";
    pub const PASSWORD: &'static str = "s3cret";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every request, so overlapping attempts are observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, path: &str, data: Bytes, delete_at: Option<i64>) {
        let etag = md5_hex(&data);
        self.lock().objects.insert(
            path.to_string(),
            StoredObject {
                data,
                etag,
                delete_at,
            },
        );
    }

    pub fn object(&self, path: &str) -> Option<StoredObject> {
        self.lock().objects.get(path).cloned()
    }

    pub fn manifest(&self, path: &str) -> Option<Vec<ManifestEntry>> {
        self.lock().manifests.get(path).cloned()
    }

    /// Concatenate the segments a manifest points at.
    pub fn read_manifest_object(&self, path: &str) -> Option<Bytes> {
        let state = self.lock();
        let entries = state.manifests.get(path)?;
        let mut out = BytesMut::new();
        for entry in entries {
            out.extend_from_slice(&state.objects.get(&entry.path)?.data);
        }
        Some(out.freeze())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn requests_with(&self, method: Method) -> Vec<RecordedRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|request| request.method == method && !request.path.is_empty())
            .cloned()
            .collect()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Fail the next `times` requests of `method` whose path starts with
    /// `prefix` with `status`.
    pub fn fail_next(&self, method: Method, prefix: &str, times: u32, status: u16) {
        self.lock().failures.push(Failure {
            method,
            prefix: prefix.to_string(),
            remaining: times,
            status,
        });
    }

    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    fn take_failure(&self, method: Method, path: &str) -> Option<u16> {
        let mut state = self.lock();
        let failure = state.failures.iter_mut().find(|failure| {
            failure.remaining > 0 && failure.method == method && path.starts_with(&failure.prefix)
        })?;
        failure.remaining -= 1;
        Some(failure.status)
    }

    fn authenticate(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let RequestBody::Json(body) = request.body else {
            return Err(TransportError::from_status(400, "expected json"));
        };
        let password = body["auth"]["passwordCredentials"]["password"].as_str();
        if password != Some(Self::PASSWORD) {
            return Err(TransportError::from_status(401, "invalid credentials"));
        }
        let catalog = json!({
            "access": {
                "token": { "id": Self::TOKEN },
                "serviceCatalog": [
                    { "name": "nova", "endpoints": [{ "publicURL": "http://compute.test" }] },
                    { "name": "swift", "endpoints": [{ "publicURL": MOCK_ENDPOINT, "region": "test" }] },
                ]
            }
        });
        Ok(response(200, BTreeMap::new(), catalog.to_string()))
    }

    fn head(&self, path: &str) -> Result<TransportResponse, TransportError> {
        let state = self.lock();
        let object = state.objects.get(path).ok_or(TransportError::NotFound)?;
        let mut headers = BTreeMap::new();
        headers.insert("etag".to_string(), object.etag.clone());
        headers.insert("content-length".to_string(), object.data.len().to_string());
        if let Some(at) = object.delete_at {
            headers.insert("x-delete-at".to_string(), at.to_string());
        }
        Ok(response(200, headers, ""))
    }

    fn post(&self, path: &str, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut state = self.lock();
        let object = state.objects.get_mut(path).ok_or(TransportError::NotFound)?;
        if request.header_value("x-remove-delete-at").is_some() {
            object.delete_at = None;
        } else if let Some(at) = request.header_value("x-delete-at") {
            let at = at
                .parse()
                .map_err(|_| TransportError::from_status(400, "bad X-Delete-At"))?;
            object.delete_at = Some(at);
        }
        Ok(response(202, BTreeMap::new(), ""))
    }

    async fn put(&self, path: &str, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let delete_at = request
            .header_value("x-delete-at")
            .and_then(|value| value.parse().ok());
        let is_manifest = request
            .query
            .iter()
            .any(|(key, value)| key == "multipart-manifest" && value == "put");
        let expected_etag = request.header_value("etag").map(str::to_string);
        let progress = request.progress.clone();

        if is_manifest {
            let RequestBody::Json(body) = request.body else {
                return Err(TransportError::from_status(400, "manifest must be json"));
            };
            return self.put_manifest(path, body, delete_at);
        }

        let (mut stream, length) = match request.body {
            RequestBody::Stream { stream, length } => (stream, length),
            RequestBody::Empty => return Err(TransportError::from_status(411, "length required")),
            RequestBody::Json(_) => return Err(TransportError::from_status(400, "unexpected json")),
        };
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| TransportError::Network(err.to_string()))?;
            data.extend_from_slice(&chunk);
            if let Some(progress) = &progress {
                progress(data.len() as u64);
            }
        }
        if data.len() as u64 != length {
            return Err(TransportError::from_status(400, "content length mismatch"));
        }
        let etag = md5_hex(&data);
        if expected_etag.is_some_and(|expected| expected != etag) {
            return Err(TransportError::from_status(422, "etag mismatch"));
        }

        let mut state = self.lock();
        state.manifests.remove(path);
        state.objects.insert(
            path.to_string(),
            StoredObject {
                data: data.freeze(),
                etag: etag.clone(),
                delete_at,
            },
        );
        let mut headers = BTreeMap::new();
        headers.insert("etag".to_string(), etag);
        Ok(response(201, headers, ""))
    }

    fn put_manifest(
        &self,
        path: &str,
        body: Value,
        delete_at: Option<i64>,
    ) -> Result<TransportResponse, TransportError> {
        let entries: Vec<ManifestEntry> = serde_json::from_value(body)
            .map_err(|err| TransportError::from_status(400, err.to_string()))?;
        let mut state = self.lock();
        let mut etags = String::new();
        for entry in &entries {
            let segment = state
                .objects
                .get(&entry.path)
                .filter(|segment| {
                    segment.etag == entry.digest && segment.data.len() as u64 == entry.size_bytes
                })
                .ok_or_else(|| {
                    TransportError::from_status(400, format!("bad segment {}", entry.path))
                })?;
            etags.push_str(&segment.etag);
        }
        let etag = format!("\"{}\"", md5_hex(etags.as_bytes()));
        state.objects.insert(
            path.to_string(),
            StoredObject {
                data: Bytes::new(),
                etag,
                delete_at,
            },
        );
        state.manifests.insert(path.to_string(), entries);
        Ok(response(201, BTreeMap::new(), ""))
    }
}

fn response(status: u16, headers: BTreeMap<String, String>, body: impl Into<Bytes>) -> TransportResponse {
    TransportResponse {
        status,
        headers,
        body: body.into(),
    }
}

impl Transport for MemorySwift {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let path = request
            .url
            .strip_prefix(MOCK_ENDPOINT)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_default();
        {
            let mut state = self.lock();
            state.requests.push(RecordedRequest {
                method: request.method,
                url: request.url.clone(),
                path: path.clone(),
                query: request.query.clone(),
                headers: request.headers.clone(),
            });
            state.concurrent += 1;
            state.max_concurrent = state.max_concurrent.max(state.concurrent);
        }
        let _inflight = InflightGuard(&self.state);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(status) = self.take_failure(request.method, &path) {
            return Err(TransportError::from_status(status, "injected failure"));
        }

        if request.url == format!("{}tokens", MOCK_AUTH_URL) {
            return self.authenticate(request);
        }
        if request.header_value("x-auth-token") != Some(Self::TOKEN) {
            return Err(TransportError::from_status(401, "missing token"));
        }
        match request.method {
            Method::Head => self.head(&path),
            Method::Post => self.post(&path, &request),
            Method::Put => self.put(&path, request).await,
        }
    }
}
