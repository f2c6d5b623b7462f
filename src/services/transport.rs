//! HTTP transport seam.
//!
//! The engine only talks to the network through [`Transport`]; the
//! production implementation is [`ReqwestTransport`], tests plug in an
//! in-memory double.

use crate::errors::TransportError;
use crate::services::source::ByteStream;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Callback receiving the cumulative number of body bytes handed to the wire.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Head,
    Put,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
        }
    }
}

pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    /// Streamed payload of a known length.
    Stream { stream: ByteStream, length: u64 },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            RequestBody::Stream { length, .. } => {
                f.debug_struct("Stream").field("length", length).finish()
            }
        }
    }
}

/// A single HTTP request.
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout,
            progress: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn stream(mut self, stream: ByteStream, length: u64) -> Self {
        self.body = RequestBody::Stream { stream, length };
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A successful (status < 400) response.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Issues one request. Statuses >= 400 come back as [`TransportError`].
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let method = match request.method {
            Method::Head => reqwest::Method::HEAD,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
        };
        trace!("{} {}", request.method.as_str(), request.url);

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Stream { stream, length } => {
                let progress = request.progress.clone();
                let mut loaded = 0u64;
                let counted = stream.inspect_ok(move |chunk| {
                    loaded += chunk.len() as u64;
                    if let Some(progress) = &progress {
                        progress(loaded);
                    }
                });
                builder
                    .header(CONTENT_LENGTH, length)
                    .body(reqwest::Body::wrap_stream(counted))
            }
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        if status >= 400 {
            return Err(TransportError::from_status(
                status,
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

/// Join a base URL and a slash-separated object path, percent-encoding
/// each path component.
pub fn join_url(base: &str, path: &str) -> Result<String, TransportError> {
    let mut url = url::Url::parse(base)
        .map_err(|err| TransportError::Network(format!("invalid url `{}`: {}", base, err)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::Network(format!("url `{}` cannot be a base", base)))?;
        segments.pop_if_empty();
        segments.extend(path.split('/').filter(|part| !part.is_empty()));
    }
    Ok(url.to_string())
}
