//! Credential exchange against a Keystone v2 identity service.

use crate::errors::{UploadError, UploadResult};
use crate::services::transport::{Method, Transport, TransportRequest, join_url};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the token on every storage request.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Clone)]
pub struct Credentials {
    /// Identity endpoint, e.g. `https://identity.example/v2.0/`.
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub tenant: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tenant", &self.tenant)
            .finish()
    }
}

/// One endpoint from the service catalog.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

/// Token plus the catalog it was issued with.
#[derive(Clone, Debug)]
pub struct AuthSession {
    pub token: String,
    pub endpoints: HashMap<String, Vec<ServiceEndpoint>>,
}

impl AuthSession {
    /// Resolve the first public endpoint of `service_name`.
    pub fn storage_endpoint(&self, service_name: &str) -> UploadResult<StorageEndpoint> {
        let url = self
            .endpoints
            .get(service_name)
            .and_then(|endpoints| endpoints.first())
            .map(|endpoint| endpoint.public_url.clone())
            .ok_or_else(|| {
                UploadError::auth(format!("no `{}` endpoint in service catalog", service_name))
            })?;
        Ok(StorageEndpoint {
            base_url: url,
            token: self.token.clone(),
        })
    }
}

/// Authenticated base URL of the object store.
#[derive(Clone)]
pub struct StorageEndpoint {
    pub base_url: String,
    pub token: String,
}

impl fmt::Debug for StorageEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageEndpoint")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl StorageEndpoint {
    /// Start an authenticated request for `<container>/<object>`.
    pub fn request(
        &self,
        method: Method,
        container: &str,
        object: &str,
        timeout: Duration,
    ) -> UploadResult<TransportRequest> {
        let url = join_url(&self.base_url, &format!("{}/{}", container, object))?;
        Ok(TransportRequest::new(method, url, timeout).header(AUTH_TOKEN_HEADER, &self.token))
    }
}

/// Exchanges credentials for a token and service catalog.
pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = UploadResult<AuthSession>> + Send;
}

#[derive(Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct Token {
    id: String,
}

#[derive(Deserialize)]
struct CatalogEntry {
    name: String,
    #[serde(default)]
    endpoints: Vec<ServiceEndpoint>,
}

/// Keystone v2 password authentication over any [`Transport`].
pub struct KeystoneAuthenticator<T> {
    transport: Arc<T>,
}

impl<T> KeystoneAuthenticator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

impl<T: Transport> Authenticator for KeystoneAuthenticator<T> {
    async fn authenticate(&self, credentials: &Credentials) -> UploadResult<AuthSession> {
        // The identity URL conventionally ends in a slash and `tokens` is
        // appended verbatim.
        let url = format!("{}tokens", credentials.auth_url);
        let body = json!({
            "auth": {
                "passwordCredentials": {
                    "username": credentials.username,
                    "password": credentials.password,
                },
                "tenantName": credentials.tenant,
            }
        });
        let request = TransportRequest::new(Method::Post, url, AUTH_TIMEOUT).json(body);

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|err| UploadError::auth(format!("token request failed: {}", err)))?;
        let parsed: TokenResponse = response
            .json()
            .map_err(|err| UploadError::auth(format!("malformed token response: {}", err)))?;

        let endpoints: HashMap<String, Vec<ServiceEndpoint>> = parsed
            .access
            .service_catalog
            .into_iter()
            .map(|entry| (entry.name, entry.endpoints))
            .collect();
        debug!(
            "authenticated as {} with {} catalog services",
            credentials.username,
            endpoints.len()
        );

        Ok(AuthSession {
            token: parsed.access.token.id,
            endpoints,
        })
    }
}
