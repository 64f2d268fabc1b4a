//! Client for a Nostr delegation service: an HTTP helper that resolves NIP-05
//! identifiers, proxies images and reports its own health.
//!
//! Every lookup is optional from the caller's point of view. A disabled
//! service, a transport failure, a non-2xx status or an undecodable body all
//! mean "feature unavailable" and come back as `None`.

mod route;

pub use route::{DelegationRoute, ImageProxyRequest, Nip05Request};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// `code` value the service uses for success.
pub const STATUS_CODE_OK: i64 = 1;

/// Service settings, passed in at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Shared instance secret, sent as `pass`.
    pub secret: Option<String>,
    pub timeout_ms: u64,
    pub image_proxy_enabled: bool,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            secret: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            image_proxy_enabled: false,
        }
    }
}

impl DelegationConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("delegation service is disabled")]
    Disabled,
    #[error("delegation route {0} is disabled")]
    RouteDisabled(&'static str),
    #[error("invalid delegation base URL: {message}")]
    BaseUrl { message: String },
    #[error("delegation request failed: {message}")]
    Request { message: String },
    #[error("delegation request timed out after {0:?}")]
    Timeout(Duration),
    #[error("delegation read failed: {message}")]
    Read { message: String },
    #[error("delegation HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("delegation JSON decode failed: {message}")]
    Decode { message: String },
}

/// Body of `/nip05`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nip05Response {
    pub status: String,
    pub code: i64,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub updated_at: Option<u64>,
}

impl Nip05Response {
    /// The resolved public key, if the lookup succeeded.
    pub fn resolved_pubkey(&self) -> Option<&str> {
        if self.code == STATUS_CODE_OK {
            self.pubkey.as_deref()
        } else {
            None
        }
    }
}

/// Body of `/is_good`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub status: String,
    pub code: i64,
}

impl CheckStatus {
    pub fn is_good(&self) -> bool {
        self.code == STATUS_CODE_OK
    }
}

#[derive(Debug, Clone)]
pub struct DelegationClient {
    enabled: bool,
    base_url: Option<Url>,
    secret: Option<String>,
    image_proxy_enabled: bool,
    timeout: Duration,
    http: reqwest::Client,
}

impl DelegationClient {
    /// Build a client. The base URL is validated only when the service is
    /// enabled; a disabled client never makes requests.
    pub fn new(config: DelegationConfig) -> Result<Self, DelegationError> {
        let base_url = if config.enabled {
            Some(normalize_base_url(&config.base_url)?)
        } else {
            None
        };
        Ok(Self {
            enabled: config.enabled,
            base_url,
            secret: config.secret.filter(|secret| !secret.is_empty()),
            image_proxy_enabled: config.image_proxy_enabled,
            timeout: Duration::from_millis(config.timeout_ms.max(100)),
            http: reqwest::Client::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.base_url.is_some()
    }

    /// URL for `route`, or `None` when the service or that route is off.
    pub fn prepared_url(&self, route: &DelegationRoute) -> Option<Url> {
        self.checked_url(route).ok()
    }

    /// Fetch and decode `route`.
    pub async fn fetch_json<T>(&self, route: &DelegationRoute) -> Result<T, DelegationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = self.checked_url(route)?;
        debug!("delegation GET /{}", route.path());

        let request = self.http.get(url).send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                return Err(DelegationError::Request {
                    message: error.to_string(),
                });
            }
            Err(_) => return Err(DelegationError::Timeout(self.timeout)),
        };

        match tokio::time::timeout(self.timeout, decode_json_response(response)).await {
            Ok(result) => result,
            Err(_) => Err(DelegationError::Timeout(self.timeout)),
        }
    }

    /// Resolve a NIP-05 identifier through the service.
    pub async fn fetch_nip05(&self, nip05: &str) -> Option<Nip05Response> {
        let Some(request) = Nip05Request::new(nip05) else {
            warn!("skipping NIP-05 lookup for a blank identifier");
            return None;
        };
        let route = DelegationRoute::Nip05(request);
        self.fetch_json(&route)
            .await
            .inspect_err(|error| log_unavailable(&route, error))
            .ok()
    }

    /// Ask the instance whether it is healthy and accepts our secret.
    pub async fn check_status(&self) -> Option<CheckStatus> {
        let route = DelegationRoute::IsGood;
        self.fetch_json(&route)
            .await
            .inspect_err(|error| log_unavailable(&route, error))
            .ok()
    }

    /// Run [`DelegationClient::fetch_nip05`] on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_nip05(&self, nip05: impl Into<String>) -> DelegationTask<Option<Nip05Response>> {
        let client = self.clone();
        let nip05 = nip05.into();
        DelegationTask::spawn(async move { client.fetch_nip05(&nip05).await })
    }

    fn checked_url(&self, route: &DelegationRoute) -> Result<Url, DelegationError> {
        let base = match (&self.base_url, self.enabled) {
            (Some(base), true) => base,
            _ => return Err(DelegationError::Disabled),
        };
        if matches!(route, DelegationRoute::ImageProxy(_)) && !self.image_proxy_enabled {
            return Err(DelegationError::RouteDisabled(route.path()));
        }
        route
            .url(base, self.secret.as_deref())
            .ok_or_else(|| DelegationError::BaseUrl {
                message: format!("cannot join /{} onto {}", route.path(), base),
            })
    }
}

/// A delegation lookup running on its own task.
///
/// Dropping the handle or calling [`DelegationTask::cancel`] aborts the
/// request.
#[derive(Debug)]
pub struct DelegationTask<T> {
    result: oneshot::Receiver<T>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> DelegationTask<T> {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, result) = oneshot::channel();
        let handle = tokio::spawn(async move {
            // The receiver may have been dropped by a cancelled caller.
            let _ = tx.send(future.await);
        });
        Self { result, handle }
    }

    /// Wait for the result. `None` if the task was aborted.
    pub async fn wait(mut self) -> Option<T> {
        (&mut self.result).await.ok()
    }

    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Drop for DelegationTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn log_unavailable(route: &DelegationRoute, error: &DelegationError) {
    match error {
        DelegationError::Disabled | DelegationError::RouteDisabled(_) => {
            debug!("delegation /{} skipped: {}", route.path(), error);
        }
        _ => warn!("delegation /{} unavailable: {}", route.path(), error),
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url, DelegationError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(DelegationError::BaseUrl {
            message: "base URL is empty".to_string(),
        });
    }
    let url = Url::parse(trimmed).map_err(|error| DelegationError::BaseUrl {
        message: format!("{trimmed}: {error}"),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(DelegationError::BaseUrl {
            message: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(url)
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, DelegationError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| DelegationError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes).trim().to_string();
        return Err(DelegationError::Http {
            status,
            body: if body.is_empty() {
                "<empty>".to_string()
            } else {
                body
            },
        });
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| DelegationError::Decode {
        message: error.to_string(),
    })
}
