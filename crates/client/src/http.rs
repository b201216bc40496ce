// HTTP client for the check-in backend.
//
// Session and CSRF cookies live in a shared jar. Mutating requests echo the
// `csrftoken` cookie back in the `X-CSRFToken` header.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use checkin_common::identity::SessionIdentity;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace};
use url::Url;

pub const CSRF_COOKIE: &str = "csrftoken";
pub const CSRF_HEADER: &str = "X-CSRFToken";

const CSRF_PATH: &str = "api/get-csrf-token/";
const LOGIN_PATH: &str = "api/login/";
const PROFILE_PATH: &str = "api/profile/";
const LOGOUT_PATH: &str = "api/logout/";

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Non-2xx answer from the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend returned {status}: {detail}")]
pub struct ApiError {
    pub status: StatusCode,
    /// The backend's `detail` message, or the raw body when it has none.
    pub detail: String,
}

impl ApiError {
    fn from_body(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| value.get("detail").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    trimmed.to_string()
                }
            });
        Self { status, detail }
    }

    /// Rejected credentials or a missing/expired session.
    pub fn is_auth_failure(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED || self.status == StatusCode::FORBIDDEN
    }
}

/// Whether requests with `method` must carry the CSRF header.
pub fn is_mutating(method: &Method) -> bool {
    [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(method)
}

/// Value of cookie `name` in a `Cookie:` header string.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Backend calls used by the session store.
pub trait AuthApi: Send + Sync {
    /// `GET /api/get-csrf-token/`; sets the `csrftoken` cookie.
    fn fetch_csrf_token(&self) -> impl Future<Output = Result<()>> + Send;

    /// `POST /api/login/`; returns the minimal identity and sets the session
    /// cookie.
    fn login(&self, username: &str, password: &str) -> impl Future<Output = Result<SessionIdentity>> + Send;

    /// `GET /api/profile/`.
    fn fetch_profile(&self) -> impl Future<Output = Result<SessionIdentity>> + Send;

    /// `POST /api/logout/`.
    fn logout(&self) -> impl Future<Output = Result<()>> + Send;
}

pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
    jar: Arc<Jar>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient").field("base_url", &self.base_url.as_str()).finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(base_url: Url) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(mut base_url: Url, timeout: Duration) -> Result<Self> {
        // Relative joins must keep any path prefix of the base.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { base_url, http, jar })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Current `csrftoken` cookie for the backend, if one was issued.
    pub fn csrf_token(&self) -> Option<String> {
        let header = self.cookie_header()?;
        cookie_value(&header, CSRF_COOKIE).map(str::to_owned)
    }

    /// All cookies the jar would send to the backend, as a `Cookie:` header.
    pub fn cookie_header(&self) -> Option<String> {
        let value = self.jar.cookies(&self.base_url)?;
        value.to_str().ok().map(str::to_owned)
    }

    /// Seed the jar from a header previously returned by
    /// [`ApiClient::cookie_header`].
    pub fn restore_cookies(&self, header: &str) {
        for pair in header.split(';').map(str::trim).filter(|pair| pair.contains('=')) {
            self.jar.add_cookie_str(&format!("{pair}; Path=/"), &self.base_url);
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid endpoint path `{path}`"))
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Response> {
        let url = self.endpoint(path)?;
        let mut request = self.http.request(method.clone(), url.clone());

        if is_mutating(&method) {
            match self.csrf_token() {
                Some(token) => request = request.header(CSRF_HEADER, token),
                None => debug!(%method, %url, "no csrftoken cookie; sending without CSRF header"),
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        trace!(%method, %url, "sending request");
        let response = request.send().await.with_context(|| format!("{method} {url} failed"))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = ApiError::from_body(status, &body);
        debug!(%method, %url, status = status.as_u16(), detail = %error.detail, "request rejected");
        Err(anyhow::Error::new(error).context(format!("{method} {url}")))
    }

    async fn decode<R: DeserializeOwned>(response: Response) -> Result<R> {
        let url = response.url().clone();
        let bytes = response.bytes().await.with_context(|| format!("failed to read response from {url}"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("invalid JSON from {url}"))
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let response = self.send(Method::GET, path, None).await?;
        Self::decode(response).await
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body).context("failed to encode request body")?;
        let response = self.send(Method::POST, path, Some(body)).await?;
        Self::decode(response).await
    }

    /// POST without a body; the response body is ignored.
    pub async fn post_empty(&self, path: &str) -> Result<()> {
        self.send(Method::POST, path, None).await?;
        Ok(())
    }
}

impl AuthApi for ApiClient {
    async fn fetch_csrf_token(&self) -> Result<()> {
        self.send(Method::GET, CSRF_PATH, None).await.context("failed to obtain CSRF cookie")?;
        if self.csrf_token().is_none() {
            debug!("backend did not set a csrftoken cookie");
        }
        Ok(())
    }

    async fn login(&self, username: &str, password: &str) -> Result<SessionIdentity> {
        self.post_json(LOGIN_PATH, &json!({ "username": username, "password": password }))
            .await
            .context("login request failed")
    }

    async fn fetch_profile(&self) -> Result<SessionIdentity> {
        self.get_json(PROFILE_PATH).await.context("profile request failed")
    }

    async fn logout(&self) -> Result<()> {
        self.post_empty(LOGOUT_PATH).await.context("logout request failed")
    }
}
