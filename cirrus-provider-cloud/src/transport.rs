//! HTTP transport
//!
//! Service clients hand a fully built, signed [`HttpRequest`] to a
//! [`Transport`]. The production transport is backed by `reqwest`; tests use
//! [`MockTransport`], which replays scripted responses and records every
//! request it saw.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialized body, as sent on the wire and as signed
    pub fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            Some(body) => body.to_string().into_bytes(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::new(status, body.to_string())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Only transport failures are errors; any HTTP status
    /// comes back as a response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(insecure: bool, max_retries: u32) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("cirrus-provider-cloud/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Connection(e.to_string()))?;
        Ok(Self { client, max_retries })
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse, ApiError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| ApiError::Connection(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if request.body.is_some() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(request.body_bytes());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(e.to_string())
    } else if e.is_decode() {
        ApiError::Decode(e.to_string())
    } else {
        ApiError::Connection(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut attempt = 0;
        loop {
            match self.send_once(&request).await {
                Err(ApiError::Connection(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(url = %request.url, attempt, error = %msg, "connection failed, resending");
                    tokio::time::sleep(Duration::from_millis(500) * attempt).await;
                }
                other => return other,
            }
        }
    }
}

/// Scripted transport for tests.
///
/// Each route is a method plus URL suffix; its queued responses are served in
/// order and the last one repeats. Requests without a route get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

struct Route {
    method: Method,
    suffix: String,
    responses: VecDeque<Result<HttpResponse, ApiError>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for requests whose URL path ends with `suffix`
    pub fn on(&self, method: Method, suffix: &str, status: u16, body: serde_json::Value) -> &Self {
        let body = if body.is_null() { String::new() } else { body.to_string() };
        self.push(method, suffix, Ok(HttpResponse::new(status, body)))
    }

    /// Queue a transport failure
    pub fn fail(&self, method: Method, suffix: &str, error: ApiError) -> &Self {
        self.push(method, suffix, Err(error))
    }

    fn push(
        &self,
        method: Method,
        suffix: &str,
        response: Result<HttpResponse, ApiError>,
    ) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes.iter_mut().find(|r| r.method == method && r.suffix == suffix) {
            Some(route) => route.responses.push_back(response),
            None => routes.push(Route {
                method,
                suffix: suffix.to_string(),
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests matching `method` whose path ends with `suffix`
    pub fn requests_to(&self, method: Method, suffix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && path_of(&r.url).ends_with(suffix))
            .collect()
    }
}

fn path_of(url: &str) -> &str {
    url.split_once('?').map(|(path, _)| path).unwrap_or(url)
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let path = path_of(&request.url);
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        // Longest suffix wins so "/listeners/L" beats "/L"
        let route = routes
            .iter_mut()
            .filter(|r| r.method == request.method && path.ends_with(&r.suffix))
            .max_by_key(|r| r.suffix.len());

        match route {
            Some(route) if route.responses.len() > 1 => route
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, ""))),
            Some(route) => route
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, ""))),
            None => Ok(HttpResponse::new(404, "")),
        }
    }
}
