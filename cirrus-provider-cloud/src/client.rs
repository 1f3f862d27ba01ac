//! Authenticated client for one service endpoint

use std::sync::Arc;

use cirrus_core::error::ApiError;

use crate::auth::Authenticator;
use crate::transport::{HttpRequest, Method, Transport};

pub struct ServiceClient {
    service: String,
    endpoint: String,
    project_id: String,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .field("endpoint", &self.endpoint)
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl ServiceClient {
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        project_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            transport,
            auth,
        }
    }

    /// Same credentials and transport, different endpoint
    pub fn with_endpoint(&self, service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(
            service,
            endpoint,
            self.project_id.clone(),
            self.transport.clone(),
            self.auth.clone(),
        )
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    pub async fn get(&self, path: &str) -> Result<serde_json::Value, ApiError> {
        self.request(Method::Get, path, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        self.request(Method::Post, path, Some(body)).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        self.request(Method::Put, path, Some(body)).await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        self.request(Method::Patch, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<serde_json::Value, ApiError> {
        self.request(Method::Delete, path, None).await
    }

    /// DELETE with a request body (batch deletes)
    pub async fn delete_with(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        self.request(Method::Delete, path, Some(body)).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ApiError> {
        let url = self.url(path);
        let mut request = HttpRequest::new(method, url.clone());
        request.body = body;
        if !self.project_id.is_empty() {
            request
                .headers
                .insert("X-Project-Id".to_string(), self.project_id.clone());
        }
        self.auth.authorize(&mut request)?;

        tracing::debug!(service = %self.service, %method, %url, "request");
        let response = self.transport.send(request).await?;

        if response.status >= 400 {
            tracing::debug!(service = %self.service, %method, %url, status = response.status, "request failed");
            return Err(ApiError::Http {
                method: method.to_string(),
                url,
                status: response.status,
                body: response.body,
            });
        }
        if response.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&response.body)
            .map_err(|e| ApiError::Decode(format!("{} {}: {}", method, url, e)))
    }
}
