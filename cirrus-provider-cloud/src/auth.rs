//! Request authentication
//!
//! Credentials stay opaque to the engine: a service client hands every
//! outgoing request to an [`Authenticator`], which adds whatever headers the
//! cloud expects.

use chrono::{DateTime, Utc};
use cirrus_core::error::ApiError;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::Credentials;
use crate::transport::HttpRequest;

pub const SIGNING_ALGORITHM: &str = "SDK-HMAC-SHA256";
const DATE_HEADER: &str = "X-Sdk-Date";
const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub trait Authenticator: Send + Sync {
    fn authorize(&self, request: &mut HttpRequest) -> Result<(), ApiError>;
}

pub fn from_credentials(credentials: Credentials) -> Box<dyn Authenticator> {
    match credentials {
        Credentials::Token(token) => Box::new(TokenAuth::new(token)),
        Credentials::AccessKey {
            access_key,
            secret_key,
        } => Box::new(AkSkSigner::new(access_key, secret_key)),
    }
}

/// Pre-issued IAM token sent as `X-Auth-Token`
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Authenticator for TokenAuth {
    fn authorize(&self, request: &mut HttpRequest) -> Result<(), ApiError> {
        request
            .headers
            .insert("X-Auth-Token".to_string(), self.token.clone());
        Ok(())
    }
}

/// Access key / secret key request signer
pub struct AkSkSigner {
    access_key: String,
    secret_key: String,
}

impl AkSkSigner {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Sign as of `now`; adds `Host`, `X-Sdk-Date` and `Authorization`
    pub fn sign_at(&self, request: &mut HttpRequest, now: DateTime<Utc>) -> Result<(), ApiError> {
        let url = url::Url::parse(&request.url).map_err(|e| ApiError::Connection(format!("invalid URL {}: {}", request.url, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(ApiError::Connection(format!("URL without host: {}", request.url))),
        };
        let date = now.format(DATE_FORMAT).to_string();
        request.headers.insert("Host".to_string(), host);
        request.headers.insert(DATE_HEADER.to_string(), date.clone());

        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.sort();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical = canonical_request(request, &url, &headers, &signed_headers);
        let string_to_sign = format!(
            "{}\n{}\n{}",
            SIGNING_ALGORITHM,
            date,
            hex::encode(Sha256::digest(canonical.as_bytes()))
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ApiError::Connection(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        request.headers.insert(
            "Authorization".to_string(),
            format!(
                "{} Access={}, SignedHeaders={}, Signature={}",
                SIGNING_ALGORITHM, self.access_key, signed_headers, signature
            ),
        );
        Ok(())
    }
}

impl Authenticator for AkSkSigner {
    fn authorize(&self, request: &mut HttpRequest) -> Result<(), ApiError> {
        self.sign_at(request, Utc::now())
    }
}

fn canonical_request(
    request: &HttpRequest,
    url: &url::Url,
    headers: &[(String, String)],
    signed_headers: &str,
) -> String {
    let mut path = url.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }

    let mut query: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                urlencoding::encode(&k).into_owned(),
                urlencoding::encode(&v).into_owned(),
            )
        })
        .collect();
    query.sort();
    let query = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method.as_str(),
        path,
        query,
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(request.body_bytes()))
    )
}
