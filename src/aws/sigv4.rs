// file: src/aws/sigv4.rs
// version: 1.0.0
// guid: 0a7d3c5e-9b1f-4c62-8e4a-5f6b7c8d9e0f

//! AWS Signature Version 4 request signing

use crate::config::tool::{require, Ec2AuthConfig};
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, RequestBody};
use crate::utils::crypto::{hmac_sha256, sha256_hex};
use crate::Result;
use chrono::{DateTime, Utc};
use std::fmt;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AwsCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
        }
    }

    pub fn from_config(config: &Ec2AuthConfig) -> Result<Self> {
        Ok(Self {
            access_key: require(config.key.as_deref(), "ec2.auth.key")?.to_string(),
            secret_key: require(config.secret.as_deref(), "ec2.auth.secret")?.to_string(),
            session_token: config.token.clone(),
        })
    }
}

/// Percent-encode everything except the RFC 3986 unreserved set
pub fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn canonical_query(url: &url::Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn host_header(url: &url::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| CloudImagesError::validation(format!("URL without host: {}", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Signs requests for one service in one region
#[derive(Debug, Clone)]
pub struct Signer<'a> {
    pub credentials: &'a AwsCredentials,
    pub service: &'a str,
    pub region: &'a str,
}

impl Signer<'_> {
    fn scope(&self, date: &str) -> String {
        format!("{}/{}/{}/aws4_request", date, self.region, self.service)
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k_date = hmac_sha256(format!("AWS4{}", self.credentials.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }

    /// Canonical request and signed header list
    fn canonical_request(&self, request: &HttpRequest, payload_hash: &str) -> Result<(String, String)> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| CloudImagesError::validation(format!("Invalid URL {}: {}", request.url, e)))?;

        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.push(("host".to_string(), host_header(&url)?));
        headers.sort();

        let canonical_headers: String = headers.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let path = if url.path().is_empty() { "/" } else { url.path() };

        let canonical = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method.as_str(),
            path,
            canonical_query(&url),
            canonical_headers,
            signed_headers,
            payload_hash
        );
        Ok((canonical, signed_headers))
    }

    /// Add `X-Amz-Date`, the session token and `Authorization`.
    ///
    /// S3 also gets `X-Amz-Content-Sha256`; file bodies are sent unsigned.
    pub fn sign(&self, request: HttpRequest, now: DateTime<Utc>) -> Result<HttpRequest> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let payload_hash = match &request.body {
            RequestBody::Empty => sha256_hex(b""),
            RequestBody::Bytes(bytes) => sha256_hex(bytes),
            RequestBody::File { .. } => UNSIGNED_PAYLOAD.to_string(),
        };

        let mut request = request.header("X-Amz-Date", &amz_date);
        if self.service == "s3" {
            request = request.header("X-Amz-Content-Sha256", &payload_hash);
        }
        if let Some(token) = &self.credentials.session_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let (canonical, signed_headers) = self.canonical_request(&request, &payload_hash)?;
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            self.scope(&date),
            sha256_hex(canonical.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(&self.signing_key(&date), string_to_sign.as_bytes()));

        Ok(request.header(
            "Authorization",
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM,
                self.credentials.access_key,
                self.scope(&date),
                signed_headers,
                signature
            ),
        ))
    }
}
