// file: src/gce/auth.rs
// version: 1.0.0
// guid: 4b8d2f6a-1c3e-4a95-8d7b-5e6f7a8b9c0d

//! Google service account tokens (JWT bearer grant)

use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpTransport};
use crate::utils::crypto::base64_decode;
use crate::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const SCOPE_CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

/// The parts of a service account key file that are used
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|e| {
            CloudImagesError::config(format!("Failed to read credentials {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// DER body of a PEM block
fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----") && !line.is_empty())
        .collect();
    base64_decode(&body)
}

fn b64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: i64,
}

pub struct GoogleAuth {
    key: ServiceAccountKey,
    key_pair: RsaKeyPair,
    http: Arc<dyn HttpTransport>,
    scope: String,
    clock: fn() -> i64,
    token: Mutex<Option<AccessToken>>,
}

impl GoogleAuth {
    pub fn new(key: ServiceAccountKey, http: Arc<dyn HttpTransport>) -> Result<Self> {
        let der = pem_to_der(&key.private_key)?;
        let key_pair = RsaKeyPair::from_pkcs8(&der)
            .map_err(|e| CloudImagesError::auth(format!("Invalid service account key: {}", e)))?;
        Ok(Self {
            key,
            key_pair,
            http,
            scope: SCOPE_CLOUD_PLATFORM.to_string(),
            clock: || chrono::Utc::now().timestamp(),
            token: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &ServiceAccountKey {
        &self.key
    }

    fn token_uri(&self) -> &str {
        self.key.token_uri.as_deref().unwrap_or(TOKEN_URI)
    }

    /// Signed RS256 assertion for the token endpoint
    pub fn assertion(&self, now: i64) -> Result<String> {
        let header = json!({"alg": "RS256", "typ": "JWT"});
        let claims = json!({
            "iss": self.key.client_email,
            "scope": self.scope,
            "aud": self.token_uri(),
            "iat": now,
            "exp": now + ASSERTION_LIFETIME_SECS,
        });
        let signing_input = format!(
            "{}.{}",
            b64(&serde_json::to_vec(&header)?),
            b64(&serde_json::to_vec(&claims)?)
        );

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &SystemRandom::new(), signing_input.as_bytes(), &mut signature)
            .map_err(|_| CloudImagesError::auth("Failed to sign token assertion"))?;
        Ok(format!("{}.{}", signing_input, b64(&signature)))
    }

    /// Cached access token, refreshed a minute before expiry
    pub async fn token(&self) -> Result<String> {
        let now = (self.clock)();
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - REFRESH_MARGIN_SECS > now {
                return Ok(token.token.clone());
            }
        }

        debug!("Requesting access token for {}", self.key.client_email);
        let assertion = self.assertion(now)?;
        let request =
            HttpRequest::post(self.token_uri()).form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())]);
        let response = self.http.send(request).await?;
        if !response.is_success() {
            return Err(CloudImagesError::auth(format!(
                "Token request failed with {}: {}",
                response.status,
                response.text().trim()
            )));
        }
        let body: Value = response.json()?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudImagesError::auth("Token response lacks access_token"))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_i64).unwrap_or(3600);

        *cached = Some(AccessToken {
            token: token.clone(),
            expires_at: now + expires_in,
        });
        Ok(token)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const TEST_KEY: &str = include_str!("testdata/test-key.pem");

    pub fn key() -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "uploader@debian-cloud.iam.gserviceaccount.com".to_string(),
            private_key: TEST_KEY.to_string(),
            project_id: Some("debian-cloud".to_string()),
            token_uri: Some("https://oauth2.test/token".to_string()),
        }
    }

    /// Token endpoint answer
    pub fn token_response() -> crate::network::http::HttpResponse {
        crate::network::http::HttpResponse::new(200)
            .with_json(&json!({"access_token": "ya29.test", "expires_in": 3599, "token_type": "Bearer"}))
    }
}
