// file: src/azure/auth.rs
// version: 1.0.0
// guid: 8c5a2e7f-4d1b-4a39-b6e2-e7f8a9b0c1d2

//! Azure access tokens
//!
//! Tokens come from a service principal (client credentials grant) or from
//! the Azure CLI. They are cached per (scope, subscription) and refreshed
//! once they are within a minute of expiry. Each key has its own lock, so a
//! slow login for one scope does not hold up the others.

use crate::config::tool::AzureAuthConfig;
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpTransport};
use crate::utils::system::{run_checked, CommandRunner, CommandSpec};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const SCOPE_MANAGEMENT: &str = "https://management.azure.com/.default";
pub const SCOPE_STORAGE: &str = "https://storage.azure.com/.default";

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const REFRESH_MARGIN_SECS: i64 = 60;

/// How tokens are obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ServicePrincipal {
        tenant: String,
        client: String,
        secret: String,
    },
    /// `az account get-access-token`
    Cli,
    /// A token acquired elsewhere, used for every scope
    Token(String),
}

impl Credentials {
    /// Service principal when tenant, client and secret are configured,
    /// the Azure CLI otherwise. `tenant` overrides the configured tenant.
    pub fn from_config(config: &AzureAuthConfig, tenant: Option<&str>) -> Self {
        let tenant = tenant.or(config.tenant.as_deref());
        match (tenant, &config.client, &config.secret) {
            (Some(tenant), Some(client), Some(secret)) => Credentials::ServicePrincipal {
                tenant: tenant.to_string(),
                client: client.clone(),
                secret: secret.clone(),
            },
            _ => Credentials::Cli,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AccessToken {
    token: String,
    expires_on: i64,
}

type TokenKey = (String, Option<String>);
type TokenSlot = Arc<Mutex<Option<AccessToken>>>;

pub struct AzureAuth {
    credentials: Credentials,
    http: Arc<dyn HttpTransport>,
    runner: Arc<dyn CommandRunner>,
    login_base: String,
    clock: fn() -> i64,
    tokens: Mutex<HashMap<TokenKey, TokenSlot>>,
}

impl AzureAuth {
    pub fn new(
        credentials: Credentials,
        http: Arc<dyn HttpTransport>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            credentials,
            http,
            runner,
            login_base: LOGIN_BASE.to_string(),
            clock: || chrono::Utc::now().timestamp(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Override the token endpoint base URL
    pub fn with_login_base(mut self, base: impl Into<String>) -> Self {
        self.login_base = base.into();
        self
    }

    /// Override the clock returning unix seconds
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Bearer token for `scope`, fetched or refreshed as needed.
    ///
    /// Refreshes of the same key are serialized, so concurrent callers do
    /// not stampede the token endpoint.
    pub async fn token(&self, scope: &str, subscription: Option<&str>) -> Result<String> {
        if let Credentials::Token(token) = &self.credentials {
            return Ok(token.clone());
        }

        let key = (scope.to_string(), subscription.map(str::to_string));
        let slot = self.tokens.lock().await.entry(key).or_default().clone();
        let mut cached_token = slot.lock().await;
        let now = (self.clock)();
        if let Some(cached) = cached_token.as_ref() {
            if now + REFRESH_MARGIN_SECS < cached.expires_on {
                return Ok(cached.token.clone());
            }
            debug!("Token for {} expires at {}, refreshing", scope, cached.expires_on);
        }

        let fetched = match &self.credentials {
            Credentials::ServicePrincipal {
                tenant,
                client,
                secret,
            } => match self.fetch_client_credentials(tenant, client, secret, scope).await {
                Ok(token) => token,
                Err(e) => {
                    warn!("Service principal login failed ({}), retrying with Azure CLI", e);
                    self.fetch_cli(scope, subscription).await?
                }
            },
            _ => self.fetch_cli(scope, subscription).await?,
        };

        let token = fetched.token.clone();
        *cached_token = Some(fetched);
        Ok(token)
    }

    async fn fetch_client_credentials(
        &self,
        tenant: &str,
        client: &str,
        secret: &str,
        scope: &str,
    ) -> Result<AccessToken> {
        let url = format!("{}/{}/oauth2/token", self.login_base, tenant);
        debug!("Requesting token for {} from {}", scope, url);
        let response = self
            .http
            .send(HttpRequest::post(url).form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client),
                ("client_secret", secret),
                ("scope", scope),
            ]))
            .await?
            .error_for_status("Service principal login")
            .map_err(|e| CloudImagesError::auth(e.to_string()))?;

        let body: Value = response.json()?;
        parse_token(&body, "access_token")
    }

    async fn fetch_cli(&self, scope: &str, subscription: Option<&str>) -> Result<AccessToken> {
        let mut command = CommandSpec::new("az")
            .args(["account", "get-access-token"])
            .arg(format!("--scope={}", scope));
        if let Some(subscription) = subscription {
            command = command.arg(format!("--subscription={}", subscription));
        }
        let output = run_checked(self.runner.as_ref(), &command.arg("--output=json")).await?;
        let body: Value = serde_json::from_slice(&output.stdout)?;
        parse_token(&body, "accessToken")
    }
}

fn parse_token(body: &Value, token_field: &str) -> Result<AccessToken> {
    let token = body
        .get(token_field)
        .and_then(Value::as_str)
        .ok_or_else(|| CloudImagesError::auth(format!("Token response lacks '{}'", token_field)))?;
    // Numeric or stringified unix seconds, depending on the endpoint
    let expires_on = match body.get("expires_on") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| CloudImagesError::auth("Token response lacks 'expires_on'"))?;

    Ok(AccessToken {
        token: token.to_string(),
        expires_on,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::http::testing::MockTransport;
    use crate::network::http::HttpResponse;
    use crate::utils::system::testing::RecordingRunner;
    use crate::utils::system::CommandOutput;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn service_principal() -> Credentials {
        Credentials::ServicePrincipal {
            tenant: "tenant-1".to_string(),
            client: "client-1".to_string(),
            secret: "s3cret".to_string(),
        }
    }

    fn token_endpoint() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|_| {
            HttpResponse::new(200).with_json(&json!({
                "access_token": "sp-token",
                "expires_on": "1000",
            }))
        }))
    }

    #[tokio::test]
    async fn test_service_principal_token_is_cached_per_scope() {
        let http = token_endpoint();
        let auth = AzureAuth::new(service_principal(), http.clone(), Arc::new(RecordingRunner::succeeding()))
            .with_clock(|| 100);

        assert_eq!(auth.token(SCOPE_MANAGEMENT, Some("sub")).await.unwrap(), "sp-token");
        auth.token(SCOPE_MANAGEMENT, Some("sub")).await.unwrap();
        auth.token(SCOPE_STORAGE, Some("sub")).await.unwrap();

        let requests = http.recorded();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "https://login.microsoftonline.com/tenant-1/oauth2/token");
        let form = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(form.contains("grant_type=client_credentials"));
        assert!(form.contains("client_id=client-1"));
    }

    static NOW: AtomicI64 = AtomicI64::new(0);

    #[tokio::test]
    async fn test_token_refreshed_near_expiry() {
        let http = token_endpoint();
        let auth = AzureAuth::new(service_principal(), http.clone(), Arc::new(RecordingRunner::succeeding()))
            .with_clock(|| NOW.load(Ordering::SeqCst));

        NOW.store(900, Ordering::SeqCst);
        auth.token(SCOPE_MANAGEMENT, None).await.unwrap();
        NOW.store(939, Ordering::SeqCst);
        auth.token(SCOPE_MANAGEMENT, None).await.unwrap();
        assert_eq!(http.recorded().len(), 1);

        // Within 60 seconds of expires_on
        NOW.store(940, Ordering::SeqCst);
        auth.token(SCOPE_MANAGEMENT, None).await.unwrap();
        assert_eq!(http.recorded().len(), 2);
    }

    /// Login endpoint that answers only once two requests are in flight
    struct RendezvousEndpoint {
        barrier: tokio::sync::Barrier,
        inner: Arc<MockTransport>,
    }

    #[async_trait::async_trait]
    impl HttpTransport for RendezvousEndpoint {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.barrier.wait().await;
            self.inner.send(request).await
        }
    }

    #[tokio::test]
    async fn test_different_scopes_fetch_concurrently() {
        let inner = token_endpoint();
        let http = Arc::new(RendezvousEndpoint {
            barrier: tokio::sync::Barrier::new(2),
            inner: inner.clone(),
        });
        let auth = AzureAuth::new(service_principal(), http, Arc::new(RecordingRunner::succeeding()))
            .with_clock(|| 100);

        let (management, storage) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(auth.token(SCOPE_MANAGEMENT, None), auth.token(SCOPE_STORAGE, None))
        })
        .await
        .expect("token fetches for different scopes must not wait on each other");

        assert_eq!(management.unwrap(), "sp-token");
        assert_eq!(storage.unwrap(), "sp-token");
        assert_eq!(inner.recorded().len(), 2);

        // Both slots are cached now
        auth.token(SCOPE_MANAGEMENT, None).await.unwrap();
        auth.token(SCOPE_STORAGE, None).await.unwrap();
        assert_eq!(inner.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_falls_back_to_cli() {
        let http = Arc::new(MockTransport::new(|_| HttpResponse::new(401).with_body("bad secret")));
        let runner = Arc::new(RecordingRunner::with_handler(|_| CommandOutput {
            code: 0,
            stdout: br#"{"accessToken": "cli-token", "expires_on": 2000}"#.to_vec(),
            stderr: vec![],
        }));
        let auth = AzureAuth::new(service_principal(), http, runner.clone()).with_clock(|| 0);

        let token = auth.token(SCOPE_MANAGEMENT, Some("sub-1")).await.unwrap();

        assert_eq!(token, "cli-token");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0].args,
            vec![
                "account",
                "get-access-token",
                "--scope=https://management.azure.com/.default",
                "--subscription=sub-1",
                "--output=json"
            ]
        );
    }

    #[tokio::test]
    async fn test_static_token_skips_network() {
        let http = token_endpoint();
        let auth = AzureAuth::new(
            Credentials::Token("static".to_string()),
            http.clone(),
            Arc::new(RecordingRunner::succeeding()),
        );

        assert_eq!(auth.token(SCOPE_STORAGE, None).await.unwrap(), "static");
        assert!(http.recorded().is_empty());
    }

    #[test]
    fn test_credentials_from_config() {
        let mut config = AzureAuthConfig {
            tenant: Some("tenant-1".to_string()),
            client: Some("client-1".to_string()),
            secret: None,
        };
        assert_eq!(Credentials::from_config(&config, None), Credentials::Cli);

        config.secret = Some("s3cret".to_string());
        assert_eq!(Credentials::from_config(&config, None), service_principal());
        assert!(matches!(
            Credentials::from_config(&config, Some("partner")),
            Credentials::ServicePrincipal { tenant, .. } if tenant == "partner"
        ));
    }
}
