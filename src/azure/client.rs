// file: src/azure/client.rs
// version: 1.0.0
// guid: 9d6b3f8a-5e2c-4b4a-87f3-f8a9b0c1d2e3

//! Azure Resource Manager REST client

use super::auth::{AzureAuth, SCOPE_MANAGEMENT};
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const MANAGEMENT_BASE: &str = "https://management.azure.com";

/// Waiting behaviour for long running operations
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Wall clock limit for provisioning state polls
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            interval: Duration::from_secs(1),
        }
    }
}

pub struct AzureClient {
    auth: Arc<AzureAuth>,
    http: Arc<dyn HttpTransport>,
    base_url: String,
    poll: PollConfig,
}

impl AzureClient {
    pub fn new(auth: Arc<AzureAuth>, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            auth,
            http,
            base_url: MANAGEMENT_BASE.to_string(),
            poll: PollConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    pub fn http(&self) -> &Arc<dyn HttpTransport> {
        &self.http
    }

    pub fn auth(&self) -> &Arc<AzureAuth> {
        &self.auth
    }

    pub fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.base_url, path, api_version)
    }

    async fn authorized(&self, request: HttpRequest, path: &str) -> Result<HttpRequest> {
        let token = self.auth.token(SCOPE_MANAGEMENT, subscription_of(path)).await?;
        Ok(request.bearer(&token))
    }

    /// Send a management request for `path` and check for success
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        api_version: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(method, self.url(path, api_version));
        if let Some(body) = body {
            request = request.json(body)?;
        }
        let request = self.authorized(request, path).await?;
        self.http
            .send(request)
            .await?
            .error_for_status(&format!("{} {}", method.as_str(), path))
    }

    pub async fn get_json(&self, path: &str, api_version: &str) -> Result<Value> {
        self.request(Method::Get, path, api_version, None).await?.json()
    }

    /// Poll `properties.provisioningState` until it settles
    pub async fn wait_provisioned(&self, path: &str, api_version: &str) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + self.poll.timeout;
        loop {
            let data = self.get_json(path, api_version).await?;
            let state = data
                .pointer("/properties/provisioningState")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_ascii_lowercase();

            match state.as_str() {
                "succeeded" => {
                    info!("Provisioned {}", path);
                    return Ok(data);
                }
                "creating" | "updating" => {
                    debug!("{} is {}, waiting", path, state);
                }
                other => {
                    return Err(CloudImagesError::provisioning(format!(
                        "{} ended in provisioning state '{}'",
                        path, other
                    )))
                }
            }

            if tokio::time::Instant::now() + self.poll.interval > deadline {
                return Err(CloudImagesError::timeout(format!(
                    "{} not provisioned within {:?}",
                    path, self.poll.timeout
                )));
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }

    /// Follow an async operation monitor until it answers 200
    pub async fn poll_monitor(&self, url: &str, path: &str, attempts: u32) -> Result<HttpResponse> {
        for attempt in 1..=attempts {
            let request = self.authorized(HttpRequest::get(url), path).await?;
            let response = self
                .http
                .send(request)
                .await?
                .error_for_status("Operation monitor")?;
            if response.status == 200 {
                return Ok(response);
            }
            debug!("Monitor returned {} (attempt {}/{})", response.status, attempt, attempts);
            if attempt < attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }
        Err(CloudImagesError::timeout(format!(
            "Operation on {} still running after {} polls",
            path, attempts
        )))
    }
}

/// Subscription id of a resource path
pub fn subscription_of(path: &str) -> Option<&str> {
    let mut parts = path.trim_start_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some(segment), Some(id)) if segment.eq_ignore_ascii_case("subscriptions") && !id.is_empty() => {
            Some(id)
        }
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::http::testing::MockTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_of() {
        assert_eq!(subscription_of("/subscriptions/abc/resourceGroups/rg"), Some("abc"));
        assert_eq!(subscription_of("/providers/Microsoft.Compute"), None);
    }

    #[tokio::test]
    async fn test_wait_provisioned_polls_until_succeeded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let http = Arc::new(MockTransport::new(move |_| {
            let state = if counter.fetch_add(1, Ordering::SeqCst) < 2 { "Creating" } else { "Succeeded" };
            HttpResponse::new(200).with_json(&json!({"properties": {"provisioningState": state}}))
        }));
        let client = testing::client(http.clone());

        let data = client.wait_provisioned("/subscriptions/s/x", "2024-03-02").await.unwrap();

        assert_eq!(data["properties"]["provisioningState"], "Succeeded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let request = &http.recorded()[0];
        assert_eq!(request.url, "https://management.test/subscriptions/s/x?api-version=2024-03-02");
        assert_eq!(request.header("Authorization"), Some("Bearer test-token"));
    }

    #[tokio::test]
    async fn test_failed_state_is_provisioning_error() {
        let http = Arc::new(MockTransport::new(|_| {
            HttpResponse::new(200).with_json(&json!({"properties": {"provisioningState": "Failed"}}))
        }));
        let client = testing::client(http);

        let result = client.wait_provisioned("/subscriptions/s/x", "v").await;
        assert!(matches!(result, Err(CloudImagesError::ProvisioningError(_))));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let http = Arc::new(MockTransport::new(|_| {
            HttpResponse::new(200).with_json(&json!({"properties": {"provisioningState": "Updating"}}))
        }));
        let client = Arc::new(
            AzureClient::new(testing::client(http.clone()).auth().clone(), http).with_poll(PollConfig {
                timeout: Duration::from_millis(20),
                interval: Duration::from_millis(5),
            }),
        );

        let result = client.wait_provisioned("/subscriptions/s/x", "v").await;
        assert!(matches!(result, Err(CloudImagesError::TimeoutError(_))));
    }

    #[tokio::test]
    async fn test_monitor_gives_up_after_attempts() {
        let http = Arc::new(MockTransport::new(|_| HttpResponse::new(202)));
        let client = testing::client(http.clone());

        let result = client.poll_monitor("https://monitor.test/op", "/subscriptions/s/d", 3).await;

        assert!(matches!(result, Err(CloudImagesError::TimeoutError(_))));
        assert_eq!(http.recorded().len(), 3);
    }
}
