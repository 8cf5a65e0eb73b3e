// file: src/aws/client.rs
// version: 1.0.0
// guid: 6e2b8d4f-1a3c-4f75-9b0d-7c8e9f0a1b2c

//! Signed requests against AWS service endpoints

use super::sigv4::{AwsCredentials, Signer};
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::Result;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Error codes AWS uses for rate limiting
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "SlowDown",
];

pub struct AwsClient {
    credentials: AwsCredentials,
    http: Arc<dyn HttpTransport>,
    endpoint_override: Option<String>,
}

impl AwsClient {
    pub fn new(credentials: AwsCredentials, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            credentials,
            http,
            endpoint_override: None,
        }
    }

    /// Send every request to `base` instead of the regional endpoints
    pub fn with_endpoint_override(mut self, base: impl Into<String>) -> Self {
        self.endpoint_override = Some(base.into());
        self
    }

    /// Regional endpoint for `host_prefix` (e.g. `ec2`, `ssm`)
    pub fn endpoint(&self, host_prefix: &str, region: &str) -> String {
        match &self.endpoint_override {
            Some(base) => base.clone(),
            None => format!("https://{}.{}.amazonaws.com", host_prefix, region),
        }
    }

    /// Object URL; virtual-hosted unless an override is set
    pub fn s3_url(&self, bucket: &str, region: Option<&str>, key: &str) -> String {
        match (&self.endpoint_override, region) {
            (Some(base), _) => format!("{}/{}/{}", base, bucket, key),
            (None, Some(region)) => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, key),
            (None, None) => format!("https://{}.s3.amazonaws.com/{}", bucket, key),
        }
    }

    /// Sign and send without interpreting the status
    pub async fn send_raw(&self, request: HttpRequest, service: &str, region: &str) -> Result<HttpResponse> {
        let signer = Signer {
            credentials: &self.credentials,
            service,
            region,
        };
        let request = signer.sign(request, Utc::now())?;
        self.http.send(request).await
    }

    /// Sign, send and turn error responses into errors
    pub async fn send(&self, request: HttpRequest, service: &str, region: &str) -> Result<HttpResponse> {
        let context = format!("{} {} ({})", request.method.as_str(), service, region);
        let response = self.send_raw(request, service, region).await?;
        check_response(response, &context)
    }

    /// EC2 style query API call, returns the XML response
    pub async fn query(
        &self,
        service: &str,
        region: &str,
        action: &str,
        version: &str,
        params: &[(String, String)],
    ) -> Result<String> {
        let mut fields: Vec<(&str, &str)> = vec![("Action", action), ("Version", version)];
        fields.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let request = HttpRequest::post(format!("{}/", self.endpoint(service, region))).form(&fields);

        debug!("{} {} in {}", service, action, region);
        let response = self.send(request, service, region).await?;
        Ok(response.text())
    }

    /// JSON 1.1 protocol call with an `X-Amz-Target` header
    pub async fn json_target(
        &self,
        service: &str,
        region: &str,
        target: &str,
        body: &Value,
    ) -> Result<Value> {
        let request = HttpRequest::post(format!("{}/", self.endpoint(service, region)))
            .bytes(serde_json::to_vec(body)?)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", target);

        debug!("{} {} in {}", service, target, region);
        self.send(request, service, region).await?.json()
    }
}

/// Error code from an XML or JSON error body
pub fn error_code(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let code = value
            .get("__type")
            .or_else(|| value.get("code"))
            .or_else(|| value.get("Code"))
            .and_then(Value::as_str)?;
        // `com.amazonaws.ssm#ParameterAlreadyExists`
        return Some(code.rsplit('#').next().unwrap_or(code).to_string());
    }
    xml_value(body, "Code")
}

fn check_response(response: HttpResponse, context: &str) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let body = response.text();
    match error_code(&body) {
        Some(code) if THROTTLING_CODES.contains(&code.as_str()) => Err(CloudImagesError::transient(
            format!("{}: throttled ({})", context, code),
        )),
        Some(code) => {
            let detail = xml_value(&body, "Message").unwrap_or_else(|| body.trim().to_string());
            Err(CloudImagesError::from_status(
                response.status,
                format!("{}: {}: {}", context, code, detail),
            ))
        }
        None => Err(CloudImagesError::from_status(
            response.status,
            format!("{}: {}", context, body.trim()),
        )),
    }
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text content of every `<tag>` element
pub fn xml_values(xml: &str, tag: &str) -> Vec<String> {
    let pattern = format!(r"<{0}>([^<]*)</{0}>", regex::escape(tag));
    match Regex::new(&pattern) {
        Ok(re) => re.captures_iter(xml).map(|c| unescape(&c[1])).collect(),
        Err(_) => Vec::new(),
    }
}

/// Text content of the first `<tag>` element
pub fn xml_value(xml: &str, tag: &str) -> Option<String> {
    xml_values(xml, tag).into_iter().next()
}

/// Required text content of the first `<tag>` element
pub fn require_xml(xml: &str, tag: &str, context: &str) -> Result<String> {
    xml_value(xml, tag).ok_or_else(|| CloudImagesError::RemoteError {
        status: 200,
        message: format!("{}: response lacks <{}>", context, tag),
    })
}
