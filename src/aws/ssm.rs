// file: src/aws/ssm.rs
// version: 1.0.0
// guid: 2d6a0c8e-4f1b-4d57-93e6-1a2b3c4d5e6f

//! SSM parameters pointing at published AMIs

use super::client::AwsClient;
use crate::error::CloudImagesError;
use crate::utils::retry::{retry_transient, RetryPolicy};
use crate::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const LATEST: &str = "latest";

/// One parameter to set in one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsmParameter {
    pub region: String,
    pub name: String,
    pub value: String,
    pub overwrite: bool,
}

/// Parameters describing one AMI: the versioned entry and the `latest`
/// alias, which is the only one that may replace an existing value
pub fn image_parameters(
    prefix: &str,
    build_type: &str,
    release: &str,
    version: &str,
    arch: &str,
    region: &str,
    ami: &str,
) -> Vec<SsmParameter> {
    let prefix = prefix.trim_end_matches('/');
    [(version, false), (LATEST, true)]
        .into_iter()
        .map(|(slot, overwrite)| SsmParameter {
            region: region.to_string(),
            name: format!("{}/{}/{}/{}/{}", prefix, build_type, release, slot, arch),
            value: ami.to_string(),
            overwrite,
        })
        .collect()
}

/// Keep one parameter per (region, name); later entries win
pub fn dedup(parameters: Vec<SsmParameter>) -> Vec<SsmParameter> {
    let mut unique: BTreeMap<(String, String), SsmParameter> = BTreeMap::new();
    for parameter in parameters {
        unique.insert((parameter.region.clone(), parameter.name.clone()), parameter);
    }
    unique.into_values().collect()
}

pub struct SsmClient {
    client: Arc<AwsClient>,
    retry: RetryPolicy,
}

impl SsmClient {
    pub fn new(client: Arc<AwsClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set one parameter. An existing non-overwritable value is kept.
    pub async fn put_parameter(&self, parameter: &SsmParameter) -> Result<()> {
        let body = json!({
            "Name": parameter.name,
            "Value": parameter.value,
            "Type": "String",
            "DataType": "aws:ec2:image",
            "Overwrite": parameter.overwrite,
        });
        let what = format!("PutParameter {} in {}", parameter.name, parameter.region);
        let result = retry_transient(self.retry, &what, || {
            self.client
                .json_target("ssm", &parameter.region, "AmazonSSM.PutParameter", &body)
        })
        .await;

        match result {
            Ok(_) => {
                info!("Set {} = {} in {}", parameter.name, parameter.value, parameter.region);
                Ok(())
            }
            Err(CloudImagesError::RemoteError { message, .. })
                if !parameter.overwrite && message.contains("ParameterAlreadyExists") =>
            {
                warn!("{} already exists in {}, keeping it", parameter.name, parameter.region);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Set all parameters after removing duplicates
    pub async fn put_parameters(&self, parameters: Vec<SsmParameter>) -> Result<()> {
        for parameter in dedup(parameters) {
            self.put_parameter(&parameter).await?;
        }
        Ok(())
    }

    /// All parameters below `path` as (name, value)
    pub async fn parameters_by_path(&self, region: &str, path: &str) -> Result<Vec<(String, String)>> {
        let mut parameters = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut body = json!({ "Path": path, "Recursive": true });
            if let Some(token) = &next_token {
                body["NextToken"] = Value::String(token.clone());
            }
            let response = retry_transient(self.retry, "GetParametersByPath", || {
                self.client
                    .json_target("ssm", region, "AmazonSSM.GetParametersByPath", &body)
            })
            .await?;

            if let Some(items) = response.get("Parameters").and_then(Value::as_array) {
                for item in items {
                    let name = item.get("Name").and_then(Value::as_str);
                    let value = item.get("Value").and_then(Value::as_str);
                    if let (Some(name), Some(value)) = (name, value) {
                        parameters.push((name.to_string(), value.to_string()));
                    }
                }
            }

            next_token = response
                .get("NextToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if next_token.is_none() {
                return Ok(parameters);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::client::testing::client;
    use crate::network::http::testing::MockTransport;
    use crate::network::http::HttpResponse;
    use std::time::Duration;

    fn ssm(http: Arc<MockTransport>) -> SsmClient {
        SsmClient::new(client(http)).with_retry(RetryPolicy::new(3, Duration::ZERO))
    }

    #[test]
    fn test_image_parameters() {
        let params = image_parameters(
            "/aws/service/debian/",
            "release",
            "bookworm",
            "20240904-1860",
            "amd64",
            "eu-west-1",
            "ami-1",
        );
        assert_eq!(params[0].name, "/aws/service/debian/release/bookworm/20240904-1860/amd64");
        assert!(!params[0].overwrite);
        assert_eq!(params[1].name, "/aws/service/debian/release/bookworm/latest/amd64");
        assert!(params[1].overwrite);
    }

    #[test]
    fn test_dedup_per_region_and_key() {
        let mut params = image_parameters("/p", "daily", "sid", "1", "amd64", "eu-west-1", "ami-old");
        params.extend(image_parameters("/p", "daily", "sid", "2", "amd64", "eu-west-1", "ami-new"));
        params.extend(image_parameters("/p", "daily", "sid", "2", "amd64", "us-east-1", "ami-us"));

        let unique = dedup(params);

        assert_eq!(unique.len(), 5);
        let latest: Vec<&SsmParameter> = unique.iter().filter(|p| p.name.contains("/latest/")).collect();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].value, "ami-new");
    }

    #[tokio::test]
    async fn test_put_parameter_retries_throttling() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        let http = Arc::new(MockTransport::new(move |_| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                HttpResponse::new(400).with_body(r#"{"__type":"ThrottlingException"}"#)
            } else {
                HttpResponse::new(200).with_body(r#"{"Version":1}"#)
            }
        }));

        let params = image_parameters("/p", "daily", "sid", "1", "amd64", "eu-west-1", "ami-1");
        ssm(http.clone()).put_parameter(&params[1]).await.unwrap();

        let recorded = http.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].header("X-Amz-Target"), Some("AmazonSSM.PutParameter"));
        let body: Value = serde_json::from_slice(&recorded[1].body).unwrap();
        assert_eq!(body["Overwrite"], true);
        assert_eq!(body["Value"], "ami-1");
    }

    #[tokio::test]
    async fn test_existing_dated_parameter_is_kept() {
        let http = Arc::new(MockTransport::new(|_| {
            HttpResponse::new(400)
                .with_body(r#"{"__type":"ParameterAlreadyExists","message":"The parameter already exists."}"#)
        }));
        let params = image_parameters("/p", "daily", "sid", "1", "amd64", "eu-west-1", "ami-1");

        assert!(ssm(http.clone()).put_parameter(&params[0]).await.is_ok());
        assert!(ssm(http).put_parameter(&params[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_parameters_by_path_pages() {
        let http = Arc::new(MockTransport::new(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            if body.get("NextToken").is_none() {
                HttpResponse::new(200).with_json(&json!({
                    "Parameters": [{"Name": "/p/a", "Value": "ami-a"}],
                    "NextToken": "t1"
                }))
            } else {
                HttpResponse::new(200).with_json(&json!({
                    "Parameters": [{"Name": "/p/b", "Value": "ami-b"}]
                }))
            }
        }));

        let params = ssm(http).parameters_by_path("eu-west-1", "/p").await.unwrap();
        assert_eq!(
            params,
            vec![
                ("/p/a".to_string(), "ami-a".to_string()),
                ("/p/b".to_string(), "ami-b".to_string()),
            ]
        );
    }
}
