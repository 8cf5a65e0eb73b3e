// file: src/aws/marketplace.rs
// version: 1.0.0
// guid: 5f1c7e3a-9b2d-4b68-8a0f-2b3c4d5e6f70

//! AWS Marketplace catalog updates

use super::client::AwsClient;
use crate::config::tool::MarketplaceEntity;
use crate::error::CloudImagesError;
use crate::network::http::HttpRequest;
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub const CATALOG: &str = "AWSMarketplace";
pub const ENTITY_TYPE: &str = "AmiProduct@1.0";

/// A new AMI version for a Marketplace product
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOption {
    pub entity: MarketplaceEntity,
    pub ami_id: String,
    pub access_role: String,
    pub version_title: String,
    pub release_notes: String,
    pub os_version: String,
}

impl DeliveryOption {
    pub fn change_set(&self) -> Value {
        json!({
            "Catalog": CATALOG,
            "ChangeSet": [{
                "ChangeType": "AddDeliveryOptions",
                "Entity": {
                    "Identifier": self.entity.id,
                    "Type": ENTITY_TYPE,
                },
                "DetailsDocument": {
                    "Version": {
                        "VersionTitle": self.version_title,
                        "ReleaseNotes": self.release_notes,
                    },
                    "DeliveryOptions": [{
                        "Details": {
                            "AmiDeliveryOptionDetails": {
                                "AmiSource": {
                                    "AmiId": self.ami_id,
                                    "AccessRoleArn": self.access_role,
                                    "UserName": "admin",
                                    "OperatingSystemName": "DEBIAN",
                                    "OperatingSystemVersion": self.os_version,
                                },
                                "UsageInstructions": "Log in as user 'admin' with the SSH key selected at launch.",
                                "RecommendedInstanceType": self.entity.instancetype,
                                "SecurityGroups": [{
                                    "IpProtocol": "tcp",
                                    "FromPort": 22,
                                    "ToPort": 22,
                                    "IpRanges": ["0.0.0.0/0"],
                                }],
                            }
                        }
                    }],
                },
            }],
        })
    }
}

pub struct MarketplaceClient {
    client: Arc<AwsClient>,
    region: String,
}

impl MarketplaceClient {
    pub fn new(client: Arc<AwsClient>, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Submit the change set, returns its id
    pub async fn add_delivery_option(&self, option: &DeliveryOption) -> Result<String> {
        let url = format!(
            "{}/StartChangeSet",
            self.client.endpoint("catalog.marketplace", &self.region)
        );
        let request = HttpRequest::post(url).json(&option.change_set())?;
        let response: Value = self
            .client
            .send(request, "aws-marketplace", &self.region)
            .await?
            .json()?;

        let id = response
            .get("ChangeSetId")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudImagesError::RemoteError {
                status: 200,
                message: "StartChangeSet response lacks ChangeSetId".to_string(),
            })?;
        info!("Submitted {} for {} as change set {}", option.ami_id, option.entity.id, id);
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::client::testing::client;
    use crate::network::http::testing::MockTransport;
    use crate::network::http::HttpResponse;

    fn option() -> DeliveryOption {
        DeliveryOption {
            entity: MarketplaceEntity {
                id: "prod-abc".to_string(),
                instancetype: "t3.micro".to_string(),
            },
            ami_id: "ami-1".to_string(),
            access_role: "arn:aws:iam::123:role/mp".to_string(),
            version_title: "12.7-20240904-1860".to_string(),
            release_notes: "https://www.debian.org/News/".to_string(),
            os_version: "12".to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_change_set() {
        let http = Arc::new(MockTransport::new(|_| {
            HttpResponse::new(200).with_json(&json!({"ChangeSetId": "cs-1", "ChangeSetArn": "arn"}))
        }));
        let id = MarketplaceClient::new(client(http.clone()), "us-east-1")
            .add_delivery_option(&option())
            .await
            .unwrap();

        assert_eq!(id, "cs-1");
        let request = &http.recorded()[0];
        assert_eq!(request.route(), "POST /StartChangeSet");
        let body = request.json();
        let change = &body["ChangeSet"][0];
        assert_eq!(change["ChangeType"], "AddDeliveryOptions");
        assert_eq!(change["Entity"]["Identifier"], "prod-abc");
        let details = &change["DetailsDocument"]["DeliveryOptions"][0]["Details"]["AmiDeliveryOptionDetails"];
        assert_eq!(details["AmiSource"]["AmiId"], "ami-1");
        assert_eq!(details["RecommendedInstanceType"], "t3.micro");
        assert!(request
            .header("Authorization")
            .unwrap()
            .contains("/us-east-1/aws-marketplace/aws4_request"));
    }
}
