// file: src/aws/ec2.rs
// version: 1.0.0
// guid: 3c9f1e7a-5d2b-4a86-b0c4-8e9f0a1b2c3d

//! EC2 snapshot and image operations

use super::client::{require_xml, xml_value, xml_values, AwsClient};
use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const EC2_API_VERSION: &str = "2016-11-15";
pub const ROOT_DEVICE: &str = "/dev/xvda";

/// State of an `ImportSnapshot` task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatus {
    pub status: String,
    pub snapshot_id: Option<String>,
    pub message: Option<String>,
}

/// Parameters of `RegisterImage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRegistration {
    pub name: String,
    pub description: String,
    pub arch: Architecture,
    pub snapshot_id: String,
}

impl ImageRegistration {
    fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("Name", self.name.clone()),
            ("Description", self.description.clone()),
            ("Architecture", self.arch.ec2_name().to_string()),
            ("RootDeviceName", ROOT_DEVICE.to_string()),
            ("BlockDeviceMapping.1.DeviceName", ROOT_DEVICE.to_string()),
            ("BlockDeviceMapping.1.Ebs.SnapshotId", self.snapshot_id.clone()),
            ("BlockDeviceMapping.1.Ebs.DeleteOnTermination", "true".to_string()),
            ("VirtualizationType", "hvm".to_string()),
            ("EnaSupport", "true".to_string()),
            ("SriovNetSupport", "simple".to_string()),
        ];
        if self.arch == Architecture::Arm64 {
            params.push(("BootMode", "uefi".to_string()));
        }
        params.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

fn indexed(prefix: &str, values: &[&str]) -> Vec<(String, String)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{}.{}", prefix, i + 1), v.to_string()))
        .collect()
}

pub struct Ec2Client {
    client: Arc<AwsClient>,
    poll_interval: Duration,
}

impl Ec2Client {
    pub fn new(client: Arc<AwsClient>) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(15),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn call(&self, region: &str, action: &str, params: &[(String, String)]) -> Result<String> {
        self.client
            .query("ec2", region, action, EC2_API_VERSION, params)
            .await
    }

    /// Regions enabled for the account
    pub async fn describe_regions(&self, region: &str) -> Result<Vec<String>> {
        let xml = self.call(region, "DescribeRegions", &[]).await?;
        let mut regions = xml_values(&xml, "regionName");
        regions.sort();
        Ok(regions)
    }

    /// Start importing a VMDK object as snapshot, returns the task id
    pub async fn import_snapshot(&self, region: &str, bucket: &str, key: &str, description: &str) -> Result<String> {
        let params: Vec<(String, String)> = [
            ("Description", description),
            ("DiskContainer.Description", description),
            ("DiskContainer.Format", "VMDK"),
            ("DiskContainer.UserBucket.S3Bucket", bucket),
            ("DiskContainer.UserBucket.S3Key", key),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let xml = self.call(region, "ImportSnapshot", &params).await?;
        let task = require_xml(&xml, "importTaskId", "ImportSnapshot")?;
        info!("Importing s3://{}/{} as snapshot ({})", bucket, key, task);
        Ok(task)
    }

    pub async fn describe_import_task(&self, region: &str, task: &str) -> Result<ImportStatus> {
        let params = indexed("ImportTaskId", &[task]);
        let xml = self.call(region, "DescribeImportSnapshotTasks", &params).await?;
        Ok(ImportStatus {
            status: require_xml(&xml, "status", "DescribeImportSnapshotTasks")?,
            snapshot_id: xml_value(&xml, "snapshotId"),
            message: xml_value(&xml, "statusMessage"),
        })
    }

    /// Poll an import task until it completed, returns the snapshot id
    pub async fn wait_import(&self, region: &str, task: &str) -> Result<String> {
        loop {
            let status = self.describe_import_task(region, task).await?;
            match status.status.as_str() {
                "completed" => {
                    return status.snapshot_id.ok_or_else(|| {
                        CloudImagesError::provisioning(format!("Import {} completed without snapshot", task))
                    })
                }
                "deleting" | "deleted" => {
                    return Err(CloudImagesError::provisioning(format!(
                        "Import {} failed: {}",
                        task,
                        status.message.unwrap_or_default()
                    )))
                }
                other => debug!("Import {} is {} {}", task, other, status.message.unwrap_or_default()),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Copy a snapshot into `region`, returns the new snapshot id
    pub async fn copy_snapshot(
        &self,
        region: &str,
        source_region: &str,
        snapshot_id: &str,
        description: &str,
    ) -> Result<String> {
        let params: Vec<(String, String)> = [
            ("SourceRegion", source_region),
            ("SourceSnapshotId", snapshot_id),
            ("Description", description),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let xml = self.call(region, "CopySnapshot", &params).await?;
        let copy = require_xml(&xml, "snapshotId", "CopySnapshot")?;
        info!("Copying {} from {} to {} as {}", snapshot_id, source_region, region, copy);
        Ok(copy)
    }

    pub async fn snapshot_state(&self, region: &str, snapshot_id: &str) -> Result<String> {
        let params = indexed("SnapshotId", &[snapshot_id]);
        let xml = self.call(region, "DescribeSnapshots", &params).await?;
        require_xml(&xml, "status", "DescribeSnapshots")
    }

    /// Poll a snapshot until it completed
    pub async fn wait_snapshot(&self, region: &str, snapshot_id: &str) -> Result<()> {
        loop {
            match self.snapshot_state(region, snapshot_id).await?.as_str() {
                "completed" => return Ok(()),
                "error" => {
                    return Err(CloudImagesError::provisioning(format!(
                        "Snapshot {} in {} failed",
                        snapshot_id, region
                    )))
                }
                state => debug!("Snapshot {} in {} is {}", snapshot_id, region, state),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Register an AMI with a single EBS root volume
    pub async fn register_image(&self, region: &str, image: &ImageRegistration) -> Result<String> {
        let xml = self.call(region, "RegisterImage", &image.params()).await?;
        let ami = require_xml(&xml, "imageId", "RegisterImage")?;
        info!("Registered {} in {} as {}", image.name, region, ami);
        Ok(ami)
    }

    pub async fn create_tags(&self, region: &str, resources: &[&str], tags: &[(&str, &str)]) -> Result<()> {
        let mut params = indexed("ResourceId", resources);
        for (i, (key, value)) in tags.iter().enumerate() {
            params.push((format!("Tag.{}.Key", i + 1), key.to_string()));
            params.push((format!("Tag.{}.Value", i + 1), value.to_string()));
        }
        self.call(region, "CreateTags", &params).await?;
        Ok(())
    }
}
