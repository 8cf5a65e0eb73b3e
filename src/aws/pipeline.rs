// file: src/aws/pipeline.rs
// version: 1.0.0
// guid: 7a3e9c1b-2f4d-4e80-b6a2-3c4d5e6f7a8b

//! EC2 publishing: S3 upload, snapshot import, per-region AMIs, SSM
//! parameters and Marketplace submissions

use super::client::AwsClient;
use super::ec2::{Ec2Client, ImageRegistration};
use super::marketplace::{DeliveryOption, MarketplaceClient};
use super::s3::S3Client;
use super::ssm::{image_parameters, SsmClient};
use crate::api::{wellknown, Upload};
use crate::config::tool::{require, Ec2Config, MarketplaceListing};
use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::image::ImageArchive;
use crate::manifest::bus::provider_labels;
use crate::manifest::{BuildManifest, ManifestBus, StageResult};
use crate::utils::qemu::{ImageConverter, ImageFormat};
use crate::utils::retry::RetryPolicy;
use crate::utils::system::CommandRunner;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const AWS_PROVIDER: &str = "aws.amazon.com";
pub const STAGE_EC2: &str = "upload-ec2";

pub const TAG_AMI: &str = "AMI";
pub const TAG_IMAGE_FAMILY: &str = "ImageFamily";
pub const TAG_IMAGE_VERSION: &str = "ImageVersion";

/// Regions receiving the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSelection {
    /// Only the region of the upload bucket
    BucketOnly,
    /// Every region enabled for the account
    All,
    Explicit(Vec<String>),
}

impl RegionSelection {
    pub fn from_config(regions: &[String]) -> Self {
        match regions {
            [] => RegionSelection::BucketOnly,
            [all] if all == "all" => RegionSelection::All,
            regions => RegionSelection::Explicit(regions.to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceTarget {
    pub role: String,
    pub api_region: String,
    pub listings: BTreeMap<String, MarketplaceListing>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ec2Target {
    pub bucket: String,
    pub regions: RegionSelection,
    pub ssm_prefix: Option<String>,
    pub marketplace: Option<MarketplaceTarget>,
}

impl Ec2Target {
    pub fn from_config(config: &Ec2Config) -> Result<Self> {
        let marketplace = match (&config.marketplace.role, &config.marketplace.api_region) {
            (Some(role), Some(api_region)) if !config.marketplace.listings.is_empty() => Some(MarketplaceTarget {
                role: role.clone(),
                api_region: api_region.clone(),
                listings: config.marketplace.listings.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            bucket: require(config.storage.name.as_deref(), "ec2.storage.name")?.to_string(),
            regions: RegionSelection::from_config(&config.image.regions),
            ssm_prefix: config.ssm.prefix.clone(),
            marketplace,
        })
    }
}

/// Family shared by all versions of an image, used to find old versions
pub fn image_family(release_id: &str, arch: Architecture) -> String {
    format!("debian-{}-{}", release_id, arch.as_str())
}

/// Facts about one build needed in every region
struct ImageFacts {
    name: String,
    description: String,
    family: String,
    version: String,
    arch: Architecture,
}

impl ImageFacts {
    fn from_manifest(manifest: &BuildManifest) -> Result<Self> {
        let build = &manifest.build;
        let arch: Architecture = build.arch()?.parse()?;
        let release_id = build.release_id()?;
        let version = build.version()?;
        Ok(Self {
            name: manifest.name.clone(),
            description: format!("Debian {} ({})", release_id, version),
            family: image_family(release_id, arch),
            version: version.to_string(),
            arch,
        })
    }
}

pub struct Ec2Pipeline {
    ec2: Ec2Client,
    s3: S3Client,
    ssm: SsmClient,
    marketplace: Option<MarketplaceClient>,
    converter: ImageConverter,
    target: Ec2Target,
}

impl Ec2Pipeline {
    pub fn new(client: Arc<AwsClient>, runner: Arc<dyn CommandRunner>, target: Ec2Target) -> Self {
        let marketplace = target
            .marketplace
            .as_ref()
            .map(|m| MarketplaceClient::new(client.clone(), m.api_region.clone()));
        Self {
            ec2: Ec2Client::new(client.clone()),
            s3: S3Client::new(client.clone()),
            ssm: SsmClient::new(client),
            marketplace,
            converter: ImageConverter::new(runner),
            target,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.ec2 = self.ec2.with_poll_interval(interval);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.ssm = self.ssm.with_retry(retry);
        self
    }

    async fn target_regions(&self, bucket_region: &str) -> Result<Vec<String>> {
        Ok(match &self.target.regions {
            RegionSelection::BucketOnly => vec![bucket_region.to_string()],
            RegionSelection::All => self.ec2.describe_regions(bucket_region).await?,
            RegionSelection::Explicit(regions) => regions.clone(),
        })
    }

    /// Upload the disk and import it as snapshot in the bucket region
    async fn import(&self, manifest: &BuildManifest, facts: &ImageFacts) -> Result<(String, String)> {
        let raw = ImageArchive::open(manifest.artifact_path()?)?.extract_disk_temp()?;
        let vmdk = self.converter.open_converted(raw.path(), ImageFormat::Vmdk).await?;

        let bucket = &self.target.bucket;
        let region = self.s3.bucket_region(bucket).await?;
        let key = format!("{}.vmdk", facts.name);
        self.s3.put_object(&region, bucket, &key, vmdk.path()).await?;

        let task = self
            .ec2
            .import_snapshot(&region, bucket, &key, &facts.description)
            .await?;
        let snapshot = self.ec2.wait_import(&region, &task).await?;
        info!("Imported {} as {} in {}", facts.name, snapshot, region);

        if let Err(e) = self.s3.delete_object(&region, bucket, &key).await {
            warn!("Failed to delete s3://{}/{}: {}", bucket, key, e);
        }
        Ok((region, snapshot))
    }

    async fn publish_region(
        &self,
        manifest: &BuildManifest,
        facts: &ImageFacts,
        region: &str,
        base_region: &str,
        base_snapshot: &str,
    ) -> Result<Upload> {
        let snapshot = if region == base_region {
            base_snapshot.to_string()
        } else {
            let copy = self
                .ec2
                .copy_snapshot(region, base_region, base_snapshot, &facts.description)
                .await?;
            self.ec2.wait_snapshot(region, &copy).await?;
            copy
        };

        let ami = self
            .ec2
            .register_image(
                region,
                &ImageRegistration {
                    name: facts.name.clone(),
                    description: facts.description.clone(),
                    arch: facts.arch,
                    snapshot_id: snapshot.clone(),
                },
            )
            .await?;
        self.ec2
            .create_tags(
                region,
                &[ami.as_str(), snapshot.as_str()],
                &[
                    (TAG_AMI, facts.name.as_str()),
                    (TAG_IMAGE_FAMILY, facts.family.as_str()),
                    (TAG_IMAGE_VERSION, facts.version.as_str()),
                ],
            )
            .await?;

        let build_type = manifest.build.info_opt("type").unwrap_or("dev");
        let [provider, upload_type] = provider_labels(AWS_PROVIDER, build_type);
        Ok(manifest.derive_upload(
            AWS_PROVIDER,
            &ami,
            Some(facts.family.clone()),
            &[provider, upload_type, (wellknown::LABEL_AWS_REGION, region)],
        ))
    }

    async fn publish_parameters(&self, manifest: &BuildManifest, uploads: &[Upload]) -> Result<()> {
        let Some(prefix) = &self.target.ssm_prefix else {
            return Ok(());
        };
        let build = &manifest.build;
        let build_type = build.info("type")?;
        let mut parameters = Vec::new();
        for upload in uploads {
            let region = upload.metadata.label(wellknown::LABEL_AWS_REGION).unwrap_or_default();
            parameters.extend(image_parameters(
                prefix,
                build_type,
                build.release()?,
                build.version()?,
                build.arch()?,
                region,
                upload.reference(),
            ));
        }
        self.ssm.put_parameters(parameters).await
    }

    async fn submit_marketplace(&self, manifest: &BuildManifest, facts: &ImageFacts, uploads: &[Upload]) -> Result<()> {
        let (Some(client), Some(target)) = (&self.marketplace, &self.target.marketplace) else {
            return Ok(());
        };
        let build = &manifest.build;
        if build.info_opt("type") != Some("release") {
            return Ok(());
        }
        let Some(listing) = target.listings.get(build.release()?) else {
            return Ok(());
        };
        let Some(entity) = listing.entities.get(facts.arch.as_str()) else {
            return Ok(());
        };
        let ami = uploads
            .iter()
            .find(|u| u.metadata.label(wellknown::LABEL_AWS_REGION) == Some(client.region()))
            .ok_or_else(|| {
                CloudImagesError::precondition(format!(
                    "No AMI in {} for the Marketplace listing {}",
                    client.region(),
                    entity.id
                ))
            })?;

        client
            .add_delivery_option(&DeliveryOption {
                entity: entity.clone(),
                ami_id: ami.reference().to_string(),
                access_role: target.role.clone(),
                version_title: format!("{}-{}", build.release_id()?, facts.version),
                release_notes: listing.releasenotes.clone().unwrap_or_default(),
                os_version: build.release_id()?.to_string(),
            })
            .await
            .map(|_| ())
    }

    /// Publish one build. Regions are independent: the result carries
    /// every AMI that was registered and the first failure.
    pub async fn upload(&self, manifest: &BuildManifest) -> StageResult {
        let facts = match ImageFacts::from_manifest(manifest) {
            Ok(facts) => facts,
            Err(e) => return StageResult::failed(e),
        };
        let (base_region, base_snapshot) = match self.import(manifest, &facts).await {
            Ok(imported) => imported,
            Err(e) => return StageResult::failed(e),
        };
        let regions = match self.target_regions(&base_region).await {
            Ok(regions) => regions,
            Err(e) => return StageResult::failed(e),
        };

        let mut result = StageResult::default();
        for region in &regions {
            match self
                .publish_region(manifest, &facts, region, &base_region, &base_snapshot)
                .await
            {
                Ok(upload) => result.uploads.push(upload),
                Err(e) => {
                    error!("Publishing {} in {} failed: {}", facts.name, region, e);
                    result.error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.publish_parameters(manifest, &result.uploads).await {
            error!("Setting SSM parameters for {} failed: {}", facts.name, e);
            result.error.get_or_insert(e);
        }
        if let Err(e) = self.submit_marketplace(manifest, &facts, &result.uploads).await {
            error!("Marketplace submission for {} failed: {}", facts.name, e);
            result.error.get_or_insert(e);
        }
        result
    }

    pub async fn run(&self, bus: &ManifestBus) -> Result<Vec<Upload>> {
        bus.run_stage(STAGE_EC2, |manifest| async move { self.upload(&manifest).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::client::testing::{action, client, form_field};
    use crate::config::tool::MarketplaceEntity;
    use crate::manifest::bus::testing::{build, write_artifact};
    use crate::network::http::testing::{MockTransport, RecordedRequest};
    use crate::network::http::HttpResponse;
    use crate::utils::qemu::testing::copying_runner;
    use std::path::Path;
    use tempfile::TempDir;

    /// Region from the credential scope of a signed request
    fn region_of(request: &RecordedRequest) -> String {
        let auth = request.header("Authorization").unwrap();
        auth.split('/').nth(2).unwrap().to_string()
    }

    fn aws(request: &RecordedRequest, fail_register_in: Option<&str>) -> HttpResponse {
        let region = region_of(request);
        let xml = |body: String| HttpResponse::new(200).with_body(body);
        match action(request).as_str() {
            "HEAD /images/" => HttpResponse::new(200).with_header("x-amz-bucket-region", "eu-west-1"),
            "ImportSnapshot" => xml("<r><importTaskId>import-snap-1</importTaskId></r>".into()),
            "DescribeImportSnapshotTasks" => {
                xml("<r><status>completed</status><snapshotId>snap-base</snapshotId></r>".into())
            }
            "CopySnapshot" => xml(format!("<r><snapshotId>snap-{}</snapshotId></r>", region)),
            "DescribeSnapshots" => xml("<r><status>completed</status></r>".into()),
            "RegisterImage" if fail_register_in == Some(region.as_str()) => HttpResponse::new(400).with_body(
                "<Response><Errors><Error><Code>InvalidAMIName.Duplicate</Code></Error></Errors></Response>",
            ),
            "RegisterImage" => xml(format!("<r><imageId>ami-{}</imageId></r>", region)),
            "DescribeRegions" => xml(
                "<r><item><regionName>us-east-1</regionName></item><item><regionName>eu-west-1</regionName></item></r>"
                    .into(),
            ),
            "AmazonSSM.PutParameter" => HttpResponse::new(200).with_body("{\"Version\":1}"),
            "POST /StartChangeSet" => HttpResponse::new(200).with_body("{\"ChangeSetId\":\"cs-1\"}"),
            _ => HttpResponse::new(200),
        }
    }

    fn target(regions: &[&str]) -> Ec2Target {
        Ec2Target {
            bucket: "images".to_string(),
            regions: RegionSelection::from_config(&regions.iter().map(|r| r.to_string()).collect::<Vec<_>>()),
            ssm_prefix: Some("/aws/service/debian".to_string()),
            marketplace: None,
        }
    }

    fn pipeline(http: Arc<MockTransport>, target: Ec2Target) -> Ec2Pipeline {
        Ec2Pipeline::new(client(http), Arc::new(copying_runner()), target)
            .with_poll_interval(Duration::from_millis(1))
            .with_retry(RetryPolicy::new(1, Duration::ZERO))
    }

    fn manifest(dir: &Path, build_type: &str) -> BuildManifest {
        write_artifact(
            dir,
            "debian-12-ec2-amd64-20240904-1860",
            &build("ec2", "amd64", "20240904-1860", build_type),
            b"disk",
        )
    }

    #[tokio::test]
    async fn test_publishes_every_region() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest(dir.path(), "daily");
        let http = Arc::new(MockTransport::new(|r| aws(r, None)));

        let result = pipeline(http.clone(), target(&["eu-west-1", "us-east-1"]))
            .upload(&manifest)
            .await;

        assert!(result.error.is_none(), "{:?}", result.error);
        let amis: Vec<&str> = result.uploads.iter().map(Upload::reference).collect();
        assert_eq!(amis, vec!["ami-eu-west-1", "ami-us-east-1"]);
        assert_eq!(
            result.uploads[1].metadata.label(wellknown::LABEL_AWS_REGION),
            Some("us-east-1")
        );
        assert_eq!(result.uploads[0].data.family_ref.as_deref(), Some("debian-12-amd64"));

        let recorded = http.recorded();
        let actions: Vec<String> = recorded.iter().map(action).collect();
        let import = actions.iter().position(|a| a == "ImportSnapshot").unwrap();
        let upload = actions.iter().position(|a| a.starts_with("PUT /images/")).unwrap();
        assert!(upload < import);

        // Only the second region needs a copy
        let copies: Vec<&RecordedRequest> = recorded.iter().filter(|r| action(r) == "CopySnapshot").collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(region_of(copies[0]), "us-east-1");
        assert_eq!(form_field(copies[0], "SourceRegion").as_deref(), Some("eu-west-1"));

        let registers: Vec<&RecordedRequest> = recorded.iter().filter(|r| action(r) == "RegisterImage").collect();
        assert_eq!(
            form_field(registers[0], "BlockDeviceMapping.1.Ebs.SnapshotId").as_deref(),
            Some("snap-base")
        );
        assert_eq!(
            form_field(registers[1], "BlockDeviceMapping.1.Ebs.SnapshotId").as_deref(),
            Some("snap-us-east-1")
        );

        let tags = recorded.iter().find(|r| action(r) == "CreateTags").unwrap();
        assert_eq!(form_field(tags, "Tag.2.Value").as_deref(), Some("debian-12-amd64"));

        let params: Vec<serde_json::Value> = recorded
            .iter()
            .filter(|r| action(r) == "AmazonSSM.PutParameter")
            .map(RecordedRequest::json)
            .collect();
        assert_eq!(params.len(), 4);
        assert!(params.iter().any(|p| p["Name"]
            == "/aws/service/debian/daily/bookworm/latest/amd64"
            && p["Overwrite"] == true));
    }

    #[tokio::test]
    async fn test_region_failure_keeps_other_regions() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest(dir.path(), "daily");
        let http = Arc::new(MockTransport::new(|r| aws(r, Some("us-east-1"))));

        let result = pipeline(http.clone(), target(&["eu-west-1", "us-east-1"]))
            .upload(&manifest)
            .await;

        assert_eq!(result.uploads.len(), 1);
        assert_eq!(result.uploads[0].reference(), "ami-eu-west-1");
        assert!(result.error.unwrap().to_string().contains("InvalidAMIName.Duplicate"));

        let params = http
            .recorded()
            .iter()
            .filter(|r| action(r) == "AmazonSSM.PutParameter")
            .count();
        assert_eq!(params, 2);
    }

    #[tokio::test]
    async fn test_all_regions_and_marketplace() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest(dir.path(), "release");
        let http = Arc::new(MockTransport::new(|r| aws(r, None)));

        let mut target = target(&["all"]);
        let mut listing = MarketplaceListing::default();
        listing.entities.insert(
            "amd64".to_string(),
            MarketplaceEntity {
                id: "prod-abc".to_string(),
                instancetype: "t3.micro".to_string(),
            },
        );
        target.marketplace = Some(MarketplaceTarget {
            role: "arn:aws:iam::1:role/mp".to_string(),
            api_region: "us-east-1".to_string(),
            listings: [("bookworm".to_string(), listing)].into_iter().collect(),
        });

        let result = pipeline(http.clone(), target).upload(&manifest).await;

        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.uploads.len(), 2);
        let change = http
            .recorded()
            .into_iter()
            .find(|r| action(r) == "POST /StartChangeSet")
            .unwrap()
            .json();
        assert_eq!(
            change["ChangeSet"][0]["DetailsDocument"]["DeliveryOptions"][0]["Details"]["AmiDeliveryOptionDetails"]
                ["AmiSource"]["AmiId"],
            "ami-us-east-1"
        );
    }

    #[tokio::test]
    async fn test_run_writes_stage_manifest() {
        let dir = TempDir::new().unwrap();
        manifest(dir.path(), "daily");
        let http = Arc::new(MockTransport::new(|r| aws(r, None)));
        let bus = ManifestBus::new(dir.path());

        let uploads = pipeline(http, target(&[])).run(&bus).await.unwrap();

        assert_eq!(uploads.len(), 1);
        let stage = bus.read_stage("debian-12-ec2-amd64-20240904-1860", STAGE_EC2).unwrap();
        assert_eq!(stage[0].reference(), "ami-eu-west-1");
    }

    #[test]
    fn test_region_selection() {
        assert_eq!(RegionSelection::from_config(&[]), RegionSelection::BucketOnly);
        assert_eq!(RegionSelection::from_config(&["all".to_string()]), RegionSelection::All);
        assert_eq!(
            RegionSelection::from_config(&["eu-west-1".to_string()]),
            RegionSelection::Explicit(vec!["eu-west-1".to_string()])
        );
    }

    #[test]
    fn test_target_requires_bucket() {
        let err = Ec2Target::from_config(&Ec2Config::default()).unwrap_err();
        assert!(err.to_string().contains("ec2.storage.name"));
    }
}
