// file: src/azure/storage.rs
// version: 1.0.0
// guid: c09e6c1d-8b5f-4e7d-b0c6-c1d2e3f4a5b6

//! Page blob uploads into classic storage accounts
//!
//! Used for partner offers, which consume VHDs from a storage container
//! through a SAS URL instead of managed disks.

use super::auth::{AzureAuth, SCOPE_STORAGE};
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::utils::crypto::{base64_decode, base64_encode, hmac_sha256};
use crate::utils::progress::byte_progress;
use crate::utils::retry::{retry_transient, RetryPolicy};
use crate::utils::sparse::{SparseChunks, CHUNK_SIZE};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Storage REST version for OAuth bearer access
pub const STORAGE_API_VERSION: &str = "2017-11-09";
/// Service version baked into synthesized SAS tokens
pub const SAS_VERSION: &str = "2018-03-28";

const LEASE_DURATION_SECS: u32 = 60;

/// Blob service of one storage account
pub struct BlobService {
    account: String,
    endpoint: String,
    auth: Arc<AzureAuth>,
    http: Arc<dyn HttpTransport>,
    page_retry: RetryPolicy,
    progress: bool,
}

impl BlobService {
    pub fn new(account: &str, auth: Arc<AzureAuth>, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            account: account.to_string(),
            endpoint: format!("https://{}.blob.core.windows.net", account),
            auth,
            http,
            page_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            progress: false,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_page_retry(mut self, policy: RetryPolicy) -> Self {
        self.page_retry = policy;
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("{}/{}/{}", self.endpoint, container, blob)
    }

    async fn send(&self, request: HttpRequest, context: &str) -> Result<HttpResponse> {
        let token = self.auth.token(SCOPE_STORAGE, None).await?;
        let request = request
            .bearer(&token)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        self.http.send(request).await?.error_for_status(context)
    }

    /// Create the container unless it exists
    pub async fn create_container(&self, container: &str) -> Result<()> {
        let url = format!("{}/{}?restype=container", self.endpoint, container);
        match self.send(HttpRequest::put(url), "Create container").await {
            Ok(_) => info!("Created container {}", container),
            Err(CloudImagesError::RemoteError { status: 409, .. }) => {
                debug!("Container {} exists", container)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Upload `image` as page blob `container/blob` under a lease
    pub async fn upload_page_blob(&self, container: &str, blob: &str, image: &Path) -> Result<u64> {
        let url = self.blob_url(container, blob);
        let size = std::fs::metadata(image)?.len();
        if size % 512 != 0 {
            return Err(CloudImagesError::validation(format!(
                "Page blob size {} of {} is not a multiple of 512",
                size,
                image.display()
            )));
        }

        self.send(
            HttpRequest::put(&url)
                .header("x-ms-blob-type", "PageBlob")
                .header("x-ms-blob-content-length", size.to_string())
                .header("Content-Length", "0"),
            "Create page blob",
        )
        .await?;

        let lease = self.lease(&url, "acquire", None).await?;
        let result = self.write_pages(&url, &lease, image, size).await;
        if let Err(e) = self.lease(&url, "release", Some(&lease)).await {
            warn!("Failed to release lease on {}: {}", url, e);
        }
        let written = result?;
        info!("Uploaded {} as {}", image.display(), url);
        Ok(written)
    }

    async fn write_pages(&self, url: &str, lease: &str, image: &Path, size: u64) -> Result<u64> {
        let file = File::open(image)?;
        let data: Vec<_> = SparseChunks::new(&file, CHUNK_SIZE)?.data().collect::<Result<_>>()?;
        let progress = byte_progress(size, self.progress);
        let page_url = format!("{}?comp=page", url);
        let mut written = 0u64;

        for (i, chunk) in data.iter().enumerate() {
            if i > 0 {
                self.lease(url, "renew", Some(lease)).await?;
            }
            retry_transient(self.page_retry, "Page upload", || {
                self.send(
                    HttpRequest::put(&page_url)
                        .header("Content-Length", chunk.size.to_string())
                        .header("Range", format!("bytes={}-{}", chunk.offset, chunk.end_inclusive()))
                        .header("x-ms-page-write", "update")
                        .header("x-ms-lease-id", lease)
                        .file(image, chunk.offset, chunk.size),
                    "Page upload",
                )
            })
            .await?
            .expect_status(201, "Page upload")?;
            written += chunk.size;
            progress.set_position(chunk.offset + chunk.size);
        }
        progress.finish_and_clear();
        Ok(written)
    }

    async fn lease(&self, url: &str, action: &str, lease: Option<&str>) -> Result<String> {
        let mut request = HttpRequest::put(format!("{}?comp=lease", url))
            .header("x-ms-lease-action", action)
            .header("Content-Length", "0");
        if action == "acquire" {
            request = request.header("x-ms-lease-duration", LEASE_DURATION_SECS.to_string());
        }
        if let Some(lease) = lease {
            request = request.header("x-ms-lease-id", lease);
        }
        let response = self.send(request, &format!("Lease {}", action)).await?;
        match (response.header("x-ms-lease-id"), lease) {
            (Some(id), _) => Ok(id.to_string()),
            (None, Some(id)) => Ok(id.to_string()),
            (None, None) => Err(CloudImagesError::validation("Lease response lacks x-ms-lease-id")),
        }
    }
}

/// Signed container SAS built locally from an account key
#[derive(Debug, Clone)]
pub struct ContainerSas {
    pub account: String,
    pub container: String,
    pub permission: String,
    pub start: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl ContainerSas {
    fn timestamp(time: &DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Canonical string signed with the account key
    pub fn string_to_sign(&self) -> String {
        [
            self.permission.as_str(),
            &Self::timestamp(&self.start),
            &Self::timestamp(&self.expiry),
            &format!("/blob/{}/{}", self.account, self.container),
            "",
            "",
            "",
            SAS_VERSION,
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n")
    }

    /// SAS query string signed with the base64 account key
    pub fn query(&self, account_key: &str) -> Result<String> {
        let key = base64_decode(account_key)?;
        let signature = base64_encode(&hmac_sha256(&key, self.string_to_sign().as_bytes()));
        Ok(url::form_urlencoded::Serializer::new(String::new())
            .append_pair("sv", SAS_VERSION)
            .append_pair("sr", "c")
            .append_pair("sp", &self.permission)
            .append_pair("st", &Self::timestamp(&self.start))
            .append_pair("se", &Self::timestamp(&self.expiry))
            .append_pair("sig", &signature)
            .finish())
    }

    /// Full URL of a blob in the container, with the SAS attached
    pub fn blob_url(&self, endpoint: &str, blob: &str, account_key: &str) -> Result<String> {
        Ok(format!(
            "{}/{}/{}?{}",
            endpoint,
            self.container,
            blob,
            self.query(account_key)?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::auth::Credentials;
    use crate::network::http::testing::{MockTransport, RecordedRequest};
    use crate::utils::system::testing::RecordingRunner;
    use chrono::TimeZone;
    use std::os::unix::fs::FileExt;

    fn service(http: Arc<MockTransport>) -> BlobService {
        let auth = AzureAuth::new(
            Credentials::Token("storage-token".to_string()),
            http.clone(),
            Arc::new(RecordingRunner::succeeding()),
        );
        BlobService::new("debianimages", Arc::new(auth), http).with_endpoint("https://blob.test")
    }

    fn blob_endpoint() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|request: &RecordedRequest| {
            if request.url.ends_with("comp=lease") {
                HttpResponse::new(if request.header("x-ms-lease-action") == Some("acquire") { 201 } else { 200 })
                    .with_header("x-ms-lease-id", "lease-1")
            } else {
                HttpResponse::new(201)
            }
        }))
    }

    #[tokio::test]
    async fn test_page_blob_upload_holds_lease() {
        let image = tempfile::NamedTempFile::new().unwrap();
        image.as_file().set_len(10 * 1024 * 1024).unwrap();
        image.as_file().write_all_at(&[1u8; 4096], 0).unwrap();
        image.as_file().write_all_at(&[2u8; 4096], 6 * 1024 * 1024).unwrap();
        let http = blob_endpoint();

        service(http.clone())
            .upload_page_blob("vhds", "debian-12.vhd", image.path())
            .await
            .unwrap();

        let requests = http.recorded();
        let create = &requests[0];
        assert_eq!(create.url, "https://blob.test/vhds/debian-12.vhd");
        assert_eq!(create.header("x-ms-blob-type"), Some("PageBlob"));
        assert_eq!(create.header("x-ms-blob-content-length"), Some("10485760"));
        assert_eq!(create.header("x-ms-version"), Some("2017-11-09"));
        assert_eq!(create.header("Authorization"), Some("Bearer storage-token"));
        assert_eq!(requests[1].header("x-ms-lease-action"), Some("acquire"));

        let pages: Vec<_> = requests.iter().filter(|r| r.url.ends_with("comp=page")).collect();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.header("x-ms-lease-id") == Some("lease-1")));
        let actions: Vec<_> = requests.iter().filter_map(|r| r.header("x-ms-lease-action")).collect();
        assert_eq!(actions, vec!["acquire", "renew", "release"]);
    }

    #[tokio::test]
    async fn test_unaligned_image_rejected() {
        let image = tempfile::NamedTempFile::new().unwrap();
        image.as_file().set_len(1000).unwrap();
        let http = blob_endpoint();

        let result = service(http.clone()).upload_page_blob("vhds", "x.vhd", image.path()).await;

        assert!(matches!(result, Err(CloudImagesError::ValidationError(_))));
        assert!(http.recorded().is_empty());
    }

    #[test]
    fn test_sas_signing_string_order() {
        let sas = ContainerSas {
            account: "debianimages".to_string(),
            container: "vhds".to_string(),
            permission: "rl".to_string(),
            start: Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap(),
            expiry: Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap(),
        };

        assert_eq!(
            sas.string_to_sign(),
            "rl\n2024-09-01T00:00:00Z\n2024-12-01T00:00:00Z\n/blob/debianimages/vhds\n\n\n\n2018-03-28\n\n\n\n\n"
        );

        let key = base64_encode(b"account-key");
        let query = sas.query(&key).unwrap();
        let expected_sig = base64_encode(&hmac_sha256(b"account-key", sas.string_to_sign().as_bytes()));
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        assert!(pairs.contains(&("sv".to_string(), "2018-03-28".to_string())));
        assert!(pairs.contains(&("sig".to_string(), expected_sig)));
        assert!(sas
            .blob_url("https://debianimages.blob.core.windows.net", "a.vhd", &key)
            .unwrap()
            .starts_with("https://debianimages.blob.core.windows.net/vhds/a.vhd?sv=2018-03-28&sr=c&sp=rl"));
    }
}
