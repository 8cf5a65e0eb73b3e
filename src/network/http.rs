// file: src/network/http.rs
// version: 1.0.0
// guid: 3e8b1f5c-7a2d-4b96-8c04-d5e6f7a8b9c0

//! HTTP transport used by the cloud provider clients

use crate::error::CloudImagesError;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    /// `len` bytes of a file starting at `offset`, streamed
    File { path: PathBuf, offset: u64, len: u64 },
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Bytes(bytes) => bytes.len() as u64,
            RequestBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::Head, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = RequestBody::Bytes(serde_json::to_vec(body)?);
        Ok(self.header("Content-Type", "application/json"))
    }

    /// `application/x-www-form-urlencoded` body
    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.body = RequestBody::Bytes(encoded.into_bytes());
        self.header("Content-Type", "application/x-www-form-urlencoded")
    }

    pub fn bytes(mut self, body: Vec<u8>) -> Self {
        self.body = RequestBody::Bytes(body);
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>, offset: u64, len: u64) -> Self {
        self.body = RequestBody::File {
            path: path.into(),
            offset,
            len,
        };
        self
    }

    /// First header with this name, case-insensitive
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, body: &serde_json::Value) -> Self {
        self.with_header("Content-Type", "application/json")
            .with_body(body.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-2xx response into the matching error kind
    pub fn error_for_status(self, context: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(CloudImagesError::from_status(
            self.status,
            format!("{}: {}", context, self.text().trim()),
        ))
    }

    /// Fail unless the status is exactly `expected`
    pub fn expect_status(self, expected: u16, context: &str) -> Result<Self> {
        if self.status == expected {
            return Ok(self);
        }
        let response = self.error_for_status(context)?;
        Err(CloudImagesError::RemoteError {
            status: response.status,
            message: format!("{}: expected status {}", context, expected),
        })
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Sends HTTP requests
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .user_agent(concat!("debian-cloud-images/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CloudImagesError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn body(body: RequestBody) -> Result<reqwest::Body> {
        Ok(match body {
            RequestBody::Empty => reqwest::Body::from(Vec::new()),
            RequestBody::Bytes(bytes) => reqwest::Body::from(bytes),
            RequestBody::File { path, offset, len } => {
                let mut file = tokio::fs::File::open(&path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let stream = tokio_util::io::ReaderStream::new(file.take(len));
                reqwest::Body::wrap_stream(stream)
            }
        })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method.as_str(), request.url);

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let content_length = request.body.len();
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.header_value("Content-Length").is_none()
            && matches!(request.method, Method::Post | Method::Put)
        {
            builder = builder.header("Content-Length", content_length.to_string());
        }
        builder = builder.body(Self::body(request.body).await?);

        let response = builder.send().await.map_err(|e| {
            CloudImagesError::transient(format!("{} {}: {}", request.method.as_str(), request.url, e))
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| CloudImagesError::transient(format!("Reading response body: {}", e)))?
            .to_vec();

        debug!("{} {} -> {}", request.method.as_str(), request.url, status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::os::unix::fs::FileExt;
    use std::sync::Mutex;

    /// A request as seen by the mock, with file bodies read into memory
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: Method,
        pub url: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl RecordedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            find_header(&self.headers, name)
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap()
        }

        /// `METHOD path` without scheme, host and query
        pub fn route(&self) -> String {
            let url = url::Url::parse(&self.url).unwrap();
            format!("{} {}", self.method.as_str(), url.path())
        }
    }

    type Handler = Box<dyn Fn(&RecordedRequest) -> HttpResponse + Send + Sync>;

    /// Records every request and answers with a scripted handler
    pub struct MockTransport {
        pub requests: Mutex<Vec<RecordedRequest>>,
        handler: Handler,
    }

    impl MockTransport {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&RecordedRequest) -> HttpResponse + Send + Sync + 'static,
        {
            Self {
                requests: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            }
        }

        pub fn recorded(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn routes(&self) -> Vec<String> {
            self.recorded().iter().map(RecordedRequest::route).collect()
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let body = match &request.body {
                RequestBody::Empty => Vec::new(),
                RequestBody::Bytes(bytes) => bytes.clone(),
                RequestBody::File { path, offset, len } => {
                    let file = std::fs::File::open(path)?;
                    let mut buf = vec![0u8; *len as usize];
                    file.read_exact_at(&mut buf, *offset)?;
                    buf
                }
            };
            let recorded = RecordedRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                body,
            };
            let response = (self.handler)(&recorded);
            self.requests.lock().unwrap().push(recorded);
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_body_is_urlencoded() {
        let request = HttpRequest::post("https://login.example/token")
            .form(&[("grant_type", "client_credentials"), ("scope", "https://x/.default")]);

        assert_eq!(
            request.body,
            RequestBody::Bytes(
                b"grant_type=client_credentials&scope=https%3A%2F%2Fx%2F.default".to_vec()
            )
        );
        assert_eq!(
            request.header_value("content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_error_for_status_classifies() {
        let ok = HttpResponse::new(201).error_for_status("create");
        assert!(ok.is_ok());

        let busy = HttpResponse::new(503).with_body("later").error_for_status("create");
        assert!(busy.unwrap_err().is_transient());

        let missing = HttpResponse::new(404).error_for_status("get disk");
        assert!(matches!(missing, Err(CloudImagesError::NotFound(_))));
    }

    #[test]
    fn test_expect_status_rejects_other_success() {
        let result = HttpResponse::new(200).expect_status(201, "put page");
        assert!(matches!(
            result,
            Err(CloudImagesError::RemoteError { status: 200, .. })
        ));
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse::new(200)
            .with_header("Location", "https://monitor")
            .with_json(&json!({"a": 1}));

        assert_eq!(response.header("location"), Some("https://monitor"));
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["a"], 1);
    }

    #[tokio::test]
    async fn test_mock_reads_file_ranges() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"0123456789").unwrap();
        let mock = testing::MockTransport::new(|_| HttpResponse::new(201));

        mock.send(HttpRequest::put("https://blob.example/disk?comp=page").file(file.path(), 2, 4))
            .await
            .unwrap();

        let recorded = mock.recorded();
        assert_eq!(recorded[0].body, b"2345");
        assert_eq!(recorded[0].route(), "PUT /disk");
    }
}
