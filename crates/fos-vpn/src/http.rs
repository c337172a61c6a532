//! HTTP Client
//!
//! Minimal hyper client used to reach the registration backend.
//! Features:
//! - One HTTP/1.1 connection per request
//! - Automatic HTTPS with rustls and the webpki root store
//! - Request and connect timeouts
//! - Response body size limit

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("fos-vpn/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: Vec<u8>,
    /// Total request time
    pub elapsed: Duration,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// HTTP client
#[derive(Debug, Clone)]
pub struct HttpClient {
    config: HttpClientConfig,
    tls: Arc<ClientConfig>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: Arc::new(tls),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Perform a GET request
    pub async fn get(&self, url: &Url, headers: &[(HeaderName, String)]) -> Result<Response, HttpError> {
        self.request(Method::GET, url, headers, None).await
    }

    /// Perform a POST request with a JSON body
    pub async fn post_json(
        &self,
        url: &Url,
        headers: &[(HeaderName, String)],
        body: Vec<u8>,
    ) -> Result<Response, HttpError> {
        self.request(Method::POST, url, headers, Some(body)).await
    }

    /// Perform an HTTP request
    pub async fn request(
        &self,
        method: Method,
        url: &Url,
        headers: &[(HeaderName, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        tokio::time::timeout(self.config.timeout, self.send(method, url, headers, body))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: &[(HeaderName, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        let start = Instant::now();

        let host = url.host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?;
        let port = url.port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl("No port in URL".to_string()))?;
        let is_https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(HttpError::InvalidUrl(format!("Unsupported scheme {}", other))),
        };

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, host)
            .header(USER_AGENT, &self.config.user_agent);

        for (name, value) in headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::HttpError(e.to_string()))?;
            builder = builder.header(name, value);
        }
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }

        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| HttpError::Timeout)?
        .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let response = if is_https {
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;

            let tls_stream = connector.connect(server_name, stream).await
                .map_err(|e| HttpError::TlsError(e.to_string()))?;

            exchange(tls_stream, request).await?
        } else {
            exchange(stream, request).await?
        };

        let status = response.status();
        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body = collected.to_bytes().to_vec();

        let elapsed = start.elapsed();
        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?})",
            method, url, status, body.len(), elapsed
        );

        Ok(Response { status, body, elapsed })
    }
}

async fn exchange<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await
        .map_err(|e| HttpError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender.send_request(request).await
        .map_err(|e| HttpError::HttpError(e.to_string()))
}
