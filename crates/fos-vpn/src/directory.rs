//! Server Directory Client
//!
//! Logical contract with the registration backend: list servers, register
//! a public key (optionally with a preferred server), redeem an invite code.

use crate::http::HttpClient;
use crate::keys::PublicKey;
use crate::secret_store::AuthToken;
use crate::server::{dedupe_by_name, ServerRecord};
use async_trait::async_trait;
use hyper::header::AUTHORIZATION;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

/// Backend client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to fetch server list: {0}")]
    FailedToFetchServerList(String),

    #[error("Failed to parse server list response: {0}")]
    FailedToParseServerListResponse(String),

    #[error("Failed to encode register key request: {0}")]
    FailedToEncodeRegisterKeyRequest(String),

    #[error("Failed to fetch registered servers: {0}")]
    FailedToFetchRegisteredServers(String),

    #[error("Failed to parse registered servers response: {0}")]
    FailedToParseRegisteredServersResponse(String),

    #[error("Failed to encode redeem request: {0}")]
    FailedToEncodeRedeemRequest(String),

    #[error("Invalid invite code")]
    InvalidInviteCode,

    #[error("Failed to redeem invite code: {0}")]
    FailedToRedeemInviteCode(String),

    #[error("Failed to parse redeem response: {0}")]
    FailedToParseRedeemResponse(String),

    #[error("Invalid auth token")]
    InvalidAuthToken,
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::FailedToFetchServerList(_) => "failedToFetchServerList",
            ClientError::FailedToParseServerListResponse(_) => "failedToParseServerListResponse",
            ClientError::FailedToEncodeRegisterKeyRequest(_) => "failedToEncodeRegisterKeyRequest",
            ClientError::FailedToFetchRegisteredServers(_) => "failedToFetchRegisteredServers",
            ClientError::FailedToParseRegisteredServersResponse(_) => "failedToParseRegisteredServersResponse",
            ClientError::FailedToEncodeRedeemRequest(_) => "failedToEncodeRedeemRequest",
            ClientError::InvalidInviteCode => "invalidInviteCode",
            ClientError::FailedToRedeemInviteCode(_) => "failedToRedeemInviteCode",
            ClientError::FailedToParseRedeemResponse(_) => "failedToParseRedeemResponse",
            ClientError::InvalidAuthToken => "invalidAuthToken",
        }
    }
}

/// Registration backend contract
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// All servers, with this device's registration state
    async fn get_servers(&self, token: &AuthToken) -> Result<Vec<ServerRecord>, ClientError>;

    /// Register `public_key`; `preferred_server` pins the registration
    async fn register(
        &self,
        token: &AuthToken,
        public_key: &PublicKey,
        preferred_server: Option<&str>,
    ) -> Result<Vec<ServerRecord>, ClientError>;

    /// Exchange an invite code for an auth token
    async fn redeem(&self, invite_code: &str) -> Result<AuthToken, ClientError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterKeyRequest<'a> {
    public_key: String,
    server: &'a str,
}

#[derive(Serialize)]
struct RedeemRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct RedeemResponse {
    token: String,
}

/// [`DirectoryClient`] over HTTPS
pub struct HttpDirectoryClient {
    base_url: Url,
    http: HttpClient,
}

impl HttpDirectoryClient {
    /// `base_url` is the API root, e.g. `https://controller.example.net/`
    pub fn new(mut base_url: Url, http: HttpClient) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { base_url, http }
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.base_url
            .join(path)
            .map_err(|e| format!("{} is not usable as an API root: {}", self.base_url, e))
    }

    fn bearer(token: &AuthToken) -> (hyper::header::HeaderName, String) {
        (AUTHORIZATION, format!("bearer {}", token.as_str()))
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn get_servers(&self, token: &AuthToken) -> Result<Vec<ServerRecord>, ClientError> {
        let url = self.endpoint("servers").map_err(ClientError::FailedToFetchServerList)?;
        let response = self.http
            .get(&url, &[Self::bearer(token)])
            .await
            .map_err(|e| ClientError::FailedToFetchServerList(e.to_string()))?;

        if is_auth_failure(response.status) {
            return Err(ClientError::InvalidAuthToken);
        }
        if !response.is_success() {
            return Err(ClientError::FailedToFetchServerList(format!("status {}", response.status)));
        }

        let servers: Vec<ServerRecord> = serde_json::from_slice(&response.body)
            .map_err(|e| ClientError::FailedToParseServerListResponse(e.to_string()))?;

        debug!("Fetched {} servers", servers.len());
        Ok(dedupe_by_name(servers))
    }

    async fn register(
        &self,
        token: &AuthToken,
        public_key: &PublicKey,
        preferred_server: Option<&str>,
    ) -> Result<Vec<ServerRecord>, ClientError> {
        let request = RegisterKeyRequest {
            public_key: public_key.to_base64(),
            server: preferred_server.unwrap_or("*"),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| ClientError::FailedToEncodeRegisterKeyRequest(e.to_string()))?;

        let url = self.endpoint("register").map_err(ClientError::FailedToFetchRegisteredServers)?;
        let response = self.http
            .post_json(&url, &[Self::bearer(token)], body)
            .await
            .map_err(|e| ClientError::FailedToFetchRegisteredServers(e.to_string()))?;

        if is_auth_failure(response.status) {
            return Err(ClientError::InvalidAuthToken);
        }
        if !response.is_success() {
            return Err(ClientError::FailedToFetchRegisteredServers(format!("status {}", response.status)));
        }

        let servers: Vec<ServerRecord> = serde_json::from_slice(&response.body)
            .map_err(|e| ClientError::FailedToParseRegisteredServersResponse(e.to_string()))?;

        info!("Registered {:?} with {} server(s)", public_key, servers.len());
        Ok(dedupe_by_name(servers))
    }

    async fn redeem(&self, invite_code: &str) -> Result<AuthToken, ClientError> {
        let body = serde_json::to_vec(&RedeemRequest { code: invite_code })
            .map_err(|e| ClientError::FailedToEncodeRedeemRequest(e.to_string()))?;

        let url = self.endpoint("redeem").map_err(ClientError::FailedToRedeemInviteCode)?;
        let response = self.http
            .post_json(&url, &[], body)
            .await
            .map_err(|e| ClientError::FailedToRedeemInviteCode(e.to_string()))?;

        if response.status == StatusCode::BAD_REQUEST {
            return Err(ClientError::InvalidInviteCode);
        }
        if !response.is_success() {
            return Err(ClientError::FailedToRedeemInviteCode(format!("status {}", response.status)));
        }

        let redeemed: RedeemResponse = serde_json::from_slice(&response.body)
            .map_err(|e| ClientError::FailedToParseRedeemResponse(e.to_string()))?;

        Ok(AuthToken::new(redeemed.token))
    }
}
