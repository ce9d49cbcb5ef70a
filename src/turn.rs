#![forbid(unsafe_code)]

// ICE server lists handed to clients with every transport.
//
// Three sources: hosted TURN credentials fetched over HTTP (cached), coturn
// time-limited credentials (HMAC-SHA1 per the TURN REST API, coturn
// --use-auth-secret), and a public STUN list. No source ever fails the
// transport request; errors degrade to the public list.

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type HmacSha1 = Hmac<Sha1>;

pub const CLOUDFLARE_API_BASE: &str = "https://rtc.live.cloudflare.com";

/// How long fetched hosted credentials are reused
const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(3600);
/// TTL requested for hosted credentials, in seconds
const REQUESTED_TTL_SECS: u64 = 3600;
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// ICE server entry sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Public STUN servers used when no relay credentials are available
pub fn public_stun_servers() -> Vec<IceServer> {
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]
        .into_iter()
        .map(|url| IceServer {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        })
        .collect()
}

/// Source of the ICE server list attached to each transport
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn ice_servers(&self, connection_id: &str) -> Vec<IceServer>;
}

/// No relay configured: public STUN only
pub struct PublicStun;

#[async_trait]
impl IceServerProvider for PublicStun {
    async fn ice_servers(&self, _connection_id: &str) -> Vec<IceServer> {
        public_stun_servers()
    }
}

/// coturn shared-secret credentials
#[derive(Debug, Clone)]
pub struct SharedSecretTurn {
    /// TURN server URLs (e.g. ["turn:example.com:3478", "turns:example.com:5349"])
    pub urls: Vec<String>,
    pub secret: String,
    /// Credential TTL in seconds
    pub ttl_secs: u64,
}

impl SharedSecretTurn {
    /// Time-limited credentials for one connection.
    ///
    /// coturn format: username = "expiry_timestamp:arbitrary_id"
    ///               credential = base64(HMAC-SHA1(secret, username))
    pub fn generate_credentials(&self, connection_id: &str) -> Option<IceServer> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;

        let username = format!("{expiry}:{connection_id}");

        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(username.as_bytes());
        let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Some(IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        })
    }
}

#[async_trait]
impl IceServerProvider for SharedSecretTurn {
    async fn ice_servers(&self, connection_id: &str) -> Vec<IceServer> {
        match self.generate_credentials(connection_id) {
            Some(server) => vec![server],
            None => public_stun_servers(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedCredentials {
    ice_servers: IceServer,
}

/// Hosted TURN credentials, fetched once per cache period for all connections
pub struct CloudflareTurn {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    api_token: String,
    cache: Mutex<Option<(Instant, IceServer)>>,
}

impl CloudflareTurn {
    pub fn new(key_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self::with_base_url(CLOUDFLARE_API_BASE, key_id, api_token)
    }

    pub fn with_base_url(base_url: impl Into<String>, key_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            key_id: key_id.into(),
            api_token: api_token.into(),
            cache: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<IceServer, reqwest::Error> {
        let url = format!("{}/v1/turn/keys/{}/credentials/generate", self.base_url, self.key_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "ttl": REQUESTED_TTL_SECS }))
            .send()
            .await?
            .error_for_status()?;
        let generated: GeneratedCredentials = response.json().await?;
        Ok(generated.ice_servers)
    }
}

#[async_trait]
impl IceServerProvider for CloudflareTurn {
    async fn ice_servers(&self, _connection_id: &str) -> Vec<IceServer> {
        // Held across the fetch so concurrent misses share one request
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, server)) = cache.as_ref() {
            if fetched_at.elapsed() < CREDENTIAL_CACHE_TTL {
                debug!("Using cached TURN credentials");
                return vec![server.clone()];
            }
        }

        match self.fetch().await {
            Ok(server) => {
                info!("Fetched TURN credentials ({} urls)", server.urls.len());
                *cache = Some((Instant::now(), server.clone()));
                vec![server]
            }
            Err(e) => {
                warn!("Failed to fetch TURN credentials, using public STUN: {}", e);
                public_stun_servers()
            }
        }
    }
}
