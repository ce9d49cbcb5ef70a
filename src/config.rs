#![forbid(unsafe_code)]

// Server configuration loaded from environment variables.

use crate::media::MediaConfig;
use crate::turn::{CloudflareTurn, IceServerProvider, PublicStun, SharedSecretTurn};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_ROOM_ID: &str = "default";
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;
/// coturn credential lifetime when TURN_TTL is unset (24h)
pub const DEFAULT_TURN_TTL_SECS: u64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Which relay credential source to hand out with transports
#[derive(Clone, PartialEq, Eq)]
pub enum IceSource {
    Cloudflare { key_id: String, api_token: String },
    SharedSecret { urls: Vec<String>, secret: String, ttl_secs: u64 },
    PublicStun,
}

impl fmt::Debug for IceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceSource::Cloudflare { key_id, .. } => f
                .debug_struct("Cloudflare")
                .field("key_id", key_id)
                .field("api_token", &"[REDACTED]")
                .finish(),
            IceSource::SharedSecret { urls, ttl_secs, .. } => f
                .debug_struct("SharedSecret")
                .field("urls", urls)
                .field("secret", &"[REDACTED]")
                .field("ttl_secs", ttl_secs)
                .finish(),
            IceSource::PublicStun => f.write_str("PublicStun"),
        }
    }
}

impl IceSource {
    pub fn into_provider(self) -> Arc<dyn IceServerProvider> {
        match self {
            IceSource::Cloudflare { key_id, api_token } => Arc::new(CloudflareTurn::new(key_id, api_token)),
            IceSource::SharedSecret { urls, secret, ttl_secs } => Arc::new(SharedSecretTurn { urls, secret, ttl_secs }),
            IceSource::PublicStun => Arc::new(PublicStun),
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub announce_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub max_connections: usize,
    /// Room used by transport and capability requests from connections without a room
    pub default_room_id: String,
    pub ice_source: IceSource,
    /// Bearer token guarding /metrics
    pub metrics_token: Option<String>,
    pub json_logs: bool,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("announce_ip", &self.announce_ip)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("max_connections", &self.max_connections)
            .field("default_room_id", &self.default_room_id)
            .field("ice_source", &self.ice_source)
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "[REDACTED]"))
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            default_room_id: DEFAULT_ROOM_ID.to_string(),
            ice_source: IceSource::PublicStun,
            metrics_token: None,
            json_logs: false,
        }
    }
}

/// Parses `key`, falling back to `default` with a warning when it is malformed
fn parse_or<T: FromStr + fmt::Display>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    match vars.get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using default {}", key, raw, default);
            default
        }),
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let announce_ip = match vars.get("ANNOUNCE_IP") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("ANNOUNCE_IP={raw}")))?,
            None => {
                info!("No ANNOUNCE_IP set, using {}", defaults.announce_ip);
                defaults.announce_ip
            }
        };

        let rtc_min_port = parse_or(vars, "RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT);
        let rtc_max_port = parse_or(vars, "RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT);
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RTC_MIN_PORT {rtc_min_port} is above RTC_MAX_PORT {rtc_max_port}"
            )));
        }

        let mut max_connections = parse_or(vars, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let default_room_id = non_empty(vars, "DEFAULT_ROOM_ID").unwrap_or(defaults.default_room_id);

        let ice_source = match (
            non_empty(vars, "CLOUDFLARE_TURN_KEY_ID"),
            non_empty(vars, "CLOUDFLARE_API_TOKEN"),
            non_empty(vars, "TURN_URLS"),
            non_empty(vars, "TURN_SECRET"),
        ) {
            (Some(key_id), Some(api_token), _, _) => IceSource::Cloudflare { key_id, api_token },
            (_, _, Some(urls), Some(secret)) => IceSource::SharedSecret {
                urls: urls
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                secret,
                ttl_secs: parse_or(vars, "TURN_TTL", DEFAULT_TURN_TTL_SECS),
            },
            _ => IceSource::PublicStun,
        };

        let bind_addr = match vars.get("BIND_ADDR") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("BIND_ADDR={raw}")))?,
            None => defaults.bind_addr,
        };

        Ok(Self {
            bind_addr,
            port: parse_or(vars, "PORT", DEFAULT_PORT),
            announce_ip,
            rtc_min_port,
            rtc_max_port,
            max_connections,
            default_room_id,
            ice_source,
            metrics_token: non_empty(vars, "METRICS_TOKEN"),
            json_logs: vars
                .get("LOG_FORMAT")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("json")),
        })
    }

    /// Engine settings derived from this configuration
    pub fn media_config(&self) -> MediaConfig {
        let mut media = MediaConfig::default();
        media.worker_config.rtc_min_port = self.rtc_min_port;
        media.worker_config.rtc_max_port = self.rtc_max_port;
        media.webrtc_transport_config = media.webrtc_transport_config.with_public_ip(self.announce_ip);
        media
    }
}
