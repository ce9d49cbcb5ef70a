#![forbid(unsafe_code)]

// Configuration for the media worker, room routers, and WebRTC transports.
// Kept engine-neutral; the mediasoup adapter converts it into its own settings.

use std::net::{IpAddr, Ipv4Addr};

/// Main media engine configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .into_iter()
                .map(String::from)
                .collect(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

/// Codec offered by every room router
#[derive(Debug, Clone, PartialEq)]
pub enum CodecConfig {
    Opus { clock_rate: u32, channels: u8 },
    Vp8 { clock_rate: u32 },
    H264 {
        clock_rate: u32,
        packetization_mode: u32,
        profile_level_id: String,
        level_asymmetry_allowed: u32,
    },
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<CodecConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![
                CodecConfig::Opus { clock_rate: 48000, channels: 2 },
                CodecConfig::Vp8 { clock_rate: 90000 },
                CodecConfig::H264 {
                    clock_rate: 90000,
                    packetization_mode: 1,
                    profile_level_id: "42e01f".to_string(),
                    level_asymmetry_allowed: 1,
                },
            ],
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_ip = Some(public_ip);
        self
    }
}
