#![forbid(unsafe_code)]

// liveswitch - signaling and program switching for live multi-room WebRTC productions

pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod turn;
