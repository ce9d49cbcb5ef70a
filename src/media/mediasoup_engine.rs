#![forbid(unsafe_code)]

// mediasoup adapter - a single worker hosting one router per room.
//
// Objects close when their last handle drops, so every table below is the
// owning handle. Handles are always dropped after the table lock is released:
// mediasoup runs close handlers synchronously from Drop.

use crate::media::config::{CodecConfig, MediaConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::types::{ConsumerInfo, MediaError, MediaKind, MediaResult, RouterInfo, TransportInfo};
use crate::media::{EngineEvent, EngineEventSender, MediaEngine};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::router::PipeProducerToRouterPair;
use mediasoup::rtp_parameters::MediaKind as RtpMediaKind;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::Mutex as StdMutex;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Tables {
    routers: HashMap<String, Router>,
    /// transport -> (handle, router id)
    transports: HashMap<String, (WebRtcTransport, String)>,
    /// producer -> (handle, transport id, router id)
    producers: HashMap<String, (Producer, String, String)>,
    /// consumer -> (handle, transport id)
    consumers: HashMap<String, (Consumer, String)>,
    /// (producer id, target router id) -> pipe keeping the piped producer alive
    pipes: HashMap<(String, String), PipeProducerToRouterPair>,
}

/// Handles taken out of the tables, dropped once the lock is released.
/// Field order is drop order: dependents before what they depend on.
#[derive(Default)]
struct Released {
    consumers: Vec<Consumer>,
    pipes: Vec<PipeProducerToRouterPair>,
    producers: Vec<Producer>,
    transports: Vec<WebRtcTransport>,
    routers: Vec<Router>,
}

impl Tables {
    fn release_consumer(&mut self, consumer_id: &str, out: &mut Released) {
        if let Some((consumer, _)) = self.consumers.remove(consumer_id) {
            out.consumers.push(consumer);
        }
    }

    fn release_producer(&mut self, producer_id: &str, out: &mut Released) {
        if let Some((producer, _, _)) = self.producers.remove(producer_id) {
            out.producers.push(producer);
        }
        let pipes: Vec<(String, String)> = self
            .pipes
            .keys()
            .filter(|(p, _)| p == producer_id)
            .cloned()
            .collect();
        for key in pipes {
            if let Some(pipe) = self.pipes.remove(&key) {
                out.pipes.push(pipe);
            }
        }
        let target = producer_id.parse::<ProducerId>().ok();
        let bound: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, (c, _))| Some(c.producer_id()) == target)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in bound {
            self.release_consumer(&consumer_id, out);
        }
    }

    fn release_transport(&mut self, transport_id: &str, out: &mut Released) {
        let Some((transport, _)) = self.transports.remove(transport_id) else {
            return;
        };
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, (_, t, _))| t == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.release_producer(&producer_id, out);
        }
        let consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, (_, t))| t == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in consumers {
            self.release_consumer(&consumer_id, out);
        }
        out.transports.push(transport);
    }

    fn release_router(&mut self, router_id: &str, out: &mut Released) {
        let Some(router) = self.routers.remove(router_id) else {
            return;
        };
        let transports: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, (_, r))| r == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            self.release_transport(&transport_id, out);
        }
        let pipes: Vec<(String, String)> = self
            .pipes
            .keys()
            .filter(|(_, r)| r == router_id)
            .cloned()
            .collect();
        for key in pipes {
            if let Some(pipe) = self.pipes.remove(&key) {
                out.pipes.push(pipe);
            }
        }
        out.routers.push(router);
    }
}

impl WorkerConfig {
    fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = match self.log_level.as_str() {
            "debug" => WorkerLogLevel::Debug,
            "error" => WorkerLogLevel::Error,
            "none" => WorkerLogLevel::None,
            _ => WorkerLogLevel::Warn,
        };
        settings.log_tags = self
            .log_tags
            .iter()
            .filter_map(|tag| match tag.as_str() {
                "info" => Some(WorkerLogTag::Info),
                "ice" => Some(WorkerLogTag::Ice),
                "dtls" => Some(WorkerLogTag::Dtls),
                "rtp" => Some(WorkerLogTag::Rtp),
                "srtp" => Some(WorkerLogTag::Srtp),
                "rtcp" => Some(WorkerLogTag::Rtcp),
                _ => None,
            })
            .collect();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

impl CodecConfig {
    fn to_capability(&self) -> MediaResult<RtpCodecCapability> {
        let clock = |rate: u32| {
            NonZeroU32::new(rate).ok_or_else(|| MediaError::InvalidParameters("clock rate must be non-zero".into()))
        };
        let video_feedback = vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ];
        Ok(match self {
            CodecConfig::Opus { clock_rate, channels } => RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: clock(*clock_rate)?,
                channels: NonZeroU8::new(*channels)
                    .ok_or_else(|| MediaError::InvalidParameters("channel count must be non-zero".into()))?,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            CodecConfig::Vp8 { clock_rate } => RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: clock(*clock_rate)?,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_feedback,
            },
            CodecConfig::H264 {
                clock_rate,
                packetization_mode,
                profile_level_id,
                level_asymmetry_allowed,
            } => RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: None,
                clock_rate: clock(*clock_rate)?,
                parameters: RtpCodecParametersParameters::from([
                    ("packetization-mode", (*packetization_mode).into()),
                    ("profile-level-id", profile_level_id.as_str().into()),
                    ("level-asymmetry-allowed", (*level_asymmetry_allowed).into()),
                ]),
                rtcp_feedback: video_feedback,
            },
        })
    }
}

impl WebRtcTransportConfig {
    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_ip.map(|ip| ip.to_string()),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    fn to_transport_options(&self) -> WebRtcTransportOptions {
        let mut listen_infos = if self.enable_udp || !self.enable_tcp {
            WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp))
        } else {
            WebRtcTransportListenInfos::new(self.listen_info(Protocol::Tcp))
        };
        if self.enable_udp && self.enable_tcp {
            listen_infos = listen_infos.insert(self.listen_info(Protocol::Tcp));
        }
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.prefer_udp = self.prefer_udp;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

fn to_value<T: serde::Serialize>(value: &T, what: &str) -> MediaResult<Value> {
    serde_json::to_value(value).map_err(|e| MediaError::InvalidParameters(format!("Failed to encode {what}: {e}")))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| MediaError::InvalidParameters(format!("Invalid {what}: {e}")))
}

fn parse_producer_id(producer_id: &str) -> MediaResult<ProducerId> {
    producer_id
        .parse()
        .map_err(|_| MediaError::ProducerError(format!("Invalid producer ID: {producer_id}")))
}

/// Media engine backed by one mediasoup worker.
pub struct MediasoupEngine {
    worker: Worker,
    // Owns the worker thread; must outlive `worker`
    _worker_manager: WorkerManager,
    config: MediaConfig,
    events: EngineEventSender,
    tables: StdMutex<Tables>,
}

impl MediasoupEngine {
    /// Starts the worker. A worker that later dies is reported as
    /// `EngineEvent::WorkerDied` and never replaced.
    pub async fn new(config: MediaConfig, events: EngineEventSender) -> MediaResult<Self> {
        let worker_manager = WorkerManager::new();
        let worker = worker_manager
            .create_worker(config.worker_config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

        info!(
            "Media worker {} started (rtc ports {}-{})",
            worker.id(),
            config.worker_config.rtc_min_port,
            config.worker_config.rtc_max_port
        );

        worker
            .on_dead({
                let events = events.clone();
                let worker_id = worker.id();
                move |reason| {
                    error!("Media worker {} died: {:?}", worker_id, reason);
                    let _ = events.send(EngineEvent::WorkerDied {
                        reason: format!("{reason:?}"),
                    });
                }
            })
            .detach();

        Ok(Self {
            worker,
            _worker_manager: worker_manager,
            config,
            events,
            tables: StdMutex::new(Tables::default()),
        })
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, f: impl FnOnce(&mut Tables, &mut Released)) {
        let mut released = Released::default();
        {
            let mut tables = self.tables();
            f(&mut tables, &mut released);
        }
        drop(released);
    }

    fn setup_transport_handlers(&self, transport: &WebRtcTransport) {
        let transport_id = transport.id().to_string();

        transport
            .on_close({
                let events = self.events.clone();
                let transport_id = transport_id.clone();
                Box::new(move || {
                    debug!("Transport {} closed", transport_id);
                    let _ = events.send(EngineEvent::TransportClosed { transport_id });
                })
            })
            .detach();

        transport
            .on_dtls_state_change({
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    debug!("DTLS state: {:?} for transport {}", dtls_state, transport_id);
                }
            })
            .detach();

        transport
            .on_ice_state_change({
                let transport_id = transport_id;
                move |ice_state| {
                    debug!("ICE state: {:?} for transport {}", ice_state, transport_id);
                }
            })
            .detach();
    }

    fn setup_producer_handlers(&self, producer: &Producer) {
        let producer_id = producer.id().to_string();

        producer
            .on_transport_close({
                let events = self.events.clone();
                let producer_id = producer_id.clone();
                move || {
                    let _ = events.send(EngineEvent::ProducerTransportClosed { producer_id });
                }
            })
            .detach();

        producer
            .on_close({
                let producer_id = producer_id;
                move || {
                    debug!("Producer {} closed", producer_id);
                }
            })
            .detach();
    }

    fn setup_consumer_handlers(&self, consumer: &Consumer) {
        let consumer_id = consumer.id().to_string();

        consumer
            .on_transport_close({
                let events = self.events.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    let _ = events.send(EngineEvent::ConsumerTransportClosed { consumer_id });
                }
            })
            .detach();

        consumer
            .on_producer_close({
                let events = self.events.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    let _ = events.send(EngineEvent::ConsumerProducerClosed { consumer_id });
                }
            })
            .detach();

        consumer
            .on_close({
                let consumer_id = consumer_id;
                move || {
                    debug!("Consumer {} closed", consumer_id);
                }
            })
            .detach();
    }

    /// Makes `producer_id` available on `target_router_id` if it lives on another router
    async fn ensure_piped(&self, producer_id: &str, target_router_id: &str) -> MediaResult<()> {
        let (source, target) = {
            let tables = self.tables();
            let (_, _, source_router_id) = tables
                .producers
                .get(producer_id)
                .ok_or_else(|| MediaError::ProducerError(format!("Producer not found: {producer_id}")))?;
            if source_router_id == target_router_id
                || tables
                    .pipes
                    .contains_key(&(producer_id.to_string(), target_router_id.to_string()))
            {
                return Ok(());
            }
            let source = tables
                .routers
                .get(source_router_id)
                .cloned()
                .ok_or_else(|| MediaError::RouterError(format!("Router not found: {source_router_id}")))?;
            let target = tables
                .routers
                .get(target_router_id)
                .cloned()
                .ok_or_else(|| MediaError::RouterError(format!("Router not found: {target_router_id}")))?;
            (source, target)
        };

        let pipe = source
            .pipe_producer_to_router(parse_producer_id(producer_id)?, PipeToRouterOptions::new(target))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to pipe producer: {e}")))?;

        info!("Piped producer {} into router {}", producer_id, target_router_id);
        self.tables()
            .pipes
            .insert((producer_id.to_string(), target_router_id.to_string()), pipe);
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self, room_id: &str) -> MediaResult<RouterInfo> {
        let codecs = self
            .config
            .router_config
            .media_codecs
            .iter()
            .map(CodecConfig::to_capability)
            .collect::<MediaResult<Vec<_>>>()?;

        let router = self
            .worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        let router_id = router.id().to_string();
        let rtp_capabilities = to_value(router.rtp_capabilities(), "router capabilities")?;

        router
            .on_close({
                let room_id = room_id.to_string();
                move || {
                    debug!("Router closed for room: {}", room_id);
                }
            })
            .detach();

        info!("Created router {} for room {}", router_id, room_id);
        self.tables().routers.insert(router_id.clone(), router);

        Ok(RouterInfo {
            id: router_id,
            rtp_capabilities,
        })
    }

    fn close_router(&self, router_id: &str) {
        self.release(|tables, out| tables.release_router(router_id, out));
    }

    async fn create_webrtc_transport(&self, router_id: &str, app_data: Value) -> MediaResult<TransportInfo> {
        let router = self
            .tables()
            .routers
            .get(router_id)
            .cloned()
            .ok_or_else(|| MediaError::RouterError(format!("Router not found: {router_id}")))?;

        let mut options = self.config.webrtc_transport_config.to_transport_options();
        options.app_data = AppData::new(app_data);

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        let info = TransportInfo {
            id: transport.id().to_string(),
            ice_parameters: to_value(transport.ice_parameters(), "ICE parameters")?,
            ice_candidates: to_value(transport.ice_candidates(), "ICE candidates")?,
            dtls_parameters: to_value(&transport.dtls_parameters(), "DTLS parameters")?,
        };
        self.setup_transport_handlers(&transport);
        self.tables()
            .transports
            .insert(info.id.clone(), (transport, router_id.to_string()));

        debug!("Created transport {} on router {}", info.id, router_id);
        Ok(info)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = from_value(dtls_parameters, "DTLS parameters")?;
        let transport = self
            .tables()
            .transports
            .get(transport_id)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))?;

        info!("Connected transport {}", transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> MediaResult<String> {
        let rtp_parameters: RtpParameters = from_value(rtp_parameters, "RTP parameters")?;
        let (transport, router_id) = self
            .tables()
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        let rtp_kind = match kind {
            MediaKind::Audio => RtpMediaKind::Audio,
            MediaKind::Video => RtpMediaKind::Video,
        };
        let mut options = ProducerOptions::new(rtp_kind, rtp_parameters);
        options.app_data = AppData::new(app_data);

        let producer = transport
            .produce(options)
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        self.setup_producer_handlers(&producer);

        let orphan = {
            let mut tables = self.tables();
            if tables.transports.contains_key(transport_id) {
                tables
                    .producers
                    .insert(producer_id.clone(), (producer, transport_id.to_string(), router_id));
                None
            } else {
                Some(producer)
            }
        };
        if orphan.is_some() {
            warn!("Transport {} closed while producing; dropping producer {}", transport_id, producer_id);
            drop(orphan);
            return Err(MediaError::TransportError(format!("Transport not found: {transport_id}")));
        }

        info!("Created {} producer {} on transport {}", kind, producer_id, transport_id);
        Ok(producer_id)
    }

    fn can_consume(&self, router_id: &str, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(capabilities) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        let Ok(producer_id) = parse_producer_id(producer_id) else {
            return false;
        };
        self.tables()
            .routers
            .get(router_id)
            .is_some_and(|router| router.can_consume(&producer_id, &capabilities))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
        app_data: Value,
    ) -> MediaResult<ConsumerInfo> {
        let rtp_capabilities: RtpCapabilities = from_value(rtp_capabilities, "RTP capabilities")?;
        let (transport, router_id) = self
            .tables()
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        self.ensure_piped(producer_id, &router_id).await?;

        let mut options = ConsumerOptions::new(parse_producer_id(producer_id)?, rtp_capabilities);
        options.app_data = AppData::new(app_data);

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: match consumer.kind() {
                RtpMediaKind::Audio => MediaKind::Audio,
                RtpMediaKind::Video => MediaKind::Video,
            },
            rtp_parameters: to_value(consumer.rtp_parameters(), "RTP parameters")?,
        };
        self.setup_consumer_handlers(&consumer);
        self.tables()
            .consumers
            .insert(info.id.clone(), (consumer, transport_id.to_string()));

        info!("Created consumer {} for producer {} on transport {}", info.id, producer_id, transport_id);
        Ok(info)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self
            .tables()
            .consumers
            .get(consumer_id)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;
        consumer
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer: {e}")))
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self
            .tables()
            .consumers
            .get(consumer_id)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    fn close_transport(&self, transport_id: &str) {
        self.release(|tables, out| tables.release_transport(transport_id, out));
    }

    fn close_producer(&self, producer_id: &str) {
        self.release(|tables, out| tables.release_producer(producer_id, out));
    }

    fn close_consumer(&self, consumer_id: &str) {
        self.release(|tables, out| tables.release_consumer(consumer_id, out));
    }

    async fn worker_stats(&self) -> MediaResult<Value> {
        let usage = self
            .worker
            .get_resource_usage()
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to read worker usage: {e}")))?;
        let (routers, transports) = {
            let tables = self.tables();
            (tables.routers.len(), tables.transports.len())
        };
        Ok(json!({
            "workerId": self.worker.id().to_string(),
            "ruUtime": usage.ru_utime,
            "ruStime": usage.ru_stime,
            "ruMaxrss": usage.ru_maxrss,
            "routers": routers,
            "transports": transports,
        }))
    }

    async fn shutdown(&self) {
        info!("Closing all routers");
        self.release(|tables, out| {
            let routers: Vec<String> = tables.routers.keys().cloned().collect();
            for router_id in routers {
                tables.release_router(&router_id, out);
            }
        });
    }
}
