#![forbid(unsafe_code)]

// In-memory media engine for tests. Mirrors the real engine's cascade rules
// and reports closures on the event channel, without touching the network.

use crate::media::types::{ConsumerInfo, MediaError, MediaKind, MediaResult, ProducerId, RouterInfo, TransportInfo};
use crate::media::{EngineEvent, EngineEventSender, MediaEngine};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    routers: HashMap<String, String>,
    transports: HashMap<String, String>,
    connected: HashMap<String, Value>,
    producers: HashMap<String, (String, MediaKind)>,
    consumers: HashMap<String, (String, ProducerId, bool)>,
    closed_transports: Vec<String>,
}

pub struct FakeEngine {
    state: Mutex<FakeState>,
    events: EngineEventSender,
    routers_created: AtomicUsize,
    router_delay: Duration,
    fail_routers: AtomicBool,
    fail_transports: AtomicBool,
    incompatible: AtomicBool,
}

impl FakeEngine {
    pub fn new(events: EngineEventSender) -> Self {
        Self::with_router_delay(events, Duration::ZERO)
    }

    /// Router creation sleeps for `delay`, widening concurrency windows
    pub fn with_router_delay(events: EngineEventSender, delay: Duration) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            events,
            routers_created: AtomicUsize::new(0),
            router_delay: delay,
            fail_routers: AtomicBool::new(false),
            fail_transports: AtomicBool::new(false),
            incompatible: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::SeqCst)
    }

    pub fn live_routers(&self) -> usize {
        self.state().routers.len()
    }

    pub fn live_transports(&self) -> usize {
        self.state().transports.len()
    }

    pub fn live_producers(&self) -> usize {
        self.state().producers.len()
    }

    pub fn live_consumers(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn closed_transports(&self) -> Vec<String> {
        self.state().closed_transports.clone()
    }

    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state().consumers.get(consumer_id).map(|(_, _, paused)| *paused)
    }

    pub fn is_connected(&self, transport_id: &str) -> bool {
        self.state().connected.contains_key(transport_id)
    }

    pub fn fail_routers(&self, fail: bool) {
        self.fail_routers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_transports(&self, fail: bool) {
        self.fail_transports.store(fail, Ordering::SeqCst);
    }

    /// Makes every capability check fail
    pub fn reject_capabilities(&self, reject: bool) {
        self.incompatible.store(reject, Ordering::SeqCst);
    }

    /// Simulates the worker process dying
    pub fn kill_worker(&self) {
        let _ = self.events.send(EngineEvent::WorkerDied {
            reason: "killed by test".into(),
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn close_producer_locked(&self, state: &mut FakeState, producer_id: &str) {
        if state.producers.remove(producer_id).is_none() {
            return;
        }
        let bound: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, (_, p, _))| p == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in bound {
            state.consumers.remove(&consumer_id);
            self.emit(EngineEvent::ConsumerProducerClosed { consumer_id });
        }
    }

    fn close_transport_locked(&self, state: &mut FakeState, transport_id: &str) {
        if state.transports.remove(transport_id).is_none() {
            return;
        }
        state.connected.remove(transport_id);
        state.closed_transports.push(transport_id.to_string());

        let producers: Vec<String> = state
            .producers
            .iter()
            .filter(|(_, (t, _))| t == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.close_producer_locked(state, &producer_id);
            self.emit(EngineEvent::ProducerTransportClosed { producer_id });
        }

        let consumers: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, (t, _, _))| t == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in consumers {
            state.consumers.remove(&consumer_id);
            self.emit(EngineEvent::ConsumerTransportClosed { consumer_id });
        }

        self.emit(EngineEvent::TransportClosed {
            transport_id: transport_id.to_string(),
        });
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_router(&self, room_id: &str) -> MediaResult<RouterInfo> {
        if !self.router_delay.is_zero() {
            tokio::time::sleep(self.router_delay).await;
        }
        if self.fail_routers.load(Ordering::SeqCst) {
            return Err(MediaError::RouterError("injected router failure".into()));
        }
        self.routers_created.fetch_add(1, Ordering::SeqCst);
        let id = Uuid::new_v4().to_string();
        self.state().routers.insert(id.clone(), room_id.to_string());
        Ok(RouterInfo {
            id,
            rtp_capabilities: json!({
                "codecs": [
                    { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                    { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
                ]
            }),
        })
    }

    fn close_router(&self, router_id: &str) {
        let mut state = self.state();
        if state.routers.remove(router_id).is_none() {
            return;
        }
        let transports: Vec<String> = state
            .transports
            .iter()
            .filter(|(_, r)| *r == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            self.close_transport_locked(&mut state, &transport_id);
        }
    }

    async fn create_webrtc_transport(&self, router_id: &str, _app_data: Value) -> MediaResult<TransportInfo> {
        if self.fail_transports.load(Ordering::SeqCst) {
            return Err(MediaError::TransportError("injected transport failure".into()));
        }
        let mut state = self.state();
        if !state.routers.contains_key(router_id) {
            return Err(MediaError::RouterError(format!("Router not found: {router_id}")));
        }
        let id = Uuid::new_v4().to_string();
        state.transports.insert(id.clone(), router_id.to_string());
        Ok(TransportInfo {
            id,
            ice_parameters: json!({ "usernameFragment": "frag", "password": "pwd", "iceLite": true }),
            ice_candidates: json!([{ "ip": "127.0.0.1", "port": 40000, "protocol": "udp" }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::TransportError(format!("Transport not found: {transport_id}")));
        }
        state.connected.insert(transport_id.to_string(), dtls_parameters);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: Value,
        _app_data: Value,
    ) -> MediaResult<ProducerId> {
        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::TransportError(format!("Transport not found: {transport_id}")));
        }
        let id = Uuid::new_v4().to_string();
        state.producers.insert(id.clone(), (transport_id.to_string(), kind));
        Ok(id)
    }

    fn can_consume(&self, _router_id: &str, producer_id: &str, _rtp_capabilities: &Value) -> bool {
        !self.incompatible.load(Ordering::SeqCst) && self.state().producers.contains_key(producer_id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: Value,
        _app_data: Value,
    ) -> MediaResult<ConsumerInfo> {
        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::TransportError(format!("Transport not found: {transport_id}")));
        }
        let kind = state
            .producers
            .get(producer_id)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| MediaError::ProducerError(format!("Producer not found: {producer_id}")))?;
        let id = Uuid::new_v4().to_string();
        state
            .consumers
            .insert(id.clone(), (transport_id.to_string(), producer_id.to_string(), false));
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: json!({ "codecs": [], "encodings": [{ "ssrc": 1111 }] }),
        })
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let mut state = self.state();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;
        consumer.2 = true;
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let mut state = self.state();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;
        consumer.2 = false;
        Ok(())
    }

    fn close_transport(&self, transport_id: &str) {
        let mut state = self.state();
        self.close_transport_locked(&mut state, transport_id);
    }

    fn close_producer(&self, producer_id: &str) {
        let mut state = self.state();
        self.close_producer_locked(&mut state, producer_id);
    }

    fn close_consumer(&self, consumer_id: &str) {
        self.state().consumers.remove(consumer_id);
    }

    async fn worker_stats(&self) -> MediaResult<Value> {
        let state = self.state();
        Ok(json!({
            "pid": 0,
            "routers": state.routers.len(),
            "transports": state.transports.len(),
        }))
    }

    async fn shutdown(&self) {
        let routers: Vec<String> = self.state().routers.keys().cloned().collect();
        for router_id in routers {
            self.close_router(&router_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::engine_events;

    #[tokio::test]
    async fn closing_a_transport_reports_the_cascade() {
        let (tx, mut rx) = engine_events();
        let engine = FakeEngine::new(tx);
        let router = engine.create_router("r1").await.unwrap();
        let send = engine.create_webrtc_transport(&router.id, Value::Null).await.unwrap();
        let recv = engine.create_webrtc_transport(&router.id, Value::Null).await.unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Video, Value::Null, Value::Null)
            .await
            .unwrap();
        let consumer = engine.consume(&recv.id, &producer, Value::Null, Value::Null).await.unwrap();

        engine.close_transport(&send.id);
        engine.close_transport(&send.id);

        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ConsumerProducerClosed { consumer_id: consumer.id.clone() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ProducerTransportClosed { producer_id: producer.clone() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::TransportClosed { transport_id: send.id.clone() }
        );
        assert!(rx.try_recv().is_err(), "second close is a no-op");
        assert_eq!(engine.live_consumers(), 0);
        assert_eq!(engine.live_transports(), 1);
    }
}
