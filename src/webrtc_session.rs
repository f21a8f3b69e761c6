//! WebRTC negotiation backend
//!
//! Runs `webrtc` peer connections on a background tokio runtime. Every
//! callback the library fires is turned into a session event posted to the
//! relay's [`EventSink`], which wakes the mio loop; nothing here touches
//! relay state directly.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::runtime::{Handle, Runtime};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::relay::session::{
    CandidatePair, ConnectionState, EventSink, IceServer, NegotiationSession, SessionError,
    SessionEventKind, SessionFactory, SignalingMessage,
};

/// Data channel label the game clients agree on
const DATA_CHANNEL_LABEL: &str = "faf";

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

// ============================================================================
// Factory
// ============================================================================

pub struct WebRtcSessionFactory {
    runtime: Runtime,
    api: Arc<API>,
}

impl WebRtcSessionFactory {
    pub fn new() -> Result<Self, SessionError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("webrtc")
            .enable_all()
            .build()
            .map_err(|e| SessionError::Create(format!("tokio runtime: {}", e)))?;

        Ok(Self {
            runtime,
            api: Arc::new(APIBuilder::new().build()),
        })
    }
}

impl SessionFactory for WebRtcSessionFactory {
    fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Box<dyn NegotiationSession>, SessionError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let api = Arc::clone(&self.api);
        let pc = self
            .runtime
            .block_on(async move { api.new_peer_connection(config).await })
            .map_err(|e| SessionError::Create(e.to_string()))?;
        let pc = Arc::new(pc);

        let channel: SharedChannel = Arc::new(Mutex::new(None));
        install_handlers(&pc, &sink, &channel);

        Ok(Box::new(WebRtcSession {
            handle: self.runtime.handle().clone(),
            pc,
            channel,
            sink,
            closed: false,
        }))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectionState::New),
        RTCIceConnectionState::Checking => Some(ConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectionState::Completed),
        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
        RTCIceConnectionState::Disconnected | RTCIceConnectionState::Closed => {
            Some(ConnectionState::Disconnected)
        }
        _ => None,
    }
}

/// Forward peer connection callbacks to the sink
fn install_handlers(pc: &Arc<RTCPeerConnection>, sink: &EventSink, channel: &SharedChannel) {
    let s = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let Some(state) = map_state(state) {
            s.emit(SessionEventKind::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let s = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let s = s.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => match serde_json::to_value(init) {
                    Ok(value) => s.emit(SessionEventKind::LocalCandidate(value)),
                    Err(e) => s.emit(SessionEventKind::Error(e.to_string())),
                },
                Err(e) => s.emit(SessionEventKind::Error(e.to_string())),
            }
        })
    }));

    // Answerer side: the remote peer created the channel
    let s = sink.clone();
    let ch = Arc::clone(channel);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let s = s.clone();
        let ch = Arc::clone(&ch);
        Box::pin(async move {
            attach_channel(dc, &s, &ch);
        })
    }));
}

/// Hook data channel callbacks and remember the channel for sending
fn attach_channel(dc: Arc<RTCDataChannel>, sink: &EventSink, channel: &SharedChannel) {
    let s = sink.clone();
    dc.on_open(Box::new(move || {
        s.emit(SessionEventKind::DataChannelOpen);
        Box::pin(async {})
    }));

    let s = sink.clone();
    dc.on_close(Box::new(move || {
        s.emit(SessionEventKind::DataChannelClosed);
        Box::pin(async {})
    }));

    let s = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        s.emit(SessionEventKind::Data(msg.data.to_vec()));
        Box::pin(async {})
    }));

    if let Ok(mut slot) = channel.lock() {
        *slot = Some(dc);
    }
}

// ============================================================================
// Session
// ============================================================================

struct WebRtcSession {
    handle: Handle,
    pc: Arc<RTCPeerConnection>,
    channel: SharedChannel,
    sink: EventSink,
    closed: bool,
}

impl WebRtcSession {
    /// Run `op` on the runtime, reporting a failure as an `Error` event
    fn spawn<F>(&self, what: &'static str, op: F)
    where
        F: std::future::Future<Output = Result<(), webrtc::Error>> + Send + 'static,
    {
        let sink = self.sink.clone();
        self.handle.spawn(async move {
            if let Err(e) = op.await {
                sink.emit(SessionEventKind::Error(format!("{}: {}", what, e)));
            }
        });
    }

    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Operation("session closed".into()));
        }
        Ok(())
    }
}

impl NegotiationSession for WebRtcSession {
    fn create_data_channel(&mut self) -> Result<(), SessionError> {
        self.check_open()?;
        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };

        let pc = Arc::clone(&self.pc);
        let dc = self
            .handle
            .block_on(async move { pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await })
            .map_err(|e| SessionError::Operation(e.to_string()))?;

        attach_channel(dc, &self.sink, &self.channel);
        Ok(())
    }

    fn create_offer(&mut self) -> Result<(), SessionError> {
        self.check_open()?;
        let pc = Arc::clone(&self.pc);
        let sink = self.sink.clone();
        self.spawn("create offer", async move {
            let offer = pc.create_offer(None).await?;
            let sdp = offer.sdp.clone();
            pc.set_local_description(offer).await?;
            sink.emit(SessionEventKind::LocalDescription(SignalingMessage::Offer { sdp }));
            Ok(())
        });
        Ok(())
    }

    fn apply_offer(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.check_open()?;
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| SessionError::Operation(e.to_string()))?;
        let pc = Arc::clone(&self.pc);
        let sink = self.sink.clone();
        self.spawn("apply offer", async move {
            pc.set_remote_description(offer).await?;
            let answer = pc.create_answer(None).await?;
            let sdp = answer.sdp.clone();
            pc.set_local_description(answer).await?;
            sink.emit(SessionEventKind::LocalDescription(SignalingMessage::Answer { sdp }));
            Ok(())
        });
        Ok(())
    }

    fn apply_answer(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.check_open()?;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| SessionError::Operation(e.to_string()))?;
        let pc = Arc::clone(&self.pc);
        self.spawn("apply answer", async move { pc.set_remote_description(answer).await });
        Ok(())
    }

    fn add_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), SessionError> {
        self.check_open()?;
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())
            .map_err(|e| SessionError::Operation(format!("bad candidate: {}", e)))?;
        let pc = Arc::clone(&self.pc);
        self.spawn("add candidate", async move { pc.add_ice_candidate(init).await });
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let dc = self
            .channel
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(SessionError::ChannelClosed)?;
        let data = Bytes::copy_from_slice(data);
        self.spawn("send", async move { dc.send(&data).await.map(|_| ()) });
        Ok(())
    }

    fn request_stats(&mut self) {
        if self.closed {
            return;
        }
        let pc = Arc::clone(&self.pc);
        let sink = self.sink.clone();
        self.handle.spawn(async move {
            let report = pc.get_stats().await;
            sink.emit(SessionEventKind::Stats(active_pair(&report.reports)));
        });
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let dc = self.channel.lock().ok().and_then(|mut slot| slot.take());
        let pc = Arc::clone(&self.pc);
        self.handle.spawn(async move {
            if let Some(dc) = dc {
                let _ = dc.close().await;
            }
            if let Err(e) = pc.close().await {
                log::debug!("Peer connection close failed: {}", e);
            }
        });
    }
}

impl Drop for WebRtcSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Nominated candidate pair from a stats report
fn active_pair(
    reports: &std::collections::HashMap<String, StatsReportType>,
) -> Result<CandidatePair, String> {
    let pair = reports
        .values()
        .find_map(|r| match r {
            StatsReportType::CandidatePair(p) if p.nominated => Some(p),
            _ => None,
        })
        .ok_or_else(|| "no nominated candidate pair".to_string())?;

    let local = match reports.get(&pair.local_candidate_id) {
        Some(StatsReportType::LocalCandidate(c)) => c,
        _ => return Err(format!("local candidate {} missing", pair.local_candidate_id)),
    };
    let remote = match reports.get(&pair.remote_candidate_id) {
        Some(StatsReportType::RemoteCandidate(c)) => c,
        _ => return Err(format!("remote candidate {} missing", pair.remote_candidate_id)),
    };

    Ok(CandidatePair {
        local_addr: format!("{}:{}", local.ip, local.port),
        local_type: local.candidate_type.to_string(),
        remote_addr: format!("{}:{}", remote.ip, remote.port),
        remote_type: remote.candidate_type.to_string(),
    })
}
