use std::sync::Arc;

use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::negotiator::NegotiatedCodec;
use super::state::{ConnectionState, ConnectionStateFeed, ConnectionStateStream};
use super::*;
use crate::config::{IceServerConfig, RtcConfig};
use crate::media::TrackSink;

pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const OPUS_CLOCK_RATE: u32 = 48000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to register codecs: {0}")]
    MediaEngine(#[source] webrtc::Error),

    #[error("failed to create peer connection: {0}")]
    PeerConnection(#[source] webrtc::Error),

    #[error("failed to create {kind} track: {reason}")]
    TrackCreation { kind: &'static str, reason: String },

    #[error("remote description rejected: {0}")]
    RemoteDescription(String),

    #[error("failed to create answer: {0}")]
    Answer(#[source] webrtc::Error),

    #[error("failed to apply local description: {0}")]
    LocalDescription(#[source] webrtc::Error),

    #[error("local description missing after negotiation")]
    MissingLocalDescription,
}

/// A negotiated peer connection with its two outbound sinks.
pub struct Session {
    pub local_description: RTCSessionDescription,
    pub video_sink: Arc<TrackSink>,
    pub audio_sink: Arc<TrackSink>,
    states: Option<ConnectionStateStream>,
    feed: ConnectionStateFeed,
    peer_connection: Arc<RTCPeerConnection>,
}

impl Session {
    /// The stream subscribed before negotiation started, so it holds every
    /// transition. Only the first call gets it.
    pub fn take_states(&mut self) -> Option<ConnectionStateStream> {
        self.states.take()
    }

    /// Additional observer of connection-state transitions.
    pub fn subscribe_states(&self) -> ConnectionStateStream {
        self.feed.subscribe()
    }

    pub async fn close(&self) {
        self.video_sink.close();
        self.audio_sink.close();
        if let Err(e) = self.peer_connection.close().await {
            warn!("closing peer connection failed: {}", e);
        }
        self.feed.close();
        info!("session closed");
    }
}

pub struct SessionBootstrapper {
    ice_servers: Vec<IceServerConfig>,
    stream_id: String,
}

impl SessionBootstrapper {
    pub fn new(cfg: &RtcConfig) -> Self {
        Self {
            ice_servers: cfg.ice_servers.clone(),
            stream_id: cfg.stream_id.clone(),
        }
    }

    /// Answers `remote` with a VP8 video track on the negotiated payload id
    /// and an Opus audio track.
    ///
    /// Waits for ICE gathering to finish so the returned answer carries every
    /// local candidate; connectivity checks continue after this returns and
    /// are reported on [`Session::take_states`].
    pub async fn bootstrap(
        &self,
        remote: RTCSessionDescription,
        video: &NegotiatedCodec,
    ) -> Result<Session, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: vp8_capability(video.clock_rate()),
                    payload_type: video.payload_id(),
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(SessionError::MediaEngine)?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(SessionError::MediaEngine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(SessionError::MediaEngine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(SessionError::PeerConnection)?,
        );

        let pending = PendingConnection::new(&peer_connection);
        let negotiated = self.negotiate(&peer_connection, remote, video).await;
        pending.disarm();

        match negotiated {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(close_err) = peer_connection.close().await {
                    warn!("closing half-built peer connection failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        remote: RTCSessionDescription,
        video: &NegotiatedCodec,
    ) -> Result<Session, SessionError> {
        if video.clock_rate() == 0 {
            return Err(SessionError::TrackCreation {
                kind: "video",
                reason: format!("payload {} has no clock rate", video.payload_id()),
            });
        }
        let video_track = Arc::new(TrackLocalStaticSample::new(
            vp8_capability(video.clock_rate()),
            "video".to_owned(),
            self.stream_id.clone(),
        ));
        self.add_track(peer_connection, &video_track, "video").await?;

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_owned(),
            self.stream_id.clone(),
        ));
        self.add_track(peer_connection, &audio_track, "audio").await?;

        let feed = ConnectionStateFeed::new();
        let states = feed.subscribe();
        Self::setup_pc_handlers(peer_connection, feed.clone());

        peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| SessionError::RemoteDescription(e.to_string()))?;
        debug!("remote description applied");

        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(SessionError::Answer)?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(SessionError::LocalDescription)?;
        let _ = gather_complete.recv().await;

        let local_description = peer_connection
            .local_description()
            .await
            .ok_or(SessionError::MissingLocalDescription)?;
        info!("local answer ready ({} bytes of sdp)", local_description.sdp.len());

        Ok(Session {
            local_description,
            video_sink: Arc::new(TrackSink::new(video_track, video.clock_rate())),
            audio_sink: Arc::new(TrackSink::new(audio_track, OPUS_CLOCK_RATE)),
            states: Some(states),
            feed,
            peer_connection: Arc::clone(peer_connection),
        })
    }

    async fn add_track(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        track: &Arc<TrackLocalStaticSample>,
        kind: &'static str,
    ) -> Result<(), SessionError> {
        let rtp_sender = peer_connection
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SessionError::TrackCreation {
                kind,
                reason: e.to_string(),
            })?;
        tokio::spawn(Self::rtcp_drain(rtp_sender, kind));
        debug!("{} track {} registered", kind, track.id());
        Ok(())
    }

    fn setup_pc_handlers(peer_connection: &Arc<RTCPeerConnection>, feed: ConnectionStateFeed) {
        peer_connection.on_ice_connection_state_change(Box::new(
            move |ice_state: RTCIceConnectionState| {
                let state = ConnectionState::from(ice_state);
                info!("ice connection state changed: {} ({})", state, ice_state);
                feed.publish(state);
                Box::pin(async {})
            },
        ));

        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                debug!("peer connection state changed: {}", s);
                if s == RTCPeerConnectionState::Failed {
                    warn!("peer connection has failed");
                }
                Box::pin(async {})
            },
        ));
    }

    // Incoming RTCP has to be read for the interceptors (NACK, reports) to run.
    async fn rtcp_drain(sender: Arc<RTCRtpSender>, kind: &'static str) {
        let mut buff = vec![0u8; 1500];
        loop {
            match sender.read(&mut buff).await {
                Ok((packets, _)) => {
                    if !packets.is_empty() {
                        debug!("{} sender got {} rtcp packets", kind, packets.len());
                    }
                }
                Err(err) => {
                    debug!("{} rtcp reader stopped: {}", kind, err);
                    break;
                }
            }
        }
    }
}

/// Closes a peer connection dropped mid-negotiation, i.e. when the
/// bootstrap future is cancelled.
struct PendingConnection(Option<Arc<RTCPeerConnection>>);

impl PendingConnection {
    fn new(peer_connection: &Arc<RTCPeerConnection>) -> Self {
        Self(Some(Arc::clone(peer_connection)))
    }

    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        let Some(peer_connection) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match peer_connection.close().await {
                        Ok(()) => debug!("abandoned peer connection closed"),
                        Err(e) => warn!("closing abandoned peer connection failed: {}", e),
                    }
                });
            }
            Err(_) => warn!("no runtime left to close an abandoned peer connection"),
        }
    }
}

fn vp8_capability(clock_rate: u32) -> RTCRtpCodecCapability {
    let feedback = [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")];
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: feedback
            .iter()
            .map(|(typ, parameter)| RTCPFeedback {
                typ: typ.to_string(),
                parameter: parameter.to_string(),
            })
            .collect(),
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}
