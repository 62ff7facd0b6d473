//! Production peer-link binding over the `webrtc` crate.
//!
//! Converts between the wire types in [`crate::protocol`] and the
//! engine's native types at this boundary only. Local tracks are attached
//! as sample tracks; feeding them media samples is the capture backend's
//! concern, not the negotiation core's.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::protocol::{CandidateInit, SdpKind, SessionDescription};

use super::{LinkEvent, LinkFactory, LinkState, LocalStream, MediaError, PeerLink, RemoteTrack, TrackKind};

fn to_engine_error<E: std::fmt::Display>(err: E) -> MediaError {
    MediaError::Engine(err.to_string())
}

fn build_api() -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_engine_error)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(to_engine_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_servers(configs: &[IceServerConfig]) -> Vec<RTCIceServer> {
    configs
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn description_to_engine(desc: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(to_engine_error),
        SdpKind::Answer => {
            RTCSessionDescription::answer(desc.sdp.clone()).map_err(to_engine_error)
        }
    }
}

fn description_from_engine(
    desc: &RTCSessionDescription,
    kind: SdpKind,
) -> SessionDescription {
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn candidate_from_engine(candidate: &RTCIceCandidate) -> Result<CandidateInit, MediaError> {
    let json = candidate.to_json().map_err(to_engine_error)?;
    Ok(CandidateInit {
        sdp_mline_index: json.sdp_mline_index.unwrap_or(0),
        candidate: json.candidate,
    })
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    fn wire_events(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<LinkEvent>) {
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate_from_engine(&candidate) {
                    Ok(init) => {
                        let _ = events.send(LinkEvent::LocalCandidate(init));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "parley::media",
                            error = %err,
                            "dropping undecodable local candidate"
                        );
                    }
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let _ = events.send(LinkEvent::RemoteTrack(RemoteTrack {
                        kind,
                        id: track.id(),
                        stream_id: track.stream_id(),
                    }));
                })
            },
        ));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        Some(LinkState::Failed)
                    }
                    RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = events.send(LinkEvent::StateChanged(state));
                }
            })
        }));
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn attach_tracks(&self, stream: &LocalStream) -> Result<(), MediaError> {
        for track in &stream.tracks {
            let capability = match track.kind {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id.clone(),
                stream.id.clone(),
            ));
            self.pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_engine_error)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(to_engine_error)?;
        Ok(description_from_engine(&offer, SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(to_engine_error)?;
        Ok(description_from_engine(&answer, SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = description_to_engine(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_engine_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = description_to_engine(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_engine_error)
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: None,
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_engine_error)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "parley::media", error = %err, "peer connection close");
        }
    }
}

/// Opens one `RTCPeerConnection` per call attempt, configured with the
/// ICE servers from [`crate::config::Config`].
pub struct RtcLinkFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcLinkFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn open_link(
        &self,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), MediaError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers(&self.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_engine_error)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        RtcPeerLink::wire_events(&pc, events_tx);
        Ok((Arc::new(RtcPeerLink { pc }), events_rx))
    }
}
