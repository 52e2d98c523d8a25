//! Server-side WebRTC termination. One endpoint faces the host, one faces
//! each viewer; host media is captured once per session and fanned out by
//! writing the remote RTP stream into shared local tracks.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::BrokerError;
use crate::protocol::ServerEvent;
use crate::room::RoomCommand;

pub struct RelayEngine {
    api: API,
    config: RTCConfiguration,
}

impl RelayEngine {
    pub fn new() -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }

    pub async fn new_endpoint(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        Ok(Arc::new(self.api.new_peer_connection(self.config.clone()).await?))
    }
}

/// Create the host-side endpoint for a session. Inbound tracks are mirrored
/// into fresh local tracks and handed to the owning room; each local track is
/// then shared read-only by every viewer endpoint.
pub async fn host_endpoint(
    engine: &RelayEngine,
    room_tx: mpsc::Sender<RoomCommand>,
    outbox: mpsc::Sender<ServerEvent>,
    offer: RTCSessionDescription,
) -> Result<(Arc<RTCPeerConnection>, RTCSessionDescription), BrokerError> {
    let pc = engine.new_endpoint().await?;

    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        log::info!("host endpoint state: {s}");
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |remote, _, _| {
        let room_tx = room_tx.clone();
        Box::pin(async move {
            let codec = remote.codec();
            log::info!("host track received: {}", codec.capability.mime_type);
            let local = Arc::new(TrackLocalStaticRTP::new(
                codec.capability,
                format!("relay-{}", rand::random::<u32>()),
                format!("zeal-{}", rand::random::<u32>()),
            ));
            if room_tx
                .send(RoomCommand::HostTrack {
                    track: Arc::clone(&local),
                })
                .await
                .is_err()
            {
                return;
            }
            tokio::spawn(async move {
                while let Ok((pkt, _)) = remote.read_rtp().await {
                    if local.write_rtp(&pkt).await.is_err() {
                        break;
                    }
                }
                log::info!("host track pump ended");
            });
        })
    }));

    relay_ice(&pc, outbox);

    let sdp = answer(&pc, offer).await?;
    Ok((pc, sdp))
}

/// Create a viewer-side endpoint with the session's captured host track set
/// attached as outbound tracks.
pub async fn viewer_endpoint(
    engine: &RelayEngine,
    tracks: &[Arc<TrackLocalStaticRTP>],
    outbox: mpsc::Sender<ServerEvent>,
    offer: RTCSessionDescription,
) -> Result<(Arc<RTCPeerConnection>, RTCSessionDescription), BrokerError> {
    let pc = engine.new_endpoint().await?;

    for track in tracks {
        let sender = pc
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP must be drained for the interceptors (NACK etc.) to do their work.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });
    }

    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        log::info!("viewer endpoint state: {s}");
        Box::pin(async {})
    }));

    relay_ice(&pc, outbox);

    let sdp = answer(&pc, offer).await?;
    Ok((pc, sdp))
}

/// Forward every locally gathered ICE candidate to the remote participant,
/// point-to-point over its own signaling connection.
fn relay_ice(pc: &Arc<RTCPeerConnection>, outbox: mpsc::Sender<ServerEvent>) {
    pc.on_ice_candidate(Box::new(move |candidate| {
        let outbox = outbox.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = outbox
                            .send(ServerEvent::ServerIceCandidate { candidate: init })
                            .await;
                    }
                    Err(e) => log::warn!("ice candidate serialization failed: {e}"),
                }
            }
        })
    }));
}

async fn answer(
    pc: &Arc<RTCPeerConnection>,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, BrokerError> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    pc.local_description()
        .await
        .ok_or(BrokerError::Signaling("no local description after answer"))
}

pub fn close_endpoint(pc: Arc<RTCPeerConnection>) {
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            log::warn!("peer endpoint close failed: {e}");
        }
    });
}
