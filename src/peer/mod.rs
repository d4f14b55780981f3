// One WebRTC peer connection per joined client
// Carries exactly two pre-negotiated data channels: a reliable one for
// lifecycle traffic and an unreliable one for telemetry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Invoked with every locally gathered ICE candidate, for out-of-band
/// delivery through the signaling link (trickle ICE).
pub type CandidateCallback =
    Box<dyn Fn(RTCIceCandidateInit) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked exactly once when the connection reaches a terminal state.
pub type CloseCallback = Box<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct PeerSession {
    /// The broker's session string for this client.
    pub session_id: String,
    pub peer: Arc<RTCPeerConnection>,
    pub reliable: Arc<RTCDataChannel>,
    pub unreliable: Arc<RTCDataChannel>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Answer the client's offer. Both data channels are created before the
    /// answer so their m-lines appear in the local SDP; the returned string
    /// is the answer SDP for the broker to relay back.
    pub async fn new(
        session_id: String,
        offer_sdp: String,
        ice_urls: Vec<String>,
        on_candidate: CandidateCallback,
        on_close: CloseCallback,
    ) -> Result<(Arc<PeerSession>, String)> {
        let api = APIBuilder::new()
            .with_media_engine(MediaEngine::default())
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_urls,
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer = Arc::new(api.new_peer_connection(config).await?);

        let offer = RTCSessionDescription::offer(offer_sdp)?;
        peer.set_remote_description(offer).await?;

        let reliable = peer
            .create_data_channel(
                "reliable",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    negotiated: Some(0),
                    ..Default::default()
                }),
            )
            .await?;
        let unreliable = peer
            .create_data_channel(
                "unreliable",
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    negotiated: Some(1),
                    ..Default::default()
                }),
            )
            .await?;

        let answer = peer.create_answer(None).await?;
        peer.set_local_description(answer.clone()).await?;

        let session = Arc::new(PeerSession {
            session_id,
            peer: peer.clone(),
            reliable,
            unreliable,
            closed: AtomicBool::new(false),
        });

        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let forwarded = candidate
                .and_then(|candidate| candidate.to_json().ok())
                .map(|init| (on_candidate)(init));
            Box::pin(async move {
                if let Some(forwarded) = forwarded {
                    forwarded.await;
                }
            })
        }));

        peer.on_peer_connection_state_change({
            // Weak reference: the handler lives inside the peer connection,
            // which the session owns
            let session = Arc::downgrade(&session);
            Box::new(move |state: RTCPeerConnectionState| {
                debug!("peer connection state: {state}");
                let mut teardown = None;
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    if let Some(session) = session.upgrade() {
                        if !session.closed.swap(true, Ordering::SeqCst) {
                            let notify = (on_close)(session.session_id.clone());
                            teardown = Some((session, notify));
                        }
                    }
                }
                Box::pin(async move {
                    if let Some((session, notify)) = teardown {
                        if let Err(err) = session.peer.close().await {
                            debug!("closing failed peer: {err}");
                        }
                        notify.await;
                    }
                })
            })
        });

        Ok((session, answer.sdp))
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer
            .add_ice_candidate(candidate)
            .await
            .context("failed to add ICE candidate")
    }

    pub async fn send_reliable(&self, data: Vec<u8>) -> Result<()> {
        self.reliable
            .send(&data.into())
            .await
            .context("reliable channel send failed")?;
        Ok(())
    }

    pub async fn send_unreliable(&self, data: Vec<u8>) -> Result<()> {
        self.unreliable
            .send(&data.into())
            .await
            .context("unreliable channel send failed")?;
        Ok(())
    }

    /// Close the underlying connection. The resulting state change drives
    /// the usual disconnect path, so no bookkeeping happens here.
    pub async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            warn!("failed to close peer {}: {err}", self.session_id);
        }
    }
}
