// Persistent link to the invite broker
// One WebSocket carries invite management and WebRTC negotiation for every
// joining client; peer connections themselves outlive this link

pub mod messages;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::BrokerConfig;
use crate::peer::{CandidateCallback, CloseCallback, PeerSession};
use messages::{BrokerFrame, HostFrame, IceServerEntry, JoinInvite};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Lifecycle notifications handed to the game layer.
pub enum HostEvent {
    /// A client's reliable channel opened; it is ready to become a player.
    PeerOpened {
        join: JoinInvite,
        session: Arc<PeerSession>,
        client_id: u32,
    },
    /// A peer connection reached a terminal state.
    PeerClosed { session_id: String },
}

pub struct SignalingClient {
    broker: BrokerConfig,
    mods: Vec<String>,
    accept_vanilla_clients: bool,
    ice_urls: Vec<String>,
    /// Serializes every outbound frame; replaced wholesale on reconnect.
    sink: Mutex<Option<WsSink>>,
    invite: Mutex<Option<String>>,
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
    client_count: AtomicU32,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl SignalingClient {
    /// Fetches the ICE server list once; everything else is lazy.
    pub async fn new(
        broker: BrokerConfig,
        mods: Vec<String>,
        accept_vanilla_clients: bool,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Arc<SignalingClient>> {
        let servers: Vec<IceServerEntry> = reqwest::get(&broker.ice_fetch_url)
            .await
            .context("failed to fetch ICE servers")?
            .error_for_status()
            .context("ICE server endpoint returned an error")?
            .json()
            .await
            .context("invalid ICE server response")?;

        let ice_urls: Vec<String> = servers.into_iter().map(|entry| entry.urls).collect();
        info!("Got {} ICE URLs", ice_urls.len());

        Ok(Arc::new(SignalingClient {
            broker,
            mods,
            accept_vanilla_clients,
            ice_urls,
            sink: Mutex::new(None),
            invite: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            client_count: AtomicU32::new(1),
            events,
        }))
    }

    /// Dial the broker and start the read loop.
    ///
    /// Returns a boxed future: `connect` -> `reconnect` -> `connect` forms a
    /// recursive async cycle (via the spawned read loop), which the compiler
    /// can only size when one link in the cycle is boxed.
    pub fn connect(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let (stream, _) = connect_async(self.broker.websocket_url.as_str())
                .await
                .with_context(|| format!("failed to connect to {}", self.broker.websocket_url))?;
            info!("Connected to broker");

            let (sink, read) = stream.split();
            *self.sink.lock().await = Some(sink);

            let client = self.clone();
            tokio::spawn(async move {
                client.read_loop(read).await;
            });

            Ok(())
        })
    }

    pub async fn create_invite(&self) -> Result<()> {
        self.send_frame(&HostFrame::CreateInvite {
            version: self.broker.version.clone(),
        })
        .await
    }

    pub async fn current_invite(&self) -> Option<String> {
        self.invite.lock().await.clone()
    }

    async fn read_loop(self: Arc<Self>, mut read: WsStream) {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => self.route(&text).await,
                Some(Ok(Message::Close(_))) | None => {
                    warn!("signaling link closed by broker");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("signaling read error: {err}");
                    break;
                }
            }
        }

        // The invite dies with the link, but in-flight peer sessions run on
        // their own connections and survive the re-dial.
        self.reconnect().await;
    }

    async fn reconnect(self: &Arc<Self>) {
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match self.connect().await {
                Ok(()) => {
                    if let Err(err) = self.create_invite().await {
                        warn!("failed to replay createInvite: {err:#}");
                        continue;
                    }
                    info!("signaling link re-established");
                    return;
                }
                Err(err) => warn!("signaling reconnect failed: {err:#}"),
            }
        }
    }

    async fn route(self: &Arc<Self>, text: &str) {
        let frame: BrokerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("invalid signaling frame: {err}");
                return;
            }
        };

        match frame {
            BrokerFrame::CreateInvite { invite_code, .. } => {
                info!("Invite code: {invite_code}");
                *self.invite.lock().await = Some(invite_code);
            }
            BrokerFrame::JoinInvite(join) => {
                if let Err(err) = self.handle_join(join).await {
                    warn!("failed to accept join: {err:#}");
                }
            }
            BrokerFrame::IceCandidate { session, candidate } => {
                self.handle_remote_candidate(&session, candidate).await;
            }
        }
    }

    async fn handle_join(self: &Arc<Self>, join: JoinInvite) -> Result<()> {
        info!("User is joining: {}", join.nickname);

        let client_id = self.client_count.fetch_add(1, Ordering::SeqCst);
        let session_key = join.session.clone();

        let on_candidate: CandidateCallback = {
            let client = Arc::downgrade(self);
            let session = session_key.clone();
            Box::new(move |candidate| {
                let client = client.clone();
                let session = session.clone();
                Box::pin(async move {
                    if let Some(client) = client.upgrade() {
                        if let Err(err) = client.forward_candidate(&session, candidate).await {
                            warn!("failed to forward ICE candidate: {err:#}");
                        }
                    }
                })
            })
        };

        let on_close: CloseCallback = {
            let client = Arc::downgrade(self);
            Box::new(move |session_id| {
                let client = client.clone();
                Box::pin(async move {
                    if let Some(client) = client.upgrade() {
                        client.deregister(&session_id).await;
                    }
                })
            })
        };

        let (session, answer) = PeerSession::new(
            join.session.clone(),
            join.offer.clone(),
            self.ice_urls.clone(),
            on_candidate,
            on_close,
        )
        .await
        .context("failed to create peer session")?;

        self.sessions
            .lock()
            .await
            .insert(session_key.clone(), session.clone());

        // Hand the player to the game layer once its reliable channel opens
        {
            let events = self.events.clone();
            let join = join.clone();
            let weak_session = Arc::downgrade(&session);
            session.reliable.on_open(Box::new(move || {
                let events = events.clone();
                let join = join.clone();
                let weak_session = weak_session.clone();
                Box::pin(async move {
                    if let Some(session) = weak_session.upgrade() {
                        let _ = events.send(HostEvent::PeerOpened {
                            join,
                            session,
                            client_id,
                        });
                    }
                })
            }));
        }

        info!("Created session: {session_key}");
        self.send_frame(&HostFrame::AcceptJoin {
            version: self.broker.version.clone(),
            session: join.session,
            is_mods_vanilla_compatible: self.accept_vanilla_clients,
            mods: self.mods.clone(),
            client_id,
            answer,
        })
        .await
    }

    async fn handle_remote_candidate(&self, session_id: &str, candidate: RTCIceCandidateInit) {
        let session = self.sessions.lock().await.get(session_id).cloned();
        match session {
            Some(session) => {
                if let Err(err) = session.add_ice_candidate(candidate).await {
                    warn!("failed to add ICE candidate: {err:#}");
                }
            }
            None => warn!("ICE candidate for unknown session {session_id}"),
        }
    }

    async fn forward_candidate(
        &self,
        session_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        self.send_frame(&HostFrame::IceCandidate {
            version: self.broker.version.clone(),
            session: session_id.to_string(),
            candidate,
        })
        .await
    }

    async fn deregister(&self, session_id: &str) {
        let removed = self.sessions.lock().await.remove(session_id);
        if removed.is_some() {
            info!("Removing {session_id} from sessions");
            let _ = self.events.send(HostEvent::PeerClosed {
                session_id: session_id.to_string(),
            });
        }
    }

    async fn send_frame(&self, frame: &HostFrame) -> Result<()> {
        let text = serde_json::to_string(frame).context("failed to serialize frame")?;
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().context("not connected to broker")?;
        sink.send(Message::Text(text))
            .await
            .context("signaling send failed")?;
        Ok(())
    }
}
