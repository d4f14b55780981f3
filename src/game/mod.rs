// The authoritative game server
// Owns the player registry, relays telemetry between peers, measures pings,
// and drives session switches

pub mod batcher;
pub mod player;
pub mod session;

pub use batcher::{CarUpdateBatcher, CarUpdateEntry};
pub use player::Player;
pub use session::{GameMode, GameSession, SessionConfig, SessionSummary};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::OnMessageHdlrFn;

use crate::packets::{CarStyle, HostPacket, PlayerPacket, PlayerPing, TRACK_CHUNK_SIZE};
use crate::peer::PeerSession;
use crate::signaling::messages::JoinInvite;
use crate::signaling::HostEvent;
use crate::track::Track;

const PING_INTERVAL: Duration = Duration::from_secs(1);
const FAN_OUT_INTERVAL: Duration = Duration::from_millis(100);
const KICK_CLOSE_DELAY: Duration = Duration::from_secs(1);

/// One row of the player listing exposed over the control API.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerInfo {
    pub id: u32,
    pub name: String,
    pub time: String,
    pub ping: u32,
}

pub struct GameServer {
    runtime: Handle,
    players: Mutex<Vec<Arc<Player>>>,
    session: Mutex<GameSession>,
    /// Mirror of the session id for per-packet gating without the lock.
    session_id: AtomicU32,
    batcher: CarUpdateBatcher,
}

impl GameServer {
    pub fn new(runtime: Handle, initial: SessionConfig) -> Arc<GameServer> {
        let session = GameSession {
            session_id: 1,
            game_mode: initial.game_mode,
            switching: initial.switching,
            track: initial.track,
            max_players: initial.max_players,
        };

        Arc::new(GameServer {
            runtime,
            players: Mutex::new(Vec::new()),
            session_id: AtomicU32::new(session.session_id),
            batcher: CarUpdateBatcher::new(session.session_id),
            session: Mutex::new(session),
        })
    }

    /// Start the periodic jobs. Each tick catches and logs its own errors so
    /// one bad tick never silences the schedule.
    pub fn start(self: &Arc<Self>) {
        {
            let server = self.clone();
            self.runtime.spawn(async move {
                let mut ticker = tokio::time::interval(PING_INTERVAL);
                loop {
                    ticker.tick().await;
                    server.send_pings().await;
                }
            });
        }
        {
            let server = self.clone();
            self.runtime.spawn(async move {
                let mut ticker = tokio::time::interval(FAN_OUT_INTERVAL);
                loop {
                    ticker.tick().await;
                    server.fan_out_car_states().await;
                }
            });
        }
    }

    /// Consume lifecycle events from the signaling client.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HostEvent::PeerOpened {
                    join,
                    session,
                    client_id,
                } => self.on_player_join(join, session, client_id).await,
                HostEvent::PeerClosed { session_id } => {
                    self.on_player_disconnect(&session_id).await;
                }
            }
        }
    }

    // -- Join / disconnect -------------------------------------------------

    async fn on_player_join(
        self: &Arc<Self>,
        join: JoinInvite,
        session: Arc<PeerSession>,
        client_id: u32,
    ) {
        info!("Creating player {}", join.nickname);

        let car_style = match CarStyle::from_base64(&join.car_style) {
            Ok(style) => style,
            Err(err) => {
                warn!("failed to decode car style for {}: {err}", join.nickname);
                CarStyle::default()
            }
        };

        let player = Arc::new(Player::new(client_id, join, car_style, session));
        self.attach_message_handlers(&player);

        if let Err(err) = self.run_join_sequence(&player).await {
            warn!("join sequence for {} failed: {err:#}", player.nickname);
        }

        self.players.lock().await.push(player);
    }

    /// Reliable-channel welcome, in protocol order: close whatever session
    /// the client thinks it is in, push the track, open the current session,
    /// then exchange presence both ways.
    async fn run_join_sequence(&self, player: &Arc<Player>) -> Result<()> {
        player.send(&PlayerPacket::EndSession).await?;

        let (track, session_id, game_mode, max_players) = {
            let session = self.session.lock().await;
            (
                session.track.clone(),
                session.session_id,
                session.game_mode,
                session.max_players,
            )
        };

        player
            .send(&PlayerPacket::TrackId {
                digest: track.digest(),
            })
            .await?;
        for chunk in track.export.as_bytes().chunks(TRACK_CHUNK_SIZE) {
            player
                .send(&PlayerPacket::TrackChunk {
                    data: chunk.to_vec(),
                })
                .await?;
        }

        player
            .send(&PlayerPacket::NewSession {
                session_id,
                game_mode: game_mode as u8,
                max_players: max_players.min(255) as u8,
            })
            .await?;

        let existing = self.snapshot().await;
        for other in &existing {
            player.send(&other.describe()).await?;
        }

        let update = player.describe();
        for other in &existing {
            if let Err(err) = other.send(&update).await {
                debug!(
                    "failed to announce {} to {}: {err:#}",
                    player.nickname, other.nickname
                );
            }
        }

        Ok(())
    }

    async fn on_player_disconnect(&self, session_id: &str) {
        let removed = {
            let mut players = self.players.lock().await;
            players
                .iter()
                .position(|player| player.session.session_id == session_id)
                .map(|index| players.remove(index))
        };

        let Some(player) = removed else {
            return;
        };
        info!("Removing player {}", player.nickname);

        self.broadcast(&PlayerPacket::RemovePlayer {
            id: player.id,
            is_kicked: false,
        })
        .await;
    }

    // -- Inbound traffic ---------------------------------------------------

    fn attach_message_handlers(self: &Arc<Self>, player: &Arc<Player>) {
        player
            .session
            .reliable
            .on_message(self.message_handler(player));
        player
            .session
            .unreliable
            .on_message(self.message_handler(player));
    }

    fn message_handler(self: &Arc<Self>, player: &Arc<Player>) -> OnMessageHdlrFn {
        let server = self.clone();
        // Weak reference: the handler is stored inside the data channel,
        // which the player owns through its peer session
        let player = Arc::downgrade(player);
        Box::new(move |message: DataChannelMessage| {
            let server = server.clone();
            let player = player.clone();
            Box::pin(async move {
                if let Some(player) = player.upgrade() {
                    server.handle_packet(&player, &message.data).await;
                }
            })
        })
    }

    async fn handle_packet(self: &Arc<Self>, player: &Arc<Player>, data: &[u8]) {
        let packet = match HostPacket::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("bad packet from {}: {err}", player.nickname);
                return;
            }
        };

        match packet {
            HostPacket::Pong { ping_id } => {
                player.resolve_ping(ping_id, Instant::now());
            }
            HostPacket::HostCarUpdate {
                session_id,
                reset_counter,
                state,
            } => {
                if session_id == self.current_session_id() {
                    player.apply_car_update(reset_counter, state);
                }
            }
            HostPacket::HostCarReset {
                session_id,
                reset_counter,
            } => {
                debug!(
                    "car reset from {} (counter {reset_counter})",
                    player.nickname
                );
                if session_id == self.current_session_id() && player.apply_car_reset(reset_counter)
                {
                    self.broadcast_except(
                        player.id,
                        &PlayerPacket::PlayerCarReset {
                            id: player.id,
                            reset_counter,
                        },
                    )
                    .await;
                }
            }
            HostPacket::HostRecord { session_id, frames } => {
                if session_id == self.current_session_id() {
                    player.set_record_frames(frames);
                    self.broadcast_except(player.id, &player.describe()).await;
                }
            }
            HostPacket::HostModCustomMessage { payload } => {
                debug!(
                    "ignoring mod message from {} ({} bytes)",
                    player.nickname,
                    payload.len()
                );
            }
        }
    }

    // -- Periodic jobs -----------------------------------------------------

    async fn send_pings(&self) {
        let players = self.snapshot().await;

        for player in &players {
            let ping_id = player.next_ping_id();
            if let Err(err) = player.send_unreliable(&PlayerPacket::Ping { ping_id }).await {
                debug!("ping to {} failed: {err:#}", player.nickname);
            }
            player.record_ping(ping_id, Instant::now());
        }

        let pings: Vec<PlayerPing> = players
            .iter()
            .map(|player| PlayerPing {
                player_id: player.id,
                ping: player.ping_ms().min(u32::from(u16::MAX)) as u16,
            })
            .collect();

        let packet = PlayerPacket::PingData { host_id: 0, pings };
        for player in &players {
            if let Err(err) = player.send_unreliable(&packet).await {
                debug!("ping table to {} failed: {err:#}", player.nickname);
            }
        }
    }

    /// The 100 ms fan-out tick: drain every queue once, then dispatch each
    /// recipient's batch on its own task so a slow link cannot stall the
    /// others.
    async fn fan_out_car_states(self: &Arc<Self>) {
        let players = self.snapshot().await;

        let drained: Vec<(u32, u32, Vec<_>)> = players
            .iter()
            .map(|player| {
                let (reset_counter, states) = player.drain_car_states();
                (player.id, reset_counter, states)
            })
            .collect();

        for recipient in &players {
            let batch: Vec<CarUpdateEntry> = drained
                .iter()
                .filter(|(id, _, _)| *id != recipient.id)
                .flat_map(|(id, reset_counter, states)| {
                    let (id, reset_counter) = (*id, *reset_counter);
                    states.iter().cloned().map(move |state| CarUpdateEntry {
                        id,
                        reset_counter,
                        state,
                    })
                })
                .collect();

            if batch.is_empty() {
                continue;
            }

            let recipient = recipient.clone();
            let server = self.clone();
            self.runtime.spawn(async move {
                if let Err(err) = server.batcher.send_car_updates(&recipient, &batch).await {
                    warn!(
                        "car update batch for {} dropped: {err:#}",
                        recipient.nickname
                    );
                }
            });
        }
    }

    // -- Control API -------------------------------------------------------

    /// Replace the session. Bumps the id and propagates it to the batcher so
    /// freshly built frames carry the new generation.
    pub async fn update_game_session(&self, config: SessionConfig) -> u32 {
        let mut session = self.session.lock().await;
        session.session_id += 1;
        session.game_mode = config.game_mode;
        session.switching = config.switching;
        session.track = config.track;
        session.max_players = config.max_players;

        self.session_id.store(session.session_id, Ordering::SeqCst);
        self.batcher.set_session(session.session_id);
        session.session_id
    }

    pub async fn set_session(
        &self,
        game_mode: GameMode,
        track: Arc<Track>,
        max_players: u16,
    ) -> u32 {
        self.update_game_session(SessionConfig {
            game_mode,
            switching: true,
            track,
            max_players,
        })
        .await
    }

    pub async fn end_session(&self) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            if session.switching {
                bail!("session already ended");
            }
            session.switching = true;
        }
        info!("Ending session...");
        self.broadcast(&PlayerPacket::EndSession).await;
        Ok(())
    }

    pub async fn start_session(&self) -> Result<()> {
        let (session_id, game_mode, max_players) = {
            let mut session = self.session.lock().await;
            if !session.switching {
                bail!("session already started");
            }
            session.switching = false;
            (session.session_id, session.game_mode, session.max_players)
        };
        info!("Starting session {session_id}");
        self.broadcast(&PlayerPacket::NewSession {
            session_id,
            game_mode: game_mode as u8,
            max_players: max_players.min(255) as u8,
        })
        .await;
        Ok(())
    }

    /// Swap the current track without bumping the session.
    pub async fn set_track(&self, track: Arc<Track>) {
        self.session.lock().await.track = track;
    }

    /// Kick a player: a `Kick` to the target, a kicked `RemovePlayer` to the
    /// whole room (target included, for protocol symmetry), then a deferred
    /// close of the target's peer.
    pub async fn kick(&self, id: u32) -> bool {
        let players = self.snapshot().await;
        let Some(target) = players.iter().find(|player| player.id == id).cloned() else {
            return false;
        };

        info!("Kicked player: {}", target.nickname);
        if let Err(err) = target.send(&PlayerPacket::Kick).await {
            warn!("kick packet to {} failed: {err:#}", target.nickname);
        }

        let remove = PlayerPacket::RemovePlayer { id, is_kicked: true };
        for player in &players {
            if let Err(err) = player.send(&remove).await {
                debug!("remove broadcast to {} failed: {err:#}", player.nickname);
            }
        }

        let session = target.session.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(KICK_CLOSE_DELAY).await;
            session.close().await;
        });

        true
    }

    pub async fn list_players(&self) -> Vec<PlayerInfo> {
        self.snapshot()
            .await
            .iter()
            .map(|player| PlayerInfo {
                id: player.id,
                name: player.nickname.clone(),
                time: match player.record_frames() {
                    Some(frames) => format!("{:.3}s", f64::from(frames) / 1000.0),
                    None => "-".to_string(),
                },
                ping: player.ping_ms(),
            })
            .collect()
    }

    pub async fn session_summary(&self) -> SessionSummary {
        let session = self.session.lock().await;
        SessionSummary {
            session_id: session.session_id,
            game_mode: session.game_mode,
            switching: session.switching,
            max_players: session.max_players,
        }
    }

    pub async fn current_track(&self) -> Arc<Track> {
        self.session.lock().await.track.clone()
    }

    fn current_session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    // -- Helpers -----------------------------------------------------------

    /// Copy of the registry taken under the lock; nothing network-facing
    /// runs while it is held.
    async fn snapshot(&self) -> Vec<Arc<Player>> {
        self.players.lock().await.clone()
    }

    async fn broadcast(&self, packet: &PlayerPacket) {
        for player in self.snapshot().await {
            if let Err(err) = player.send(packet).await {
                debug!("broadcast to {} failed: {err:#}", player.nickname);
            }
        }
    }

    async fn broadcast_except(&self, source: u32, packet: &PlayerPacket) {
        for player in self.snapshot().await {
            if player.id == source {
                continue;
            }
            if let Err(err) = player.send(packet).await {
                debug!("broadcast to {} failed: {err:#}", player.nickname);
            }
        }
    }
}
