// A joined player: identity from the signaling handshake plus the runtime
// state the host tracks on its behalf

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::packets::{CarState, CarStyle, PlayerPacket};
use crate::peer::PeerSession;
use crate::signaling::messages::JoinInvite;

/// Outstanding pings kept per player; older entries are dropped first.
const MAX_PENDING_PINGS: usize = 10;

pub struct Player {
    pub session: Arc<PeerSession>,
    pub id: u32,
    pub nickname: String,
    pub country_code: Option<String>,
    pub mods: Vec<String>,
    pub is_mods_vanilla_compatible: bool,
    pub car_style: CarStyle,

    car: Mutex<CarSync>,
    pings: Mutex<PingTracker>,
    ping_ms: AtomicU32,
    ping_id_counter: AtomicU8,
    record_frames: Mutex<Option<u32>>,
}

impl Player {
    pub fn new(
        id: u32,
        join: JoinInvite,
        car_style: CarStyle,
        session: Arc<PeerSession>,
    ) -> Player {
        Player {
            session,
            id,
            nickname: join.nickname,
            country_code: join.country_code,
            mods: join.mods,
            is_mods_vanilla_compatible: join.is_mods_vanilla_compatible,
            car_style,
            car: Mutex::new(CarSync::new()),
            pings: Mutex::new(PingTracker::new()),
            ping_ms: AtomicU32::new(0),
            ping_id_counter: AtomicU8::new(0),
            record_frames: Mutex::new(None),
        }
    }

    pub async fn send(&self, packet: &PlayerPacket) -> Result<()> {
        self.session.send_reliable(packet.encode()?).await
    }

    pub async fn send_unreliable(&self, packet: &PlayerPacket) -> Result<()> {
        self.session.send_unreliable(packet.encode()?).await
    }

    /// A `PlayerUpdate` describing this player.
    pub fn describe(&self) -> PlayerPacket {
        PlayerPacket::PlayerUpdate {
            id: self.id,
            nickname: self.nickname.clone(),
            country_code: self.country_code.clone(),
            car_style: self.car_style,
            record_frames: self.record_frames(),
        }
    }

    pub fn next_ping_id(&self) -> u8 {
        self.ping_id_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub fn record_ping(&self, ping_id: u8, at: Instant) {
        self.pings.lock().unwrap().record(ping_id, at);
    }

    pub fn resolve_ping(&self, ping_id: u8, now: Instant) {
        if let Some(rtt) = self.pings.lock().unwrap().resolve(ping_id, now) {
            self.ping_ms.store(rtt.as_millis() as u32, Ordering::Relaxed);
        }
    }

    pub fn ping_ms(&self) -> u32 {
        self.ping_ms.load(Ordering::Relaxed)
    }

    pub fn apply_car_update(&self, reset_counter: u32, state: CarState) {
        self.car.lock().unwrap().apply_update(reset_counter, state);
    }

    /// Returns true when the reset advanced the counter and the pending
    /// queue was flushed.
    pub fn apply_car_reset(&self, reset_counter: u32) -> bool {
        self.car.lock().unwrap().apply_reset(reset_counter)
    }

    /// Take everything queued since the last fan-out tick.
    pub fn drain_car_states(&self) -> (u32, Vec<CarState>) {
        self.car.lock().unwrap().drain()
    }

    pub fn set_record_frames(&self, frames: u32) {
        *self.record_frames.lock().unwrap() = Some(frames);
    }

    pub fn record_frames(&self) -> Option<u32> {
        *self.record_frames.lock().unwrap()
    }
}

/// Car telemetry bookkeeping. One lock guards both fields so the queue never
/// holds states from an older reset generation.
struct CarSync {
    reset_counter: u32,
    unsent: Vec<CarState>,
}

impl CarSync {
    fn new() -> CarSync {
        CarSync {
            reset_counter: 0,
            unsent: Vec::new(),
        }
    }

    fn apply_update(&mut self, reset_counter: u32, state: CarState) {
        if reset_counter > self.reset_counter {
            self.reset_counter = reset_counter;
            self.unsent.clear();
        }
        if reset_counter == self.reset_counter {
            self.unsent.push(state);
        }
    }

    fn apply_reset(&mut self, reset_counter: u32) -> bool {
        if reset_counter <= self.reset_counter {
            return false;
        }
        self.reset_counter = reset_counter;
        self.unsent.clear();
        true
    }

    fn drain(&mut self) -> (u32, Vec<CarState>) {
        (self.reset_counter, std::mem::take(&mut self.unsent))
    }
}

/// Round-trip measurement state for one player.
struct PingTracker {
    pending: VecDeque<(u8, Instant)>,
}

impl PingTracker {
    fn new() -> PingTracker {
        PingTracker {
            pending: VecDeque::new(),
        }
    }

    fn record(&mut self, ping_id: u8, at: Instant) {
        self.pending.push_back((ping_id, at));
        if self.pending.len() > MAX_PENDING_PINGS {
            self.pending.pop_front();
        }
    }

    fn resolve(&mut self, ping_id: u8, now: Instant) -> Option<Duration> {
        let index = self
            .pending
            .iter()
            .position(|(pending, _)| *pending == ping_id)?;
        let (_, sent) = self.pending.remove(index)?;
        Some(now.saturating_duration_since(sent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(frames: u32) -> CarState {
        CarState {
            frames,
            ..Default::default()
        }
    }

    #[test]
    fn car_sync_appends_matching_generation() {
        let mut sync = CarSync::new();
        sync.apply_update(0, state(1));
        sync.apply_update(0, state(2));

        let (counter, states) = sync.drain();
        assert_eq!(counter, 0);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].frames, 1);
        assert_eq!(states[1].frames, 2);

        // drained means drained
        assert!(sync.drain().1.is_empty());
    }

    #[test]
    fn car_sync_discards_queue_on_newer_generation() {
        let mut sync = CarSync::new();
        sync.apply_update(0, state(1));
        sync.apply_update(3, state(2));

        let (counter, states) = sync.drain();
        assert_eq!(counter, 3);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].frames, 2);
    }

    #[test]
    fn car_sync_ignores_stale_generation() {
        let mut sync = CarSync::new();
        sync.apply_update(5, state(1));
        sync.apply_update(4, state(2));

        let (counter, states) = sync.drain();
        assert_eq!(counter, 5);
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn car_sync_reset_is_monotonic() {
        let mut sync = CarSync::new();
        sync.apply_update(2, state(1));
        assert!(!sync.apply_reset(2));
        assert!(!sync.apply_reset(1));
        assert_eq!(sync.drain().1.len(), 1);

        sync.apply_update(2, state(2));
        assert!(sync.apply_reset(7));
        let (counter, states) = sync.drain();
        assert_eq!(counter, 7);
        assert!(states.is_empty());
    }

    #[test]
    fn ping_tracker_matches_by_id() {
        let mut tracker = PingTracker::new();
        let base = Instant::now();
        tracker.record(1, base);
        tracker.record(2, base + Duration::from_millis(10));

        let rtt = tracker.resolve(1, base + Duration::from_millis(25)).unwrap();
        assert_eq!(rtt, Duration::from_millis(25));

        // resolved entries are removed
        assert!(tracker.resolve(1, base + Duration::from_secs(1)).is_none());
        assert!(tracker.resolve(2, base + Duration::from_millis(30)).is_some());
    }

    #[test]
    fn ping_tracker_drops_oldest_beyond_capacity() {
        let mut tracker = PingTracker::new();
        let base = Instant::now();
        for id in 0..12u8 {
            tracker.record(id, base);
        }
        assert_eq!(tracker.pending.len(), MAX_PENDING_PINGS);
        assert!(tracker.resolve(0, base).is_none());
        assert!(tracker.resolve(1, base).is_none());
        assert!(tracker.resolve(2, base).is_some());
        assert!(tracker.resolve(11, base).is_some());
    }

    #[test]
    fn unanswered_pings_never_resolve() {
        let mut tracker = PingTracker::new();
        assert!(tracker.resolve(9, Instant::now()).is_none());
    }
}
