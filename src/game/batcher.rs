// Car-update batching
// Telemetry for all other players is packed into one compressed frame per
// fan-out tick; frames that come out too large are halved and retried until
// every piece fits the data-channel budget

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::packets::{CarState, PlayerPacket, MAX_FRAME_SIZE};

use super::player::Player;

/// Compressed payload budget: the frame size minus the 5-byte header
/// (type tag + session id).
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 5;

/// One car state tagged with its owner and reset generation.
#[derive(Debug, Clone)]
pub struct CarUpdateEntry {
    pub id: u32,
    pub reset_counter: u32,
    pub state: CarState,
}

pub struct CarUpdateBatcher {
    session_id: AtomicU32,
}

impl CarUpdateBatcher {
    pub fn new(session_id: u32) -> CarUpdateBatcher {
        CarUpdateBatcher {
            session_id: AtomicU32::new(session_id),
        }
    }

    pub fn set_session(&self, session_id: u32) {
        self.session_id.store(session_id, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// Encode, compress and split a batch into ready-to-send frames. Pure so
    /// the size and ordering invariants are testable without a network.
    pub fn build_packets(&self, entries: &[CarUpdateEntry]) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        if !entries.is_empty() {
            self.pack(entries, &mut packets)?;
        }
        Ok(packets)
    }

    fn pack(&self, entries: &[CarUpdateEntry], out: &mut Vec<Vec<u8>>) -> Result<()> {
        let mut raw = Vec::new();
        for entry in entries {
            raw.extend_from_slice(&entry.id.to_le_bytes());
            raw.extend_from_slice(&entry.reset_counter.to_le_bytes());
            raw.extend_from_slice(&entry.state.encode()?);
        }

        let compressed = deflate(&raw)?;
        if compressed.len() <= MAX_CHUNK_SIZE {
            let packet = PlayerPacket::PlayerCarUpdate {
                session_id: self.session_id(),
                compressed,
            };
            out.push(packet.encode()?);
            return Ok(());
        }

        if entries.len() == 1 {
            bail!(
                "cannot split car update further: single state is {} bytes compressed",
                compressed.len()
            );
        }

        // Size is only known after compression, so halve and retry; the
        // right half takes the ceiling
        let mid = entries.len() / 2;
        self.pack(&entries[..mid], out)?;
        self.pack(&entries[mid..], out)
    }

    pub async fn send_car_updates(
        &self,
        recipient: &Player,
        entries: &[CarUpdateEntry],
    ) -> Result<()> {
        for packet in self.build_packets(entries)? {
            recipient.session.send_unreliable(packet).await?;
        }
        Ok(())
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
