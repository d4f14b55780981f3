// Wire packet definitions for the host <-> player protocol
// Every packet starts with a one-byte type tag; all integers are little-endian

pub mod car;

pub use car::{CarState, CarStyle, Controls, Quaternion, Vector3, WheelContact};

use thiserror::Error;

/// Largest data-channel frame the client accepts. Track chunks and car-update
/// batches are both bounded by this.
pub const MAX_FRAME_SIZE: usize = 16384;

/// Track chunks leave one byte for the packet type tag.
pub const TRACK_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 1;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short while reading {0}")]
    ShortBuffer(&'static str),

    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    #[error("number of collision impulses exceeds maximum allowed: {0}")]
    TooManyImpulses(u8),

    #[error("invalid car style header: {0}")]
    BadCarStyleHeader(u8),

    #[error("car style data too short: {0} bytes")]
    CarStyleTooShort(usize),

    #[error("failed to decode car style base64: {0}")]
    CarStyleBase64(#[from] base64::DecodeError),

    #[error("nickname too long: {0} bytes")]
    NicknameTooLong(usize),

    #[error("country code contains non-ASCII character")]
    NonAsciiCountryCode,
}

/// Tags for packets the host sends to players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayerPacketType {
    PlayerUpdate = 0,
    RemovePlayer = 1,
    PlayerCarReset = 2,
    PlayerCarUpdate = 3,
    Kick = 4,
    TrackId = 5,
    TrackChunk = 6,
    EndSession = 7,
    NewSession = 8,
    Ping = 9,
    PingData = 10,
    PlayerModCustomMessage = 11,
}

/// Tags for packets the host receives from players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostPacketType {
    HostCarReset = 0,
    HostCarUpdate = 1,
    HostRecord = 2,
    Pong = 3,
    HostModCustomMessage = 4,
}

/// One (player id, ping) row of a `PingData` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerPing {
    pub player_id: u32,
    /// Round-trip in ms; 0 is transmitted as 65535 meaning "unknown".
    pub ping: u16,
}

/// Packets sent from the host to players.
#[derive(Debug, Clone)]
pub enum PlayerPacket {
    PlayerUpdate {
        id: u32,
        nickname: String,
        country_code: Option<String>,
        car_style: CarStyle,
        record_frames: Option<u32>,
    },
    RemovePlayer {
        id: u32,
        is_kicked: bool,
    },
    PlayerCarReset {
        id: u32,
        reset_counter: u32,
    },
    /// Pre-compressed batch built by the car-update batcher.
    PlayerCarUpdate {
        session_id: u32,
        compressed: Vec<u8>,
    },
    Kick,
    TrackId {
        digest: [u8; 32],
    },
    TrackChunk {
        data: Vec<u8>,
    },
    EndSession,
    NewSession {
        session_id: u32,
        game_mode: u8,
        max_players: u8,
    },
    Ping {
        ping_id: u8,
    },
    PingData {
        host_id: u32,
        pings: Vec<PlayerPing>,
    },
    PlayerModCustomMessage {
        payload: Vec<u8>,
    },
}

/// Packets received by the host from players.
#[derive(Debug, Clone)]
pub enum HostPacket {
    HostCarReset {
        session_id: u32,
        reset_counter: u32,
    },
    HostCarUpdate {
        session_id: u32,
        reset_counter: u32,
        state: CarState,
    },
    HostRecord {
        session_id: u32,
        frames: u32,
    },
    Pong {
        ping_id: u8,
    },
    HostModCustomMessage {
        payload: Vec<u8>,
    },
}

impl PlayerPacket {
    pub fn tag(&self) -> PlayerPacketType {
        match self {
            PlayerPacket::PlayerUpdate { .. } => PlayerPacketType::PlayerUpdate,
            PlayerPacket::RemovePlayer { .. } => PlayerPacketType::RemovePlayer,
            PlayerPacket::PlayerCarReset { .. } => PlayerPacketType::PlayerCarReset,
            PlayerPacket::PlayerCarUpdate { .. } => PlayerPacketType::PlayerCarUpdate,
            PlayerPacket::Kick => PlayerPacketType::Kick,
            PlayerPacket::TrackId { .. } => PlayerPacketType::TrackId,
            PlayerPacket::TrackChunk { .. } => PlayerPacketType::TrackChunk,
            PlayerPacket::EndSession => PlayerPacketType::EndSession,
            PlayerPacket::NewSession { .. } => PlayerPacketType::NewSession,
            PlayerPacket::Ping { .. } => PlayerPacketType::Ping,
            PlayerPacket::PingData { .. } => PlayerPacketType::PingData,
            PlayerPacket::PlayerModCustomMessage { .. } => {
                PlayerPacketType::PlayerModCustomMessage
            }
        }
    }

    /// Serialize to the wire form. Layouts must stay bit-exact with the
    /// client; see the per-variant comments.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![self.tag() as u8];

        match self {
            // type . id:u32 . nameLen:u8 . name . countryCode C-string
            // . carStyle:16B . framesFlag:u8 . (frames:3B)
            PlayerPacket::PlayerUpdate {
                id,
                nickname,
                country_code,
                car_style,
                record_frames,
            } => {
                buf.extend_from_slice(&id.to_le_bytes());

                let name = nickname.as_bytes();
                if name.len() > 255 {
                    return Err(PacketError::NicknameTooLong(name.len()));
                }
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);

                if let Some(code) = country_code {
                    if !code.is_ascii() {
                        return Err(PacketError::NonAsciiCountryCode);
                    }
                    buf.extend_from_slice(code.as_bytes());
                }
                buf.push(0);

                buf.extend_from_slice(&car_style.encode());

                match record_frames {
                    None => buf.push(0),
                    Some(frames) => {
                        buf.push(1);
                        push_u24(&mut buf, *frames);
                    }
                }
            }
            PlayerPacket::RemovePlayer { id, is_kicked } => {
                buf.extend_from_slice(&id.to_le_bytes());
                buf.push(u8::from(*is_kicked));
            }
            PlayerPacket::PlayerCarReset { id, reset_counter } => {
                buf.extend_from_slice(&id.to_le_bytes());
                buf.extend_from_slice(&reset_counter.to_le_bytes());
            }
            PlayerPacket::PlayerCarUpdate {
                session_id,
                compressed,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.extend_from_slice(compressed);
            }
            PlayerPacket::Kick | PlayerPacket::EndSession => {}
            PlayerPacket::TrackId { digest } => {
                buf.extend_from_slice(digest);
            }
            PlayerPacket::TrackChunk { data } => {
                buf.extend_from_slice(data);
            }
            PlayerPacket::NewSession {
                session_id,
                game_mode,
                max_players,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.push(*game_mode);
                buf.push(*max_players);
            }
            PlayerPacket::Ping { ping_id } => {
                buf.push(*ping_id);
            }
            // type . hostId:u32 . pad:u16 . (playerId:u32 . ping:u16)*
            PlayerPacket::PingData { host_id, pings } => {
                buf.extend_from_slice(&host_id.to_le_bytes());
                buf.extend_from_slice(&[0, 0]);
                for entry in pings {
                    buf.extend_from_slice(&entry.player_id.to_le_bytes());
                    let ping = if entry.ping == 0 { 65535 } else { entry.ping };
                    buf.extend_from_slice(&ping.to_le_bytes());
                }
            }
            PlayerPacket::PlayerModCustomMessage { payload } => {
                buf.extend_from_slice(payload);
            }
        }

        Ok(buf)
    }
}

impl HostPacket {
    /// Parse an inbound frame. Rejects undersized or malformed frames; the
    /// caller keeps the connection open and logs the error.
    pub fn decode(data: &[u8]) -> Result<HostPacket, PacketError> {
        let mut reader = Reader::new(data);
        let tag = reader.u8("packet type")?;

        match tag {
            t if t == HostPacketType::HostCarReset as u8 => Ok(HostPacket::HostCarReset {
                session_id: reader.u32("session id")?,
                reset_counter: reader.u32("reset counter")?,
            }),
            t if t == HostPacketType::HostCarUpdate as u8 => {
                let session_id = reader.u32("session id")?;
                let reset_counter = reader.u32("reset counter")?;
                let state = CarState::decode(reader.rest())?;
                Ok(HostPacket::HostCarUpdate {
                    session_id,
                    reset_counter,
                    state,
                })
            }
            t if t == HostPacketType::HostRecord as u8 => Ok(HostPacket::HostRecord {
                session_id: reader.u32("session id")?,
                frames: reader.u24("frame count")?,
            }),
            t if t == HostPacketType::Pong as u8 => Ok(HostPacket::Pong {
                ping_id: reader.u8("ping id")?,
            }),
            t if t == HostPacketType::HostModCustomMessage as u8 => {
                Ok(HostPacket::HostModCustomMessage {
                    payload: reader.rest().to_vec(),
                })
            }
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

pub(crate) fn push_u24(buf: &mut Vec<u8>, value: u32) {
    let bytes = value.to_le_bytes();
    buf.extend_from_slice(&bytes[..3]);
}

/// Little-endian cursor over an inbound frame. Every read names the field it
/// was after so short-buffer errors point at the boundary that was violated.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], PacketError> {
        if self.buf.len() - self.pos < n {
            return Err(PacketError::ShortBuffer(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, PacketError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, PacketError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u24(&mut self, what: &'static str) -> Result<u32, PacketError> {
        let bytes = self.take(3, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, PacketError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn f32(&mut self, what: &'static str) -> Result<f32, PacketError> {
        Ok(f32::from_bits(self.u32(what)?))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_update_layout() {
        let packet = PlayerPacket::PlayerUpdate {
            id: 7,
            nickname: "ace".to_string(),
            country_code: Some("DE".to_string()),
            car_style: CarStyle::default(),
            record_frames: Some(0x0102_03),
        };
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes[0], PlayerPacketType::PlayerUpdate as u8);
        assert_eq!(&bytes[1..5], &7u32.to_le_bytes());
        assert_eq!(bytes[5], 3);
        assert_eq!(&bytes[6..9], b"ace");
        assert_eq!(&bytes[9..12], b"DE\0");
        // 16 bytes of car style follow the country code
        assert_eq!(bytes[12], 0);
        // frames flag + 24-bit frame count
        assert_eq!(bytes[28], 1);
        assert_eq!(&bytes[29..32], &[0x03, 0x02, 0x01]);
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn player_update_without_optionals() {
        let packet = PlayerPacket::PlayerUpdate {
            id: 1,
            nickname: "x".to_string(),
            country_code: None,
            car_style: CarStyle::default(),
            record_frames: None,
        };
        let bytes = packet.encode().unwrap();
        // absent country code is a single terminator byte
        assert_eq!(bytes[7], 0);
        // absent frames is a single flag byte
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(bytes.len(), 1 + 4 + 1 + 1 + 1 + 16 + 1);
    }

    #[test]
    fn nickname_over_255_bytes_is_rejected() {
        let packet = PlayerPacket::PlayerUpdate {
            id: 1,
            nickname: "n".repeat(256),
            country_code: None,
            car_style: CarStyle::default(),
            record_frames: None,
        };
        assert!(matches!(
            packet.encode(),
            Err(PacketError::NicknameTooLong(256))
        ));
    }

    #[test]
    fn ping_data_substitutes_unknown_ping() {
        let packet = PlayerPacket::PingData {
            host_id: 0,
            pings: vec![
                PlayerPing {
                    player_id: 1,
                    ping: 42,
                },
                PlayerPing {
                    player_id: 2,
                    ping: 0,
                },
            ],
        };
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes[0], PlayerPacketType::PingData as u8);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
        assert_eq!(&bytes[5..7], &[0, 0]);
        assert_eq!(&bytes[7..11], &1u32.to_le_bytes());
        assert_eq!(&bytes[11..13], &42u16.to_le_bytes());
        assert_eq!(&bytes[13..17], &2u32.to_le_bytes());
        assert_eq!(&bytes[17..19], &65535u16.to_le_bytes());
    }

    #[test]
    fn new_session_layout() {
        let packet = PlayerPacket::NewSession {
            session_id: 0xAABBCCDD,
            game_mode: 1,
            max_players: 200,
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes, vec![8, 0xDD, 0xCC, 0xBB, 0xAA, 1, 200]);
    }

    #[test]
    fn bare_packets_are_one_byte() {
        assert_eq!(PlayerPacket::Kick.encode().unwrap(), vec![4]);
        assert_eq!(PlayerPacket::EndSession.encode().unwrap(), vec![7]);
    }

    #[test]
    fn decode_pong() {
        let packet = HostPacket::decode(&[3, 9]).unwrap();
        assert!(matches!(packet, HostPacket::Pong { ping_id: 9 }));
    }

    #[test]
    fn decode_host_record_uses_three_byte_frames() {
        let mut frame = vec![2];
        frame.extend_from_slice(&5u32.to_le_bytes());
        frame.extend_from_slice(&[0x10, 0x20, 0x30]);
        let packet = HostPacket::decode(&frame).unwrap();
        match packet {
            HostPacket::HostRecord { session_id, frames } => {
                assert_eq!(session_id, 5);
                assert_eq!(frames, 0x302010);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(matches!(
            HostPacket::decode(&[3]),
            Err(PacketError::ShortBuffer(_))
        ));
        assert!(matches!(
            HostPacket::decode(&[0, 1, 2]),
            Err(PacketError::ShortBuffer(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(matches!(
            HostPacket::decode(&[200]),
            Err(PacketError::UnknownType(200))
        ));
    }

    #[test]
    fn decode_host_car_update_round_trips_state() {
        let state = car::tests_support::sample_state();
        let mut frame = vec![1];
        frame.extend_from_slice(&3u32.to_le_bytes());
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&state.encode().unwrap());

        match HostPacket::decode(&frame).unwrap() {
            HostPacket::HostCarUpdate {
                session_id,
                reset_counter,
                state: decoded,
            } => {
                assert_eq!(session_id, 3);
                assert_eq!(reset_counter, 8);
                assert_eq!(decoded, state);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
