// PolyTrack2 track codec
// Decodes the external track string (base62 + zlib, twice), parses the block
// stream, and re-encodes the track data canonically to derive the track ID

pub mod base62;
pub mod store;

pub use store::TrackLibrary;

use std::io::Read;

use flate2::read::ZlibDecoder;
use sha2::{Digest, Sha256};
use thiserror::Error;

const PREFIX: &str = "PolyTrack2";

/// Part ids whose blocks carry a u16 checkpoint order.
const CHECKPOINT_IDS: [u8; 4] = [52, 65, 75, 77];
/// Part ids whose blocks carry a u32 start order.
const START_IDS: [u8; 4] = [5, 91, 92, 93];

fn has_cp_order(id: u8) -> bool {
    CHECKPOINT_IDS.contains(&id)
}

fn has_start_order(id: u8) -> bool {
    START_IDS.contains(&id)
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("track string does not start with {PREFIX:?}")]
    BadPrefix,

    #[error("invalid base62 character {byte:#04x} at position {position}")]
    InvalidBase62 { position: usize, byte: u8 },

    #[error("zlib inflate failed: {0}")]
    Inflate(std::io::Error),

    #[error("inner transport text is not UTF-8")]
    NotUtf8,

    #[error("track data ended while reading {0}")]
    ShortBuffer(&'static str),

    #[error("invalid environment: {0}")]
    BadEnvironment(u8),

    #[error("invalid sun direction: {0}")]
    BadSunDirection(u8),

    #[error("invalid lastModified flag: {0}")]
    BadMetadataFlag(u8),

    #[error("invalid direction: {0}")]
    BadDirection(u8),

    #[error("rotation out of range: {0}")]
    BadRotation(u8),

    #[error("checkpoint part {0} missing checkpoint order")]
    MissingCpOrder(u8),

    #[error("start part {0} missing start order")]
    MissingStartOrder(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Environment {
    Summer = 0,
    Winter = 1,
    Desert = 2,
}

impl Environment {
    fn from_u8(value: u8) -> Result<Environment, TrackError> {
        match value {
            0 => Ok(Environment::Summer),
            1 => Ok(Environment::Winter),
            2 => Ok(Environment::Desert),
            other => Err(TrackError::BadEnvironment(other)),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Summer => write!(f, "Summer"),
            Environment::Winter => write!(f, "Winter"),
            Environment::Desert => write!(f, "Desert"),
        }
    }
}

/// A fully decoded track plus the verbatim export string it came from. The
/// export string is what gets pushed to clients in `TrackChunk` packets; no
/// re-encoding happens on the wire.
#[derive(Debug, Clone)]
pub struct Track {
    pub metadata: TrackMetadata,
    pub info: TrackInfo,
    pub export: String,
    digest: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub name: String,
    pub author: Option<String>,
    /// Unix seconds.
    pub last_modified: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub env: Environment,
    /// Degrees, always below 180.
    pub sun_dir: u8,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub id: u8,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// 2 bits.
    pub rotation: u8,
    /// 3 bits, at most 5.
    pub direction: u8,
    pub color: u8,
    pub cp_order: Option<u16>,
    pub start_order: Option<u32>,
}

impl Track {
    /// Decode the full `"PolyTrack2" || body` external form:
    /// base62 -> zlib -> UTF-8 text -> base62 -> zlib -> parsed payload.
    pub fn decode(input: &str) -> Result<Track, TrackError> {
        let body = input.strip_prefix(PREFIX).ok_or(TrackError::BadPrefix)?;

        let outer = base62::decode(body)?;
        let text = String::from_utf8(inflate(&outer)?).map_err(|_| TrackError::NotUtf8)?;
        let inner = base62::decode(&text)?;
        let payload = inflate(&inner)?;

        let (metadata, info) = parse_payload(&payload)?;
        let digest = info.digest()?;

        Ok(Track {
            metadata,
            info,
            export: input.to_string(),
            digest,
        })
    }

    /// SHA-256 of the canonical track-data encoding, raw bytes.
    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }

    /// The track identifier: the digest as 64 lowercase hex characters.
    pub fn id(&self) -> String {
        self.digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, TrackError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(TrackError::Inflate)?;
    Ok(out)
}

fn parse_payload(buf: &[u8]) -> Result<(TrackMetadata, TrackInfo), TrackError> {
    let mut reader = PayloadReader::new(buf);

    let name_len = reader.u8("name length")? as usize;
    let name = String::from_utf8(reader.take(name_len, "name")?.to_vec())
        .map_err(|_| TrackError::NotUtf8)?;

    let author_len = reader.u8("author length")? as usize;
    let author = if author_len > 0 {
        Some(
            String::from_utf8(reader.take(author_len, "author")?.to_vec())
                .map_err(|_| TrackError::NotUtf8)?,
        )
    } else {
        None
    };

    let last_modified = match reader.u8("lastModified flag")? {
        0 => None,
        1 => Some(reader.u32("lastModified timestamp")?),
        other => return Err(TrackError::BadMetadataFlag(other)),
    };

    let info = parse_track_info(&mut reader)?;

    Ok((
        TrackMetadata {
            name,
            author,
            last_modified,
        },
        info,
    ))
}

fn parse_track_info(reader: &mut PayloadReader<'_>) -> Result<TrackInfo, TrackError> {
    let env = Environment::from_u8(reader.u8("environment")?)?;

    let sun_dir = reader.u8("sun direction")?;
    if sun_dir >= 180 {
        return Err(TrackError::BadSunDirection(sun_dir));
    }

    let min_x = reader.i32("min X")?;
    let min_y = reader.i32("min Y")?;
    let min_z = reader.i32("min Z")?;

    // Each 2-bit field stores the coordinate byte width minus one
    let packed = reader.u8("coordinate widths")?;
    let width_x = (packed & 3) + 1;
    let width_y = ((packed >> 2) & 3) + 1;
    let width_z = ((packed >> 4) & 3) + 1;

    let mut parts = Vec::new();
    while !reader.is_empty() {
        let part_id = reader.u8("part id")?;
        let amount = reader.u32("part amount")?;

        let mut blocks = Vec::with_capacity(amount.min(1 << 16) as usize);
        for _ in 0..amount {
            let x = min_x.wrapping_add(reader.uint("block X", width_x)? as i32);
            let y = min_y.wrapping_add(reader.uint("block Y", width_y)? as i32);
            let z = min_z.wrapping_add(reader.uint("block Z", width_z)? as i32);

            let packed = reader.u8("rotation/direction")?;
            let rotation = packed & 3;
            let direction = (packed >> 2) & 7;
            if direction > 5 {
                return Err(TrackError::BadDirection(direction));
            }

            let color = reader.u8("block color")?;

            let cp_order = if has_cp_order(part_id) {
                Some(reader.u16("checkpoint order")?)
            } else {
                None
            };
            let start_order = if has_start_order(part_id) {
                Some(reader.u32("start order")?)
            } else {
                None
            };

            blocks.push(Block {
                x,
                y,
                z,
                rotation,
                direction,
                color,
                cp_order,
                start_order,
            });
        }

        parts.push(Part {
            id: part_id,
            blocks,
        });
    }

    Ok(TrackInfo {
        env,
        sun_dir,
        parts,
    })
}

impl TrackInfo {
    /// Canonical binary encoding of the track data (metadata excluded).
    /// Bounds and coordinate widths are recomputed from the blocks, so two
    /// decodings of the same track always encode to the same bytes.
    pub fn encode(&self) -> Result<Vec<u8>, TrackError> {
        let mut buf = Vec::new();
        buf.push(self.env as u8);
        buf.push(self.sun_dir);

        let mut min = [0i64; 3];
        let mut max = [0i64; 3];
        let mut has_blocks = false;
        for part in &self.parts {
            for block in &part.blocks {
                let coords = [block.x as i64, block.y as i64, block.z as i64];
                if !has_blocks {
                    min = coords;
                    max = coords;
                    has_blocks = true;
                } else {
                    for axis in 0..3 {
                        min[axis] = min[axis].min(coords[axis]);
                        max[axis] = max[axis].max(coords[axis]);
                    }
                }
            }
        }

        // Smallest width that fits the observed range on each axis
        let widths = [
            coord_width(max[0] - min[0] + 1),
            coord_width(max[1] - min[1] + 1),
            coord_width(max[2] - min[2] + 1),
        ];

        for axis in 0..3 {
            buf.extend_from_slice(&(min[axis] as i32).to_le_bytes());
        }
        buf.push((widths[0] - 1) | ((widths[1] - 1) << 2) | ((widths[2] - 1) << 4));

        for part in &self.parts {
            buf.push(part.id);
            buf.extend_from_slice(&(part.blocks.len() as u32).to_le_bytes());

            for block in &part.blocks {
                let rel = [
                    (block.x as i64 - min[0]) as u32,
                    (block.y as i64 - min[1]) as u32,
                    (block.z as i64 - min[2]) as u32,
                ];
                for axis in 0..3 {
                    let bytes = rel[axis].to_le_bytes();
                    buf.extend_from_slice(&bytes[..widths[axis] as usize]);
                }

                if block.rotation > 3 {
                    return Err(TrackError::BadRotation(block.rotation));
                }
                if block.direction > 5 {
                    return Err(TrackError::BadDirection(block.direction));
                }
                buf.push(block.rotation | (block.direction << 2));
                buf.push(block.color);

                if has_cp_order(part.id) {
                    let order = block.cp_order.ok_or(TrackError::MissingCpOrder(part.id))?;
                    buf.extend_from_slice(&order.to_le_bytes());
                }
                if has_start_order(part.id) {
                    let order = block
                        .start_order
                        .ok_or(TrackError::MissingStartOrder(part.id))?;
                    buf.extend_from_slice(&order.to_le_bytes());
                }
            }
        }

        Ok(buf)
    }

    pub fn digest(&self) -> Result<[u8; 32], TrackError> {
        let encoded = self.encode()?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(&encoded));
        Ok(digest)
    }
}

fn coord_width(range: i64) -> u8 {
    if range <= 0 {
        return 1;
    }
    let bits = 64 - (range as u64).leading_zeros();
    ((bits + 7) / 8).clamp(1, 4) as u8
}

/// Same shape as the packet reader, with track-flavored errors and the
/// variable-width coordinate read.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], TrackError> {
        if self.buf.len() - self.pos < n {
            return Err(TrackError::ShortBuffer(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, TrackError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, TrackError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, TrackError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, TrackError> {
        Ok(self.u32(what)? as i32)
    }

    /// Unsigned little-endian integer in `width` bytes (1..=4).
    fn uint(&mut self, what: &'static str, width: u8) -> Result<u32, TrackError> {
        let bytes = self.take(width as usize, what)?;
        let mut value = 0u32;
        for (i, &byte) in bytes.iter().enumerate() {
            value |= (byte as u32) << (8 * i);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::base62::tests_support::encode as base62_encode;
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn sample_info() -> TrackInfo {
        TrackInfo {
            env: Environment::Winter,
            sun_dir: 90,
            parts: vec![
                Part {
                    id: 1,
                    blocks: vec![
                        Block {
                            x: -4,
                            y: 0,
                            z: 10,
                            rotation: 1,
                            direction: 2,
                            color: 3,
                            cp_order: None,
                            start_order: None,
                        },
                        Block {
                            x: 300,
                            y: 2,
                            z: -1,
                            rotation: 0,
                            direction: 5,
                            color: 0,
                            cp_order: None,
                            start_order: None,
                        },
                    ],
                },
                Part {
                    id: 52,
                    blocks: vec![Block {
                        x: 0,
                        y: 1,
                        z: 0,
                        rotation: 2,
                        direction: 0,
                        color: 7,
                        cp_order: Some(1),
                        start_order: None,
                    }],
                },
                Part {
                    id: 91,
                    blocks: vec![Block {
                        x: 5,
                        y: 0,
                        z: 5,
                        rotation: 3,
                        direction: 1,
                        color: 2,
                        cp_order: None,
                        start_order: Some(42),
                    }],
                },
            ],
        }
    }

    /// Build a full external string the way the client's exporter does:
    /// metadata + track data, deflated, base62'd, deflated again, base62'd.
    fn export_string(name: &str, author: Option<&str>, info: &TrackInfo) -> String {
        let mut payload = Vec::new();
        payload.push(name.len() as u8);
        payload.extend_from_slice(name.as_bytes());
        match author {
            Some(author) => {
                payload.push(author.len() as u8);
                payload.extend_from_slice(author.as_bytes());
            }
            None => payload.push(0),
        }
        payload.push(1);
        payload.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        payload.extend_from_slice(&info.encode().unwrap());

        let inner = base62_encode(&deflate(&payload));
        let outer = base62_encode(&deflate(inner.as_bytes()));
        format!("{PREFIX}{outer}")
    }

    #[test]
    fn full_pipeline_round_trip() {
        let info = sample_info();
        let input = export_string("Loop de loop", Some("kodub"), &info);

        let track = Track::decode(&input).unwrap();
        assert_eq!(track.metadata.name, "Loop de loop");
        assert_eq!(track.metadata.author.as_deref(), Some("kodub"));
        assert_eq!(track.metadata.last_modified, Some(1_700_000_000));
        assert_eq!(track.info, info);
        assert_eq!(track.export, input);
    }

    #[test]
    fn track_id_is_stable_and_ignores_metadata() {
        let info = sample_info();
        let a = Track::decode(&export_string("name one", Some("a"), &info)).unwrap();
        let b = Track::decode(&export_string("name two", None, &info)).unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
        assert_eq!(a.id(), a.id());
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn canonical_encode_round_trips_through_parse() {
        let info = sample_info();
        let encoded = info.encode().unwrap();

        // Wrap in minimal metadata and parse back
        let mut payload = vec![1, b'x', 0, 0];
        payload.extend_from_slice(&encoded);
        let (_, parsed) = parse_payload(&payload).unwrap();
        assert_eq!(parsed, info);

        // Canonical form is a fixed point
        assert_eq!(parsed.encode().unwrap(), encoded);
    }

    #[test]
    fn coord_widths_are_minimal() {
        assert_eq!(coord_width(0), 1);
        assert_eq!(coord_width(1), 1);
        assert_eq!(coord_width(256), 2);
        assert_eq!(coord_width(65_536), 3);
        assert_eq!(coord_width(16_777_216), 4);
        assert_eq!(coord_width(i64::from(u32::MAX) + 1), 4);
    }

    #[test]
    fn wide_coordinates_use_wider_fields() {
        let mut info = sample_info();
        info.parts[0].blocks[1].x = 100_000;
        let encoded = info.encode().unwrap();

        // widths byte follows env + sun + three i32 bounds
        let packed = encoded[14];
        assert_eq!((packed & 3) + 1, 3);
        assert_eq!(((packed >> 2) & 3) + 1, 1);

        let mut payload = vec![0, 0, 0];
        payload.extend_from_slice(&encoded);
        let (_, parsed) = parse_payload(&payload).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(matches!(
            Track::decode("NotATrack"),
            Err(TrackError::BadPrefix)
        ));
    }

    #[test]
    fn rejects_bad_environment_and_sun_direction() {
        let mut payload = vec![0, 0, 0];
        payload.extend_from_slice(&[3, 0]);
        payload.extend_from_slice(&[0; 13]);
        assert!(matches!(
            parse_payload(&payload),
            Err(TrackError::BadEnvironment(3))
        ));

        let mut payload = vec![0, 0, 0];
        payload.extend_from_slice(&[0, 180]);
        payload.extend_from_slice(&[0; 13]);
        assert!(matches!(
            parse_payload(&payload),
            Err(TrackError::BadSunDirection(180))
        ));
    }

    #[test]
    fn rejects_direction_above_five() {
        let mut info = sample_info();
        info.parts[0].blocks[0].direction = 6;
        assert!(matches!(
            info.encode(),
            Err(TrackError::BadDirection(6))
        ));
    }

    #[test]
    fn rejects_truncated_block_stream() {
        let info = sample_info();
        let encoded = info.encode().unwrap();
        let mut payload = vec![0, 0, 0];
        payload.extend_from_slice(&encoded[..encoded.len() - 1]);
        assert!(matches!(
            parse_payload(&payload),
            Err(TrackError::ShortBuffer(_))
        ));
    }

    #[test]
    fn rejects_bad_metadata_flag() {
        let payload = vec![1, b'x', 0, 9];
        assert!(matches!(
            parse_payload(&payload),
            Err(TrackError::BadMetadataFlag(9))
        ));
    }

    #[test]
    fn author_is_optional() {
        let info = TrackInfo {
            env: Environment::Summer,
            sun_dir: 0,
            parts: vec![],
        };
        let mut payload = vec![2, b'h', b'i', 0, 0];
        payload.extend_from_slice(&info.encode().unwrap());
        let (metadata, _) = parse_payload(&payload).unwrap();
        assert_eq!(metadata.name, "hi");
        assert_eq!(metadata.author, None);
        assert_eq!(metadata.last_modified, None);
    }
}
