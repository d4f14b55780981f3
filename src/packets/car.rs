// Car telemetry and car style blobs
// The car state layout mirrors what the client's physics loop emits; the
// presence flags at the head declare which optional sub-records follow

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use super::{push_u24, PacketError, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelContact {
    pub position: Vector3,
    pub normal: Vector3,
}

/// Control inputs held by the player, packed into the trailing flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Controls {
    pub up: bool,
    pub right: bool,
    pub down: bool,
    pub left: bool,
    pub reset: bool,
}

/// One physics snapshot of a car, as received in `HostCarUpdate` and fanned
/// back out inside `PlayerCarUpdate` batches.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CarState {
    /// Frame index, 24 bits on the wire.
    pub frames: u32,
    pub speed_kmh: f32,
    pub has_started: bool,
    /// Frame the car crossed the finish line, 24 bits when present.
    pub finish_frames: Option<u32>,
    pub next_checkpoint_index: u16,
    pub has_checkpoint_to_respawn_at: bool,
    pub position: Vector3,
    pub quaternion: Quaternion,
    /// At most four entries.
    pub collision_impulses: Vec<f32>,
    pub wheel_contact: [Option<WheelContact>; 4],
    pub wheel_suspension_length: [f32; 4],
    pub wheel_suspension_velocity: [f32; 4],
    pub wheel_delta_rotation: [f32; 4],
    pub wheel_skid_info: [f32; 4],
    pub steering: f32,
    pub brake_light_enabled: bool,
    pub controls: Controls,
}

const MAX_COLLISION_IMPULSES: usize = 4;

impl CarState {
    pub fn decode(data: &[u8]) -> Result<CarState, PacketError> {
        let mut reader = Reader::new(data);

        let frames = reader.u24("car state frames")?;
        let speed_kmh = reader.f32("car state speed")?;

        let flags = reader.u8("car state flags")?;
        let has_started = flags & 1 != 0;
        let has_finish_frames = flags & 2 != 0;
        let has_checkpoint_to_respawn_at = flags & 4 != 0;
        let wheel_contact_flags = [
            flags & 8 != 0,
            flags & 16 != 0,
            flags & 32 != 0,
            flags & 64 != 0,
        ];

        let finish_frames = if has_finish_frames {
            Some(reader.u24("finish frames")?)
        } else {
            None
        };

        let next_checkpoint_index = reader.u16("next checkpoint index")?;

        let position = read_vector3(&mut reader, "position")?;
        let quaternion = Quaternion {
            x: reader.f32("quaternion")?,
            y: reader.f32("quaternion")?,
            z: reader.f32("quaternion")?,
            w: reader.f32("quaternion")?,
        };

        let num_impulses = reader.u8("impulse count")?;
        if num_impulses as usize > MAX_COLLISION_IMPULSES {
            return Err(PacketError::TooManyImpulses(num_impulses));
        }
        let mut collision_impulses = Vec::with_capacity(num_impulses as usize);
        for _ in 0..num_impulses {
            collision_impulses.push(reader.f32("collision impulse")?);
        }

        let mut wheel_contact = [None; 4];
        for (slot, present) in wheel_contact.iter_mut().zip(wheel_contact_flags) {
            if present {
                *slot = Some(WheelContact {
                    position: read_vector3(&mut reader, "wheel contact position")?,
                    normal: read_vector3(&mut reader, "wheel contact normal")?,
                });
            }
        }

        let wheel_suspension_length = read_f32x4(&mut reader, "wheel suspension length")?;
        let wheel_suspension_velocity = read_f32x4(&mut reader, "wheel suspension velocity")?;
        let wheel_delta_rotation = read_f32x4(&mut reader, "wheel delta rotation")?;
        let wheel_skid_info = read_f32x4(&mut reader, "wheel skid info")?;

        let steering = reader.f32("steering")?;

        let final_flags = reader.u8("control flags")?;
        let controls = Controls {
            up: final_flags & 1 != 0,
            right: final_flags & 2 != 0,
            down: final_flags & 4 != 0,
            left: final_flags & 8 != 0,
            reset: final_flags & 16 != 0,
        };
        let brake_light_enabled = final_flags & 32 != 0;

        Ok(CarState {
            frames,
            speed_kmh,
            has_started,
            finish_frames,
            next_checkpoint_index,
            has_checkpoint_to_respawn_at,
            position,
            quaternion,
            collision_impulses,
            wheel_contact,
            wheel_suspension_length,
            wheel_suspension_velocity,
            wheel_delta_rotation,
            wheel_skid_info,
            steering,
            brake_light_enabled,
            controls,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.collision_impulses.len() > MAX_COLLISION_IMPULSES {
            return Err(PacketError::TooManyImpulses(
                self.collision_impulses.len() as u8,
            ));
        }

        let mut buf = Vec::with_capacity(self.encoded_size());

        push_u24(&mut buf, self.frames);
        buf.extend_from_slice(&self.speed_kmh.to_le_bytes());

        let mut flags = 0u8;
        if self.has_started {
            flags |= 1;
        }
        if self.finish_frames.is_some() {
            flags |= 2;
        }
        if self.has_checkpoint_to_respawn_at {
            flags |= 4;
        }
        for (i, contact) in self.wheel_contact.iter().enumerate() {
            if contact.is_some() {
                flags |= 1 << (3 + i);
            }
        }
        buf.push(flags);

        if let Some(frames) = self.finish_frames {
            push_u24(&mut buf, frames);
        }

        buf.extend_from_slice(&self.next_checkpoint_index.to_le_bytes());

        push_vector3(&mut buf, &self.position);
        buf.extend_from_slice(&self.quaternion.x.to_le_bytes());
        buf.extend_from_slice(&self.quaternion.y.to_le_bytes());
        buf.extend_from_slice(&self.quaternion.z.to_le_bytes());
        buf.extend_from_slice(&self.quaternion.w.to_le_bytes());

        buf.push(self.collision_impulses.len() as u8);
        for impulse in &self.collision_impulses {
            buf.extend_from_slice(&impulse.to_le_bytes());
        }

        for contact in self.wheel_contact.iter().flatten() {
            push_vector3(&mut buf, &contact.position);
            push_vector3(&mut buf, &contact.normal);
        }

        for value in self
            .wheel_suspension_length
            .iter()
            .chain(&self.wheel_suspension_velocity)
            .chain(&self.wheel_delta_rotation)
            .chain(&self.wheel_skid_info)
        {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        buf.extend_from_slice(&self.steering.to_le_bytes());

        let mut final_flags = 0u8;
        if self.controls.up {
            final_flags |= 1;
        }
        if self.controls.right {
            final_flags |= 2;
        }
        if self.controls.down {
            final_flags |= 4;
        }
        if self.controls.left {
            final_flags |= 8;
        }
        if self.controls.reset {
            final_flags |= 16;
        }
        if self.brake_light_enabled {
            final_flags |= 32;
        }
        buf.push(final_flags);

        Ok(buf)
    }

    fn encoded_size(&self) -> usize {
        let mut size = 3 + 4 + 1 + 2 + 12 + 16 + 1 + 64 + 4 + 1;
        if self.finish_frames.is_some() {
            size += 3;
        }
        size += 4 * self.collision_impulses.len();
        size += 24 * self.wheel_contact.iter().flatten().count();
        size
    }
}

fn read_vector3(reader: &mut Reader<'_>, what: &'static str) -> Result<Vector3, PacketError> {
    Ok(Vector3 {
        x: reader.f32(what)?,
        y: reader.f32(what)?,
        z: reader.f32(what)?,
    })
}

fn read_f32x4(reader: &mut Reader<'_>, what: &'static str) -> Result<[f32; 4], PacketError> {
    Ok([
        reader.f32(what)?,
        reader.f32(what)?,
        reader.f32(what)?,
        reader.f32(what)?,
    ])
}

fn push_vector3(buf: &mut Vec<u8>, v: &Vector3) {
    buf.extend_from_slice(&v.x.to_le_bytes());
    buf.extend_from_slice(&v.y.to_le_bytes());
    buf.extend_from_slice(&v.z.to_le_bytes());
}

/// Visual customization picked by a player: pattern/rims/exhaust selectors
/// plus four 24-bit colors. 16 bytes on the wire with a zero header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarStyle {
    pub pattern: u8,
    pub rims: u8,
    pub exhaust: u8,
    pub color1: u32,
    pub color2: u32,
    pub color3: u32,
    pub color4: u32,
}

impl Default for CarStyle {
    fn default() -> Self {
        CarStyle {
            pattern: 0,
            rims: 0,
            exhaust: 0,
            color1: 0x555555,
            color2: 0x555555,
            color3: 0x555555,
            color4: 0x555555,
        }
    }
}

impl CarStyle {
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[1] = self.pattern;
        buf[2] = self.rims;
        buf[3] = self.exhaust;
        put_u24(&mut buf[4..7], self.color1);
        put_u24(&mut buf[7..10], self.color2);
        put_u24(&mut buf[10..13], self.color3);
        put_u24(&mut buf[13..16], self.color4);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<CarStyle, PacketError> {
        if data.len() < 16 {
            return Err(PacketError::CarStyleTooShort(data.len()));
        }
        if data[0] != 0 {
            return Err(PacketError::BadCarStyleHeader(data[0]));
        }

        Ok(CarStyle {
            pattern: data[1],
            rims: data[2],
            exhaust: data[3],
            color1: get_u24(&data[4..7]),
            color2: get_u24(&data[7..10]),
            color3: get_u24(&data[10..13]),
            color4: get_u24(&data[13..16]),
        })
    }

    /// Decode the base64 form sent over signaling. The client uses URL-safe
    /// encoding without padding; a padded form is accepted as a fallback.
    /// An empty string means the player kept the defaults.
    pub fn from_base64(encoded: &str) -> Result<CarStyle, PacketError> {
        if encoded.is_empty() {
            return Ok(CarStyle::default());
        }

        let data = match URL_SAFE_NO_PAD.decode(encoded) {
            Ok(data) => data,
            Err(_) => URL_SAFE.decode(encoded)?,
        };
        CarStyle::decode(&data)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encode())
    }
}

fn put_u24(dst: &mut [u8], value: u32) {
    dst[0] = value as u8;
    dst[1] = (value >> 8) as u8;
    dst[2] = (value >> 16) as u8;
}

fn get_u24(src: &[u8]) -> u32 {
    src[0] as u32 | (src[1] as u32) << 8 | (src[2] as u32) << 16
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A state exercising every optional record: finish frames, impulses,
    /// and two of four wheel contacts.
    pub(crate) fn sample_state() -> CarState {
        CarState {
            frames: 123_456,
            speed_kmh: 187.5,
            has_started: true,
            finish_frames: Some(99_000),
            next_checkpoint_index: 12,
            has_checkpoint_to_respawn_at: true,
            position: Vector3 {
                x: 1.0,
                y: -2.5,
                z: 300.125,
            },
            quaternion: Quaternion {
                x: 0.0,
                y: 0.7071,
                z: 0.0,
                w: 0.7071,
            },
            collision_impulses: vec![0.5, 12.25],
            wheel_contact: [
                Some(WheelContact {
                    position: Vector3 {
                        x: 1.0,
                        y: 0.0,
                        z: 2.0,
                    },
                    normal: Vector3 {
                        x: 0.0,
                        y: 1.0,
                        z: 0.0,
                    },
                }),
                None,
                Some(WheelContact::default()),
                None,
            ],
            wheel_suspension_length: [0.1, 0.2, 0.3, 0.4],
            wheel_suspension_velocity: [-0.1, 0.0, 0.1, 0.2],
            wheel_delta_rotation: [6.1, 6.2, 6.3, 6.4],
            wheel_skid_info: [0.0, 0.0, 1.0, 1.0],
            steering: -0.35,
            brake_light_enabled: true,
            controls: Controls {
                up: true,
                right: false,
                down: false,
                left: true,
                reset: false,
            },
        }
    }
}
