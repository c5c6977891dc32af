use glam::Vec3;

use super::bytes::ByteReader;
use crate::config::DeltaBounds;
use crate::movement::MovementSnapshot;

pub const PACKED_FULL: u8 = 0x01;
pub const PACKED_DELTA: u8 = 0x02;

/// `i16 cell_x | i16 cell_y | u32 seq | u64 time_ms | i32 pos_cm[3] | i16 vel_cms[3] | u8 anim`
const FULL_BODY_LEN: usize = 35;
/// `u32 base_seq | u32 seq | u16 dt_ms | i16 dpos_cm[3] | i16 dvel_cms[3] | u8 anim`
const DELTA_BODY_LEN: usize = 23;
const CRC_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedKind {
    Full,
    Delta,
}

/// Receiver-side quantization origin. `have` also means the paired base snapshot is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnchorState {
    pub have: bool,
    pub cell_x: i16,
    pub cell_y: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("empty snapshot")]
    Empty,
    #[error("unknown snapshot kind {0:#04x}")]
    UnknownKind(u8),
    #[error("snapshot body has {len} bytes, expected {expected}")]
    Truncated { len: usize, expected: usize },
    #[error("crc mismatch: wire {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("delta received without an anchor")]
    MissingAnchor,
    #[error("delta references seq {expected}, base is seq {actual}")]
    BaseMismatch { expected: u32, actual: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quantized {
    pos_cm: [i64; 3],
    vel_cms: [i64; 3],
    time_ms: i64,
}

fn cell_origin(cell_x: i16, cell_y: i16, cell_size: i32) -> [f64; 3] {
    [
        f64::from(cell_x) * f64::from(cell_size),
        0.0,
        f64::from(cell_y) * f64::from(cell_size),
    ]
}

fn quantize(snap: &MovementSnapshot, cell_x: i16, cell_y: i16, cell_size: i32) -> Quantized {
    let origin = cell_origin(cell_x, cell_y, cell_size);
    let pos = snap.pos.to_array();
    let vel = snap.vel.to_array();
    let pos_cm = std::array::from_fn(|i| ((f64::from(pos[i]) - origin[i]) * 100.0).round() as i64);
    let vel_cms = std::array::from_fn(|i| {
        (f64::from(vel[i]) * 100.0)
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i64
    });
    Quantized {
        pos_cm,
        vel_cms,
        time_ms: (snap.server_time.max(0.0) * 1000.0).round() as i64,
    }
}

fn dequantize(
    q: &Quantized,
    seq: u32,
    anim_state: u8,
    cell_x: i16,
    cell_y: i16,
    cell_size: i32,
) -> MovementSnapshot {
    let origin = cell_origin(cell_x, cell_y, cell_size);
    let pos: [f32; 3] = std::array::from_fn(|i| (origin[i] + q.pos_cm[i] as f64 / 100.0) as f32);
    let vel: [f32; 3] = std::array::from_fn(|i| (q.vel_cms[i] as f64 / 100.0) as f32);
    MovementSnapshot {
        pos: Vec3::from_array(pos),
        vel: Vec3::from_array(vel),
        server_time: q.time_ms as f64 / 1000.0,
        seq,
        anim_state,
    }
}

fn seal(kind: u8, body: Vec<u8>) -> Vec<u8> {
    let crc = crc32fast::hash(&body);
    let mut out = Vec::with_capacity(1 + body.len() + CRC_LEN);
    out.push(kind);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Full and delta movement snapshots over an anchor cell. Positions travel as
/// centimetres from the cell origin, velocities as cm/s, time as milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedSnapshot;

impl PackedSnapshot {
    pub fn kind(bytes: &[u8]) -> Option<PackedKind> {
        match bytes.first()? {
            &PACKED_FULL => Some(PackedKind::Full),
            &PACKED_DELTA => Some(PackedKind::Delta),
            _ => None,
        }
    }

    /// What a receiver decodes from `snap` packed at this anchor.
    pub fn quantize(
        snap: &MovementSnapshot,
        cell_x: i16,
        cell_y: i16,
        cell_size: i32,
    ) -> MovementSnapshot {
        let q = quantize(snap, cell_x, cell_y, cell_size);
        dequantize(&q, snap.seq, snap.anim_state, cell_x, cell_y, cell_size)
    }

    pub fn pack_full(snap: &MovementSnapshot, cell_x: i16, cell_y: i16, cell_size: i32) -> Vec<u8> {
        let q = quantize(snap, cell_x, cell_y, cell_size);
        let mut body = Vec::with_capacity(FULL_BODY_LEN);
        body.extend_from_slice(&cell_x.to_le_bytes());
        body.extend_from_slice(&cell_y.to_le_bytes());
        body.extend_from_slice(&snap.seq.to_le_bytes());
        body.extend_from_slice(&(q.time_ms as u64).to_le_bytes());
        for cm in q.pos_cm {
            let cm = cm.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            body.extend_from_slice(&cm.to_le_bytes());
        }
        for cms in q.vel_cms {
            body.extend_from_slice(&(cms as i16).to_le_bytes());
        }
        body.push(snap.anim_state);
        seal(PACKED_FULL, body)
    }

    /// `None` when any difference exceeds `bounds`; the caller must send a full instead.
    pub fn pack_delta(
        base: &MovementSnapshot,
        snap: &MovementSnapshot,
        cell_x: i16,
        cell_y: i16,
        cell_size: i32,
        bounds: &DeltaBounds,
    ) -> Option<Vec<u8>> {
        let qb = quantize(base, cell_x, cell_y, cell_size);
        let qs = quantize(snap, cell_x, cell_y, cell_size);

        let dt_ms = qs.time_ms - qb.time_ms;
        if dt_ms < 0 || dt_ms > i64::from(bounds.max_dt_ms) || dt_ms > i64::from(u16::MAX) {
            return None;
        }

        let within = |d: i64, limit: i32| d.abs() <= i64::from(limit) && d.abs() <= i64::from(i16::MAX);
        let dpos: [i64; 3] = std::array::from_fn(|i| qs.pos_cm[i] - qb.pos_cm[i]);
        let dvel: [i64; 3] = std::array::from_fn(|i| qs.vel_cms[i] - qb.vel_cms[i]);
        if !dpos.iter().all(|d| within(*d, bounds.max_pos_delta_cm))
            || !dvel.iter().all(|d| within(*d, bounds.max_vel_delta_cms))
        {
            return None;
        }

        let mut body = Vec::with_capacity(DELTA_BODY_LEN);
        body.extend_from_slice(&base.seq.to_le_bytes());
        body.extend_from_slice(&snap.seq.to_le_bytes());
        body.extend_from_slice(&(dt_ms as u16).to_le_bytes());
        for d in dpos.iter().chain(&dvel) {
            body.extend_from_slice(&(*d as i16).to_le_bytes());
        }
        body.push(snap.anim_state);
        Some(seal(PACKED_DELTA, body))
    }

    /// A full re-establishes `anchor` and `base`. A delta is applied to `base` and
    /// leaves both untouched.
    pub fn try_unpack(
        bytes: &[u8],
        cell_size: i32,
        anchor: &mut AnchorState,
        base: &mut MovementSnapshot,
    ) -> Result<MovementSnapshot, SnapshotError> {
        let (&kind, rest) = bytes.split_first().ok_or(SnapshotError::Empty)?;
        let expected = match kind {
            PACKED_FULL => FULL_BODY_LEN,
            PACKED_DELTA => DELTA_BODY_LEN,
            other => return Err(SnapshotError::UnknownKind(other)),
        };
        if rest.len() != expected + CRC_LEN {
            return Err(SnapshotError::Truncated {
                len: rest.len(),
                expected: expected + CRC_LEN,
            });
        }

        let (body, crc_bytes) = rest.split_at(expected);
        let mut crc_reader = ByteReader::new(crc_bytes);
        let wire_crc = crc_reader.read_u32().ok_or(SnapshotError::Truncated {
            len: rest.len(),
            expected: expected + CRC_LEN,
        })?;
        let actual = crc32fast::hash(body);
        if wire_crc != actual {
            return Err(SnapshotError::CrcMismatch {
                expected: wire_crc,
                actual,
            });
        }

        let truncated = SnapshotError::Truncated {
            len: rest.len(),
            expected: expected + CRC_LEN,
        };
        let mut r = ByteReader::new(body);

        if kind == PACKED_FULL {
            let parsed = (|| {
                let cell_x = r.read_i16()?;
                let cell_y = r.read_i16()?;
                let seq = r.read_u32()?;
                let time_ms = r.read_u64()?;
                let pos_cm = [r.read_i32()?, r.read_i32()?, r.read_i32()?];
                let vel_cms = [r.read_i16()?, r.read_i16()?, r.read_i16()?];
                let anim = r.read_u8()?;
                Some((cell_x, cell_y, seq, time_ms, pos_cm, vel_cms, anim))
            })();
            let (cell_x, cell_y, seq, time_ms, pos_cm, vel_cms, anim) = parsed.ok_or(truncated)?;

            let q = Quantized {
                pos_cm: pos_cm.map(i64::from),
                vel_cms: vel_cms.map(i64::from),
                time_ms: time_ms.min(i64::MAX as u64) as i64,
            };
            let snap = dequantize(&q, seq, anim, cell_x, cell_y, cell_size);
            *anchor = AnchorState {
                have: true,
                cell_x,
                cell_y,
            };
            *base = snap;
            return Ok(snap);
        }

        if !anchor.have {
            return Err(SnapshotError::MissingAnchor);
        }

        let parsed = (|| {
            let base_seq = r.read_u32()?;
            let seq = r.read_u32()?;
            let dt_ms = r.read_u16()?;
            let mut deltas = [0i64; 6];
            for d in &mut deltas {
                *d = i64::from(r.read_i16()?);
            }
            let anim = r.read_u8()?;
            Some((base_seq, seq, dt_ms, deltas, anim))
        })();
        let (base_seq, seq, dt_ms, deltas, anim) = parsed.ok_or(truncated)?;

        if base_seq != base.seq {
            return Err(SnapshotError::BaseMismatch {
                expected: base_seq,
                actual: base.seq,
            });
        }

        let qb = quantize(base, anchor.cell_x, anchor.cell_y, cell_size);
        let q = Quantized {
            pos_cm: std::array::from_fn(|i| qb.pos_cm[i] + deltas[i]),
            vel_cms: std::array::from_fn(|i| qb.vel_cms[i] + deltas[3 + i]),
            time_ms: qb.time_ms + i64::from(dt_ms),
        };
        Ok(dequantize(
            &q,
            seq,
            anim,
            anchor.cell_x,
            anchor.cell_y,
            cell_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: i32 = 128;

    fn snap(x: f32, z: f32, t: f64, seq: u32) -> MovementSnapshot {
        MovementSnapshot {
            pos: Vec3::new(x, 1.25, z),
            vel: Vec3::new(3.5, 0.0, -1.0),
            server_time: t,
            seq,
            anim_state: 1,
        }
    }

    fn close(a: Vec3, b: Vec3, eps: f32) -> bool {
        (a - b).abs().max_element() <= eps
    }

    #[test]
    fn full_round_trip_within_quantization() {
        let original = snap(300.1234, -45.678, 12.3456, 77);
        let bytes = PackedSnapshot::pack_full(&original, 2, -1, CELL);
        assert_eq!(PackedSnapshot::kind(&bytes), Some(PackedKind::Full));
        assert_eq!(bytes.len(), 1 + FULL_BODY_LEN + CRC_LEN);

        let mut anchor = AnchorState::default();
        let mut base = MovementSnapshot::default();
        let decoded = PackedSnapshot::try_unpack(&bytes, CELL, &mut anchor, &mut base).unwrap();

        assert!(close(decoded.pos, original.pos, 0.005 + 1e-4));
        assert!(close(decoded.vel, original.vel, 0.005 + 1e-4));
        assert!((decoded.server_time - original.server_time).abs() <= 0.0005 + 1e-9);
        assert_eq!(decoded.seq, 77);
        assert_eq!(decoded.anim_state, 1);
        assert_eq!(
            anchor,
            AnchorState {
                have: true,
                cell_x: 2,
                cell_y: -1
            }
        );
        assert_eq!(base, decoded);
        assert_eq!(decoded, PackedSnapshot::quantize(&original, 2, -1, CELL));
    }

    #[test]
    fn delta_reconstructs_the_same_as_full() {
        let keyframe = snap(10.0, 10.0, 1.0, 10);
        let next = MovementSnapshot {
            pos: Vec3::new(10.31, 1.25, 9.87),
            vel: Vec3::new(4.0, 0.0, -0.5),
            server_time: 1.1,
            seq: 13,
            anim_state: 2,
        };

        let mut anchor = AnchorState::default();
        let mut base = MovementSnapshot::default();
        let full = PackedSnapshot::pack_full(&keyframe, 0, 0, CELL);
        PackedSnapshot::try_unpack(&full, CELL, &mut anchor, &mut base).unwrap();

        let delta =
            PackedSnapshot::pack_delta(&keyframe, &next, 0, 0, CELL, &DeltaBounds::default())
                .unwrap();
        assert_eq!(PackedSnapshot::kind(&delta), Some(PackedKind::Delta));
        assert!(delta.len() < full.len());

        let decoded = PackedSnapshot::try_unpack(&delta, CELL, &mut anchor, &mut base).unwrap();
        assert_eq!(decoded, PackedSnapshot::quantize(&next, 0, 0, CELL));
        // deltas never move the base
        assert_eq!(base.seq, 10);
    }

    #[test]
    fn delta_out_of_bounds_is_not_representable() {
        let bounds = DeltaBounds {
            max_pos_delta_cm: 60,
            max_vel_delta_cms: 150,
            max_dt_ms: 200,
        };
        let base = snap(0.0, 0.0, 1.0, 1);

        let far = MovementSnapshot {
            pos: Vec3::new(0.61, 1.25, 0.0),
            ..base
        };
        assert!(PackedSnapshot::pack_delta(&base, &far, 0, 0, CELL, &bounds).is_none());

        let fast = MovementSnapshot {
            vel: Vec3::new(5.1, 0.0, -1.0),
            ..base
        };
        assert!(PackedSnapshot::pack_delta(&base, &fast, 0, 0, CELL, &bounds).is_none());

        let late = MovementSnapshot {
            server_time: 1.201,
            ..base
        };
        assert!(PackedSnapshot::pack_delta(&base, &late, 0, 0, CELL, &bounds).is_none());

        let earlier = MovementSnapshot {
            server_time: 0.9,
            ..base
        };
        assert!(PackedSnapshot::pack_delta(&base, &earlier, 0, 0, CELL, &bounds).is_none());
    }

    #[test]
    fn delta_needs_anchor_and_matching_base() {
        let bounds = DeltaBounds::default();
        let keyframe = snap(1.0, 1.0, 1.0, 5);
        let next = snap(1.1, 1.0, 1.05, 6);
        let delta = PackedSnapshot::pack_delta(&keyframe, &next, 0, 0, CELL, &bounds).unwrap();

        let mut anchor = AnchorState::default();
        let mut base = MovementSnapshot::default();
        assert_eq!(
            PackedSnapshot::try_unpack(&delta, CELL, &mut anchor, &mut base),
            Err(SnapshotError::MissingAnchor)
        );

        let other = snap(1.0, 1.0, 0.5, 4);
        let full = PackedSnapshot::pack_full(&other, 0, 0, CELL);
        PackedSnapshot::try_unpack(&full, CELL, &mut anchor, &mut base).unwrap();
        assert_eq!(
            PackedSnapshot::try_unpack(&delta, CELL, &mut anchor, &mut base),
            Err(SnapshotError::BaseMismatch {
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let mut bytes = PackedSnapshot::pack_full(&snap(5.0, 5.0, 2.0, 3), 0, 0, CELL);
        bytes[6] ^= 0x40;
        let mut anchor = AnchorState::default();
        let mut base = MovementSnapshot::default();
        assert!(matches!(
            PackedSnapshot::try_unpack(&bytes, CELL, &mut anchor, &mut base),
            Err(SnapshotError::CrcMismatch { .. })
        ));
        assert!(!anchor.have);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut anchor = AnchorState::default();
        let mut base = MovementSnapshot::default();
        assert_eq!(
            PackedSnapshot::try_unpack(&[], CELL, &mut anchor, &mut base),
            Err(SnapshotError::Empty)
        );
        assert_eq!(
            PackedSnapshot::try_unpack(&[0x7F, 0, 0], CELL, &mut anchor, &mut base),
            Err(SnapshotError::UnknownKind(0x7F))
        );
        let mut bytes = PackedSnapshot::pack_full(&snap(0.0, 0.0, 0.0, 1), 0, 0, CELL);
        bytes.pop();
        assert!(matches!(
            PackedSnapshot::try_unpack(&bytes, CELL, &mut anchor, &mut base),
            Err(SnapshotError::Truncated { .. })
        ));
    }
}
