//! The record shapes a tracking unit can emit.
//!
//! A unit on the bus reports in exactly one [RecordMode] at a time, selected
//! with the matching bus command. The mode fixes the number of packed words
//! on the wire and therefore the shape of the decoded [Record].

use crate::error::FlockError;
use serde::{Deserialize, Serialize};

/// Output format of a tracking unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecordMode {
    /// Three Euler angles (z, y, x rotation).
    Angles,
    /// 3x3 rotation matrix.
    Matrix,
    /// Orientation quaternion (q0, q1, q2, q3).
    Quaternion,
    /// Position (x, y, z).
    Position,
    /// Position followed by Euler angles.
    #[default]
    PositionAngles,
    /// Position followed by a rotation matrix.
    PositionMatrix,
    /// Position followed by a quaternion.
    PositionQuaternion,
}

impl RecordMode {
    /// Every record mode, in command-byte order of the device manual.
    pub const ALL: [RecordMode; 7] = [
        RecordMode::Angles,
        RecordMode::Matrix,
        RecordMode::Quaternion,
        RecordMode::Position,
        RecordMode::PositionAngles,
        RecordMode::PositionMatrix,
        RecordMode::PositionQuaternion,
    ];

    /// The bus command that switches a unit into this mode.
    pub fn command(self) -> u8 {
        use crate::command::cmd;
        match self {
            RecordMode::Angles => cmd::ANGLES,
            RecordMode::Matrix => cmd::MATRIX,
            RecordMode::Quaternion => cmd::QUATERNION,
            RecordMode::Position => cmd::POSITION,
            RecordMode::PositionAngles => cmd::POSITION_ANGLES,
            RecordMode::PositionMatrix => cmd::POSITION_MATRIX,
            RecordMode::PositionQuaternion => cmd::POSITION_QUATERNION,
        }
    }

    /// The mode selected by a bus command byte, if it is a mode command.
    pub fn from_command(byte: u8) -> Option<Self> {
        RecordMode::ALL.into_iter().find(|mode| mode.command() == byte)
    }

    /// Number of coordinates in a record of this mode.
    pub fn value_count(self) -> usize {
        match self {
            RecordMode::Angles | RecordMode::Position => 3,
            RecordMode::Quaternion => 4,
            RecordMode::PositionAngles => 6,
            RecordMode::PositionQuaternion => 7,
            RecordMode::Matrix => 9,
            RecordMode::PositionMatrix => 12,
        }
    }

    /// Bytes one record of this mode occupies on the bus (two per word).
    pub fn wire_size(self) -> usize {
        self.value_count() * 2
    }
}

/// One decoded record. Coordinates are normalized to `[-1, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Record {
    #[allow(missing_docs)]
    Angles { angles: [f32; 3] },
    #[allow(missing_docs)]
    Matrix { matrix: [[f32; 3]; 3] },
    #[allow(missing_docs)]
    Quaternion { quaternion: [f32; 4] },
    #[allow(missing_docs)]
    Position { position: [f32; 3] },
    #[allow(missing_docs)]
    PositionAngles { position: [f32; 3], angles: [f32; 3] },
    #[allow(missing_docs)]
    PositionMatrix {
        position: [f32; 3],
        matrix: [[f32; 3]; 3],
    },
    #[allow(missing_docs)]
    PositionQuaternion {
        position: [f32; 3],
        quaternion: [f32; 4],
    },
}

fn take3(v: &[f32]) -> [f32; 3] {
    [v[0], v[1], v[2]]
}

fn take4(v: &[f32]) -> [f32; 4] {
    [v[0], v[1], v[2], v[3]]
}

fn take9(v: &[f32]) -> [[f32; 3]; 3] {
    [take3(&v[0..3]), take3(&v[3..6]), take3(&v[6..9])]
}

impl Record {
    /// An all-zero record of the given shape.
    pub fn zeroed(mode: RecordMode) -> Self {
        Record::from_values(mode, &[0.0; 12])
    }

    /// Build a record of `mode` from its coordinates in wire order. `values`
    /// must hold at least [RecordMode::value_count] entries.
    pub fn from_values(mode: RecordMode, values: &[f32]) -> Self {
        match mode {
            RecordMode::Angles => Record::Angles {
                angles: take3(values),
            },
            RecordMode::Matrix => Record::Matrix {
                matrix: take9(values),
            },
            RecordMode::Quaternion => Record::Quaternion {
                quaternion: take4(values),
            },
            RecordMode::Position => Record::Position {
                position: take3(values),
            },
            RecordMode::PositionAngles => Record::PositionAngles {
                position: take3(values),
                angles: take3(&values[3..]),
            },
            RecordMode::PositionMatrix => Record::PositionMatrix {
                position: take3(values),
                matrix: take9(&values[3..]),
            },
            RecordMode::PositionQuaternion => Record::PositionQuaternion {
                position: take3(values),
                quaternion: take4(&values[3..]),
            },
        }
    }

    /// The mode this record was produced in.
    pub fn mode(&self) -> RecordMode {
        match self {
            Record::Angles { .. } => RecordMode::Angles,
            Record::Matrix { .. } => RecordMode::Matrix,
            Record::Quaternion { .. } => RecordMode::Quaternion,
            Record::Position { .. } => RecordMode::Position,
            Record::PositionAngles { .. } => RecordMode::PositionAngles,
            Record::PositionMatrix { .. } => RecordMode::PositionMatrix,
            Record::PositionQuaternion { .. } => RecordMode::PositionQuaternion,
        }
    }

    /// Position part, for modes that carry one.
    pub fn position(&self) -> Option<[f32; 3]> {
        match self {
            Record::Position { position }
            | Record::PositionAngles { position, .. }
            | Record::PositionMatrix { position, .. }
            | Record::PositionQuaternion { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// All coordinates flattened in wire order.
    pub fn values(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.mode().value_count());
        match self {
            Record::Angles { angles } => out.extend_from_slice(angles),
            Record::Matrix { matrix } => matrix.iter().for_each(|r| out.extend_from_slice(r)),
            Record::Quaternion { quaternion } => out.extend_from_slice(quaternion),
            Record::Position { position } => out.extend_from_slice(position),
            Record::PositionAngles { position, angles } => {
                out.extend_from_slice(position);
                out.extend_from_slice(angles);
            }
            Record::PositionMatrix { position, matrix } => {
                out.extend_from_slice(position);
                matrix.iter().for_each(|r| out.extend_from_slice(r));
            }
            Record::PositionQuaternion {
                position,
                quaternion,
            } => {
                out.extend_from_slice(position);
                out.extend_from_slice(quaternion);
            }
        }
        out
    }
}

/// A record tagged with the address of the unit that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BirdRecord {
    /// Bus address (or station number) of the unit.
    pub address: u8,
    /// The decoded coordinates.
    pub record: Record,
}

/// Reassemble one packed bus word: the low 7 bits of the first byte and the
/// second byte form a 16 bit two's complement value, left-justified.
pub fn decode_word(lsb: u8, msb: u8) -> f32 {
    let raw = (u16::from(msb) << 9) | (u16::from(lsb & 0x7f) << 2);
    f32::from(raw as i16) / 32768.0
}

impl BirdRecord {
    /// An all-zero record for a unit.
    pub fn zeroed(address: u8, mode: RecordMode) -> Self {
        BirdRecord {
            address,
            record: Record::zeroed(mode),
        }
    }

    /// Decode a record of `mode` from packed bus words. The first byte must
    /// carry the phase bit.
    pub fn decode_packed(address: u8, mode: RecordMode, data: &[u8]) -> Result<Self, FlockError> {
        let size = mode.wire_size();
        if data.len() < size {
            return Err(FlockError::InvalidSize {
                expected: size,
                actual: data.len(),
            });
        }
        if data[0] & 0x80 == 0 {
            return Err(FlockError::PhaseBit { address });
        }

        let values: Vec<f32> = data[..size]
            .chunks_exact(2)
            .map(|word| decode_word(word[0], word[1]))
            .collect();

        Ok(BirdRecord {
            address,
            record: Record::from_values(mode, &values),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Pack normalized values into bus words, setting the phase bit on the
    /// first byte.
    pub(crate) fn pack_words(values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * 2);
        for v in values {
            let raw = (v * 32768.0) as i16 as u16;
            out.push(((raw >> 2) & 0x7f) as u8);
            out.push(((raw >> 9) & 0x7f) as u8);
        }
        if let Some(first) = out.first_mut() {
            *first |= 0x80;
        }
        out
    }

    #[test]
    fn mode_sizes() {
        let sizes: Vec<usize> = RecordMode::ALL.iter().map(|m| m.wire_size()).collect();
        assert_eq!(sizes, vec![6, 18, 8, 6, 12, 24, 14]);
        assert_eq!(RecordMode::default(), RecordMode::PositionAngles);
    }

    #[test]
    fn mode_command_round_trip() {
        for mode in RecordMode::ALL {
            assert_eq!(RecordMode::from_command(mode.command()), Some(mode));
        }
        assert_eq!(RecordMode::from_command(0x42), None);
    }

    #[test]
    fn decode_word_extremes() {
        assert_eq!(decode_word(0x00, 0x00), 0.0);
        assert_eq!(decode_word(0x00, 0x40), -1.0);
        assert_eq!(decode_word(0x7f, 0x3f), 32764.0 / 32768.0);
    }

    #[test]
    fn decode_position_angles() {
        let values = [0.5, -0.25, 0.125, -0.5, 0.75, -1.0];
        let data = pack_words(&values);
        let rec = BirdRecord::decode_packed(1, RecordMode::PositionAngles, &data).unwrap();
        assert_eq!(
            rec.record,
            Record::PositionAngles {
                position: [0.5, -0.25, 0.125],
                angles: [-0.5, 0.75, -1.0],
            }
        );
        assert_eq!(rec.record.values(), values.to_vec());
    }

    /// A record without the phase bit is rejected
    #[test]
    fn phase_bit_required() {
        let mut data = pack_words(&[0.5, 0.5, 0.5]);
        data[0] &= 0x7f;
        assert!(matches!(
            BirdRecord::decode_packed(2, RecordMode::Position, &data),
            Err(FlockError::PhaseBit { address: 2 })
        ));
    }

    #[test]
    fn short_record_rejected() {
        let data = pack_words(&[0.5, 0.5]);
        assert!(matches!(
            BirdRecord::decode_packed(1, RecordMode::Position, &data),
            Err(FlockError::InvalidSize {
                expected: 6,
                actual: 4
            })
        ));
    }

    #[test]
    fn matrix_layout() {
        let values: Vec<f32> = (0..12).map(|i| i as f32 / 16.0).collect();
        let rec = Record::from_values(RecordMode::PositionMatrix, &values);
        assert_eq!(rec.position(), Some([0.0, 1.0 / 16.0, 2.0 / 16.0]));
        assert_eq!(rec.values(), values);
        assert_eq!(Record::zeroed(RecordMode::Matrix).position(), None);
    }
}
