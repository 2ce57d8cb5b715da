// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Location frame codec.
//!
//! Frames arrive from the Location Data characteristic. Byte 0 selects the
//! layout:
//!
//! | mode | layout |
//! |------|--------|
//! | 0    | `x:i32 y:i32 z:i32 quality:u8` |
//! | 1    | `count:u8` then `count` x `{node:u16 distance:i32 quality:u8}` |
//! | 2    | mode 0 layout immediately followed by mode 1 layout |
//!
//! All integers are little-endian, coordinates and distances are millimetres
//! on the wire and metres once decoded.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

const MODE_POSITION: u8 = 0;
const MODE_DISTANCES: u8 = 1;
const MODE_BOTH: u8 = 2;

const POSITION_LEN: usize = 13;
const DISTANCE_RECORD_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty location frame")]
    Empty,
    #[error("unknown location mode {0}")]
    UnknownMode(u8),
    #[error("truncated location frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
}

/// Decoded position estimate, metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub quality: u8,
}

/// One ranging measurement to a neighbouring node, metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceRecord {
    pub node_id: u16,
    pub distance: f64,
    pub quality: u8,
}

/// Immutable decoded location payload.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationFrame {
    Position(Position),
    Distances(Vec<DistanceRecord>),
    PositionAndDistances {
        position: Position,
        distances: Vec<DistanceRecord>,
    },
}

impl LocationFrame {
    pub fn position(&self) -> Option<&Position> {
        match self {
            Self::Position(p) => Some(p),
            Self::PositionAndDistances { position, .. } => Some(position),
            Self::Distances(_) => None,
        }
    }

    pub fn distances(&self) -> Option<&[DistanceRecord]> {
        match self {
            Self::Distances(d) => Some(d),
            Self::PositionAndDistances { distances, .. } => Some(distances),
            Self::Position(_) => None,
        }
    }

    /// Wire mode byte for this frame.
    pub fn mode(&self) -> u8 {
        match self {
            Self::Position(_) => MODE_POSITION,
            Self::Distances(_) => MODE_DISTANCES,
            Self::PositionAndDistances { .. } => MODE_BOTH,
        }
    }
}

impl Serialize for LocationFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("LocationFrame", 2)?;
        match self.position() {
            Some(p) => st.serialize_field("position", p)?,
            None => st.skip_field("position")?,
        }
        match self.distances() {
            Some(d) => st.serialize_field("distances", d)?,
            None => st.skip_field("distances")?,
        }
        st.end()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let end = self.pos + N;
        let slice = self.buf.get(self.pos..end).ok_or(FrameError::Truncated {
            needed: end,
            got: self.buf.len(),
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn require(&self, len: usize) -> Result<(), FrameError> {
        let needed = self.pos + len;
        if self.buf.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                got: self.buf.len(),
            });
        }
        Ok(())
    }
}

fn mm_to_m(mm: i32) -> f64 {
    f64::from(mm) / 1000.0
}

fn m_to_mm(m: f64) -> i32 {
    (m * 1000.0).round() as i32
}

fn read_position(r: &mut Reader<'_>) -> Result<Position, FrameError> {
    r.require(POSITION_LEN)?;
    Ok(Position {
        x: mm_to_m(r.i32()?),
        y: mm_to_m(r.i32()?),
        z: mm_to_m(r.i32()?),
        quality: r.u8()?,
    })
}

fn read_distances(r: &mut Reader<'_>) -> Result<Vec<DistanceRecord>, FrameError> {
    let count = r.u8()? as usize;
    r.require(count * DISTANCE_RECORD_LEN)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(DistanceRecord {
            node_id: r.u16()?,
            distance: mm_to_m(r.i32()?),
            quality: r.u8()?,
        });
    }
    Ok(out)
}

/// Decode a raw Location Data value. Trailing bytes past the declared
/// layout are ignored.
pub fn decode(buf: &[u8]) -> Result<LocationFrame, FrameError> {
    let mut r = Reader::new(buf);
    let mode = r.u8().map_err(|_| FrameError::Empty)?;
    match mode {
        MODE_POSITION => Ok(LocationFrame::Position(read_position(&mut r)?)),
        MODE_DISTANCES => Ok(LocationFrame::Distances(read_distances(&mut r)?)),
        MODE_BOTH => {
            let position = read_position(&mut r)?;
            let distances = read_distances(&mut r)?;
            Ok(LocationFrame::PositionAndDistances {
                position,
                distances,
            })
        }
        other => Err(FrameError::UnknownMode(other)),
    }
}

fn write_position(out: &mut Vec<u8>, p: &Position) {
    out.extend_from_slice(&m_to_mm(p.x).to_le_bytes());
    out.extend_from_slice(&m_to_mm(p.y).to_le_bytes());
    out.extend_from_slice(&m_to_mm(p.z).to_le_bytes());
    out.push(p.quality);
}

fn write_distances(out: &mut Vec<u8>, distances: &[DistanceRecord]) {
    // The count is a single byte on the wire.
    let count = distances.len().min(u8::MAX as usize);
    out.push(count as u8);
    for d in &distances[..count] {
        out.extend_from_slice(&d.node_id.to_le_bytes());
        out.extend_from_slice(&m_to_mm(d.distance).to_le_bytes());
        out.push(d.quality);
    }
}

/// Encode a frame into its wire representation.
pub fn encode(frame: &LocationFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(frame.mode());
    if let Some(p) = frame.position() {
        write_position(&mut out, p);
    }
    if let Some(d) = frame.distances() {
        write_distances(&mut out, d);
    }
    out
}
