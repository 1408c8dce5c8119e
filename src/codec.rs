//! Binary encoding of cached elements.
//!
//! Coordinates use a fixed-width record so they can be addressed by slot:
//!
//! ```text
//! [marker: u8 = 1][lon: i32][lat: i32]
//! ```
//!
//! An all-zero record is a slot that was never written.
//!
//! Tagged elements use a variable-length layout that starts with the id, so
//! log replay can recover it without decoding the rest:
//!
//! ```text
//! node:     [id: i64][tags]
//! way:      [id: i64][tags][#refs][zigzag ref deltas...]
//! relation: [id: i64][tags][#members][(kind: u8, zigzag id delta, role)...]
//! tags:     [#tags][(key, value)...], sorted by key
//! ```
//!
//! Counts, lengths and deltas are LEB128 varints, strings are length-prefixed UTF-8.
//! All integers of fixed width are big-endian.
use crate::{
    osm_data::{from_tight, to_tight, Coord, Member, MemberType, Node, Relation, Tags, Way},
    CorruptRecordSnafu,
    Result,
};
use bytes::{Buf, BufMut};
use itertools::Itertools;
use snafu::prelude::*;

pub const COORD_RECORD_LEN: usize = 9;
const COORD_PRESENT: u8 = 1;

const MAX_VARINT_LEN: usize = 10;

pub fn encode_coord(coord: &Coord, mut buf: impl BufMut) {
    buf.put_u8(COORD_PRESENT);
    buf.put_i32(to_tight(coord.lon));
    buf.put_i32(to_tight(coord.lat));
}

/// Decode a coordinate slot.
///
/// The id isn't stored in the slot, so it has to be provided by the caller.
/// Returns `None` for a slot that was never written.
pub fn decode_coord(id: i64, record: &[u8]) -> Result<Option<Coord>> {
    ensure!(
        record.len() == COORD_RECORD_LEN,
        CorruptRecordSnafu {
            description: format!(
                "coordinate record for {id} has {} bytes, expected {COORD_RECORD_LEN}",
                record.len()
            )
        }
    );
    let mut buf = record;
    match buf.get_u8() {
        0 => {
            ensure!(
                buf.iter().all(|b| *b == 0),
                CorruptRecordSnafu {
                    description: format!("absent coordinate slot {id} contains data")
                }
            );
            Ok(None)
        }
        COORD_PRESENT => {
            let lon = from_tight(buf.get_i32());
            let lat = from_tight(buf.get_i32());
            Ok(Some(Coord { id, lon, lat }))
        }
        marker => CorruptRecordSnafu {
            description: format!("unknown marker {marker} in coordinate slot {id}"),
        }
        .fail(),
    }
}

/// Variable-size serialisation for elements kept in a sparse store.
pub trait VarSizeSerde: Sized {
    fn id(&self) -> i64;

    fn ser_into(&self, buf: impl BufMut);

    /// `data` must contain exactly one record.
    fn deser_from(data: &[u8]) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.ser_into(&mut buf);
        buf
    }
}

/// Read only the leading id of a variable-size record.
pub fn peek_id(data: &[u8]) -> Result<i64> {
    let mut buf = data;
    buf.checked_i64("id")
}

impl VarSizeSerde for Node {
    fn id(&self) -> i64 {
        self.id
    }

    fn ser_into(&self, mut buf: impl BufMut) {
        buf.put_i64(self.id);
        put_tags(&mut buf, &self.tags);
    }

    fn deser_from(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let id = buf.checked_i64("node id")?;
        let tags = get_tags(&mut buf)?;
        ensure_consumed(buf, "node", id)?;
        Ok(Node { id, tags })
    }
}

impl VarSizeSerde for Way {
    fn id(&self) -> i64 {
        self.id
    }

    fn ser_into(&self, mut buf: impl BufMut) {
        buf.put_i64(self.id);
        put_tags(&mut buf, &self.tags);
        put_uvarint(&mut buf, self.refs.len() as u64);
        let mut last = 0i64;
        for r in self.refs.iter() {
            put_uvarint(&mut buf, zigzag(r.wrapping_sub(last)));
            last = *r;
        }
    }

    fn deser_from(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let id = buf.checked_i64("way id")?;
        let tags = get_tags(&mut buf)?;
        let num_refs = buf.checked_count("ref count")?;
        let mut refs = Vec::with_capacity(num_refs);
        let mut last = 0i64;
        for _i in 0..num_refs {
            let delta = unzigzag(buf.checked_uvarint("ref delta")?);
            last = last.wrapping_add(delta);
            refs.push(last);
        }
        ensure_consumed(buf, "way", id)?;
        Ok(Way { id, tags, refs })
    }
}

impl VarSizeSerde for Relation {
    fn id(&self) -> i64 {
        self.id
    }

    fn ser_into(&self, mut buf: impl BufMut) {
        buf.put_i64(self.id);
        put_tags(&mut buf, &self.tags);
        put_uvarint(&mut buf, self.members.len() as u64);
        let mut last = 0i64;
        for member in self.members.iter() {
            buf.put_u8(member.kind.to_byte());
            put_uvarint(&mut buf, zigzag(member.id.wrapping_sub(last)));
            last = member.id;
            put_str(&mut buf, &member.role);
        }
    }

    fn deser_from(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let id = buf.checked_i64("relation id")?;
        let tags = get_tags(&mut buf)?;
        let num_members = buf.checked_count("member count")?;
        let mut members = Vec::with_capacity(num_members);
        let mut last = 0i64;
        for _i in 0..num_members {
            let kind_byte = buf.checked_u8("member type")?;
            let kind = MemberType::from_byte(kind_byte).with_context(|| CorruptRecordSnafu {
                description: format!("unknown member type {kind_byte} in relation {id}"),
            })?;
            let delta = unzigzag(buf.checked_uvarint("member id delta")?);
            last = last.wrapping_add(delta);
            let role = buf.checked_string("member role")?;
            members.push(Member {
                id: last,
                kind,
                role,
            });
        }
        ensure_consumed(buf, "relation", id)?;
        Ok(Relation { id, tags, members })
    }
}

fn put_tags(buf: &mut impl BufMut, tags: &Tags) {
    put_uvarint(buf, tags.len() as u64);
    for (key, value) in tags.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn get_tags(buf: &mut &[u8]) -> Result<Tags> {
    let num_tags = buf.checked_count("tag count")?;
    let mut tags = Tags::default();
    tags.reserve(num_tags);
    for _i in 0..num_tags {
        let key = buf.checked_string("tag key")?;
        let value = buf.checked_string("tag value")?;
        if let Some(previous) = tags.insert(key, value) {
            return CorruptRecordSnafu {
                description: format!("duplicate tag key (previous value {previous:?})"),
            }
            .fail();
        }
    }
    Ok(tags)
}

fn put_str(buf: &mut impl BufMut, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn put_uvarint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

fn ensure_consumed(buf: &[u8], kind: &str, id: i64) -> Result<()> {
    ensure!(
        buf.is_empty(),
        CorruptRecordSnafu {
            description: format!("{} trailing bytes after {kind} {id}", buf.len())
        }
    );
    Ok(())
}

/// Bounds-checked reads, so truncated records become errors instead of panics.
trait CheckedBuf {
    fn checked_u8(&mut self, what: &str) -> Result<u8>;

    fn checked_i64(&mut self, what: &str) -> Result<i64>;

    fn checked_uvarint(&mut self, what: &str) -> Result<u64>;

    /// A varint that is used as an element count.
    ///
    /// Every counted item takes at least one byte, which bounds the count by what's left.
    fn checked_count(&mut self, what: &str) -> Result<usize>;

    fn checked_string(&mut self, what: &str) -> Result<String>;
}

impl CheckedBuf for &[u8] {
    fn checked_u8(&mut self, what: &str) -> Result<u8> {
        ensure!(
            self.has_remaining(),
            CorruptRecordSnafu {
                description: format!("record truncated while reading {what}")
            }
        );
        Ok(self.get_u8())
    }

    fn checked_i64(&mut self, what: &str) -> Result<i64> {
        ensure!(
            self.remaining() >= 8,
            CorruptRecordSnafu {
                description: format!(
                    "record truncated while reading {what}: {} of 8 bytes left",
                    self.remaining()
                )
            }
        );
        Ok(self.get_i64())
    }

    fn checked_uvarint(&mut self, what: &str) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.checked_u8(what)?;
            let bits = (byte & 0x7f) as u64;
            ensure!(
                i < MAX_VARINT_LEN - 1 || bits <= 1,
                CorruptRecordSnafu {
                    description: format!("varint overflow while reading {what}")
                }
            );
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        CorruptRecordSnafu {
            description: format!("unterminated varint while reading {what}"),
        }
        .fail()
    }

    fn checked_count(&mut self, what: &str) -> Result<usize> {
        let count = self.checked_uvarint(what)?;
        ensure!(
            count <= self.remaining() as u64,
            CorruptRecordSnafu {
                description: format!(
                    "{what} of {count} exceeds the {} remaining bytes",
                    self.remaining()
                )
            }
        );
        Ok(count as usize)
    }

    fn checked_string(&mut self, what: &str) -> Result<String> {
        let len = self.checked_uvarint(what)?;
        ensure!(
            len <= self.remaining() as u64,
            CorruptRecordSnafu {
                description: format!(
                    "{what} of length {len} exceeds the {} remaining bytes",
                    self.remaining()
                )
            }
        );
        let slice: &[u8] = *self;
        let (data, rest) = slice.split_at(len as usize);
        *self = rest;
        String::from_utf8(data.to_vec()).map_err(|e| {
            CorruptRecordSnafu {
                description: format!("{what} is not valid UTF-8: {e}"),
            }
            .build()
        })
    }
}
