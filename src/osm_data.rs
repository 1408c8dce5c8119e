use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// <node id="106904" lat="51.5195553" lon="-0.0362329" version="5">
//     <tag k="seamark:type" v="gate"/>
//   </node>

pub type Tags = FxHashMap<String, String>;

pub(crate) const PRECISION_FACTOR: f64 = 1e7;

/// Converts degrees into the 1e-7 fixed-point representation used on disk.
pub(crate) fn to_tight(degrees: f64) -> i32 {
    (degrees * PRECISION_FACTOR).round() as i32
}

pub(crate) fn from_tight(tight: i32) -> f64 {
    (tight as f64) / PRECISION_FACTOR
}

/// The position of a node, independent of whether it carries tags.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coord {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
}

impl Coord {
    pub fn new(id: i64, lon: f64, lat: f64) -> Self {
        Coord { id, lon, lat }
    }

    /// `true` if `lon` and `lat` are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        (-180.0..=180.0).contains(&self.lon) && (-90.0..=90.0).contains(&self.lat)
    }

    /// Round `lon` and `lat` to the precision the cache can store.
    pub fn to_stored_precision(self) -> Self {
        Coord {
            id: self.id,
            lon: from_tight(to_tight(self.lon)),
            lat: from_tight(to_tight(self.lat)),
        }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = if self.lat >= 0.0 { "N" } else { "S" };
        let ew = if self.lon >= 0.0 { "E" } else { "W" };
        write!(
            f,
            "#{} ({}º{}, {}º{})",
            self.id,
            self.lat.abs(),
            ns,
            self.lon.abs(),
            ew
        )
    }
}

/// A tagged node.
///
/// The position is not part of this record; join with the coordinate cache
/// via [with_coord](Node::with_coord) when it's needed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub tags: Tags,
}

impl Node {
    pub fn new(id: i64, tags: Tags) -> Self {
        Node { id, tags }
    }

    pub fn with_coord(self, coord: Coord) -> PlacedNode {
        debug_assert_eq!(self.id, coord.id, "Joining node with a foreign coordinate");
        PlacedNode {
            id: self.id,
            lon: coord.lon,
            lat: coord.lat,
            tags: self.tags,
        }
    }
}

/// A node joined with its coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedNode {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub tags: Tags,
    /// Node ids in path order.
    pub refs: Vec<i64>,
}

impl Way {
    pub fn new(id: i64, tags: Tags, refs: Vec<i64>) -> Self {
        Way { id, tags, refs }
    }

    /// A ring needs at least three distinct nodes plus the closing one.
    pub fn is_closed(&self) -> bool {
        self.refs.len() >= 4 && self.refs.first() == self.refs.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

impl MemberType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            MemberType::Node => 0,
            MemberType::Way => 1,
            MemberType::Relation => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MemberType::Node),
            1 => Some(MemberType::Way),
            2 => Some(MemberType::Relation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub kind: MemberType,
    pub role: String,
}

impl Member {
    pub fn new(id: i64, kind: MemberType, role: impl Into<String>) -> Self {
        Member {
            id,
            kind,
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub tags: Tags,
    pub members: Vec<Member>,
}

impl Relation {
    pub fn new(id: i64, tags: Tags, members: Vec<Member>) -> Self {
        Relation { id, tags, members }
    }

    pub fn way_members(&self) -> impl Iterator<Item = &Member> + '_ {
        self.members.iter().filter(|m| m.kind == MemberType::Way)
    }
}
