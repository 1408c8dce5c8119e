//! Persistent element cache for bulk OSM imports.
//!
//! Nodes, ways and relations are written once while streaming an extract and
//! looked up by id later, when geometries get resolved.
//! Coordinates live in a dense [block store](stores::coord_block_store),
//! everything with tags lives in a [sparse store](stores::sparse_store).
use snafu::{prelude::*, Backtrace};
use std::path::PathBuf;

pub mod caches;
pub mod codec;
pub mod options;
pub mod osm_data;
pub mod stores;

pub use caches::{CoordsCache, NodesCache, OsmCache, RelationsCache, WaysCache};
pub use options::CacheOptions;
pub use osm_data::{Coord, Member, MemberType, Node, PlacedNode, Relation, Tags, Way};

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Corrupt record: {description}"))]
    CorruptRecord {
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Corrupt index file {}: {description}", path.display()))]
    CorruptIndex {
        path: PathBuf,
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "Coordinate cache was created with bucket size {found}, but opened with {expected}"
    ))]
    BucketSizeMismatch {
        expected: u64,
        found: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Id {id} cannot be stored in the coordinate cache"))]
    InvalidId { id: i64, backtrace: Backtrace },
    #[snafu(display("Coordinate of {id} is out of range: ({lon}, {lat})"))]
    InvalidCoord {
        id: i64,
        lon: f64,
        lat: f64,
        backtrace: Backtrace,
    },
    #[snafu(display("Record for {id} is too large to be cached: {len} bytes"))]
    RecordTooLarge {
        id: i64,
        len: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid cache options: {description}"))]
    InvalidOptions {
        description: &'static str,
        backtrace: Backtrace,
    },
}

impl CacheError {
    /// `true` if the error came from decoding data rather than from the file system.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CacheError::CorruptRecord { .. } | CacheError::CorruptIndex { .. }
        )
    }
}
