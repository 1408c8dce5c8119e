//! Typed cache handles for each element kind.
//!
//! Every handle owns its store exclusively and lives in its own sub-directory
//! of the cache root, so handles can be opened and closed independently.
//! All operations take `&self`; share a handle between workers with an `Arc`.
use crate::{
    osm_data::{Coord, Node, Relation, Way},
    stores::{sparse_store::SparseIter, CoordBlockStore, SparseStore},
    CacheOptions,
    IoSnafu,
    Result,
};
use delegate::delegate;
use snafu::prelude::*;
use std::{
    io,
    path::{Path, PathBuf},
};

pub const COORDS_DIR: &str = "coords";
pub const NODES_DIR: &str = "nodes";
pub const WAYS_DIR: &str = "ways";
pub const RELATIONS_DIR: &str = "relations";

/// Positions of all nodes, tagged or not.
pub struct CoordsCache {
    store: CoordBlockStore,
}

impl CoordsCache {
    pub fn open<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::open_with(dir, &CacheOptions::default())
    }

    pub fn open_with<P>(dir: P, options: &CacheOptions) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let store = CoordBlockStore::open(&dir.as_ref().join(COORDS_DIR), options)?;
        Ok(CoordsCache { store })
    }

    delegate! {
        to self.store {
            #[call(put)]
            pub fn put_coord(&self, coord: &Coord) -> Result<()>;
            #[call(put_all)]
            pub fn put_coords(&self, coords: &[Coord]) -> Result<()>;
            #[call(get)]
            pub fn get_coord(&self, id: i64) -> Result<Option<Coord>>;
            pub fn bucket_count(&self) -> usize;
            pub fn close(self) -> Result<()>;
        }
    }

    /// Look up the coordinates of all nodes of `way`, in path order.
    ///
    /// Returns `None` if any referenced node is missing.
    pub fn fill_way(&self, way: &Way) -> Result<Option<Vec<Coord>>> {
        let mut coords = Vec::with_capacity(way.refs.len());
        for node_id in way.refs.iter() {
            match self.get_coord(*node_id)? {
                Some(coord) => coords.push(coord),
                None => {
                    log::debug!("Way {} references missing node {node_id}", way.id);
                    return Ok(None);
                }
            }
        }
        Ok(Some(coords))
    }
}

/// Tags of nodes that carry any.
pub struct NodesCache {
    store: SparseStore<Node>,
}

impl NodesCache {
    pub fn open<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::open_with(dir, &CacheOptions::default())
    }

    pub fn open_with<P>(dir: P, options: &CacheOptions) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let store = SparseStore::open(&dir.as_ref().join(NODES_DIR), options)?;
        Ok(NodesCache { store })
    }

    delegate! {
        to self.store {
            #[call(put)]
            pub fn put_node(&self, node: &Node) -> Result<()>;
            #[call(get)]
            pub fn get_node(&self, id: i64) -> Result<Option<Node>>;
            pub fn len(&self) -> usize;
            pub fn is_empty(&self) -> bool;
            pub fn close(self) -> Result<()>;
        }
    }
}

pub struct WaysCache {
    store: SparseStore<Way>,
}

impl WaysCache {
    pub fn open<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::open_with(dir, &CacheOptions::default())
    }

    pub fn open_with<P>(dir: P, options: &CacheOptions) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let store = SparseStore::open(&dir.as_ref().join(WAYS_DIR), options)?;
        Ok(WaysCache { store })
    }

    delegate! {
        to self.store {
            #[call(put)]
            pub fn put_way(&self, way: &Way) -> Result<()>;
            #[call(get)]
            pub fn get_way(&self, id: i64) -> Result<Option<Way>>;
            pub fn len(&self) -> usize;
            pub fn is_empty(&self) -> bool;
            pub fn iter(&self) -> SparseIter<'_, Way>;
            pub fn close(self) -> Result<()>;
        }
    }
}

pub struct RelationsCache {
    store: SparseStore<Relation>,
}

impl RelationsCache {
    pub fn open<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::open_with(dir, &CacheOptions::default())
    }

    pub fn open_with<P>(dir: P, options: &CacheOptions) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let store = SparseStore::open(&dir.as_ref().join(RELATIONS_DIR), options)?;
        Ok(RelationsCache { store })
    }

    delegate! {
        to self.store {
            #[call(put)]
            pub fn put_relation(&self, relation: &Relation) -> Result<()>;
            #[call(get)]
            pub fn get_relation(&self, id: i64) -> Result<Option<Relation>>;
            pub fn len(&self) -> usize;
            pub fn is_empty(&self) -> bool;
            pub fn iter(&self) -> SparseIter<'_, Relation>;
            pub fn close(self) -> Result<()>;
        }
    }
}

/// All four caches under one root directory.
pub struct OsmCache {
    dir: PathBuf,
    pub coords: CoordsCache,
    pub nodes: NodesCache,
    pub ways: WaysCache,
    pub relations: RelationsCache,
}

impl OsmCache {
    pub fn open<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::open_with(dir, &CacheOptions::default())
    }

    pub fn open_with<P>(dir: P, options: &CacheOptions) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        Ok(OsmCache {
            dir: dir.to_path_buf(),
            coords: CoordsCache::open_with(dir, options)?,
            nodes: NodesCache::open_with(dir, options)?,
            ways: WaysCache::open_with(dir, options)?,
            relations: RelationsCache::open_with(dir, options)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Close every cache, even if closing an earlier one failed.
    ///
    /// Returns the first error.
    pub fn close(self) -> Result<()> {
        let results = [
            self.coords.close(),
            self.nodes.close(),
            self.ways.close(),
            self.relations.close(),
        ];
        results.into_iter().collect()
    }

    /// Delete a cache root and everything in it. A missing directory is not an error.
    pub fn remove<P>(dir: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {
                log::info!("Removed cache at {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoSnafu { path: dir }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        osm_data::{Member, MemberType, Tags},
        tests::{cache_dir, tags},
    };
    use rayon::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_create_cache() {
        let dir = cache_dir();
        let root = dir.path().join("not").join("there").join("yet");
        let cache = CoordsCache::open(&root).expect("open");
        assert!(root.is_dir());
        assert!(root.join(COORDS_DIR).is_dir());
        cache.close().expect("close");
    }

    #[test]
    fn test_read_write_coord() {
        let dir = cache_dir();
        let cache = CoordsCache::open(dir.path()).expect("open");
        cache
            .put_coord(&Coord {
                id: 1,
                ..Default::default()
            })
            .expect("put");
        cache.close().expect("close");

        let cache = CoordsCache::open(dir.path()).expect("reopen");
        let coord = cache.get_coord(1).expect("get").expect("present");
        assert_eq!(1, coord.id);
        assert_eq!(0.0, coord.lon);
        assert_eq!(0.0, coord.lat);
        assert_eq!(None, cache.get_coord(2).expect("get"));
    }

    #[test]
    fn test_read_write_node() {
        let dir = cache_dir();
        let cache = NodesCache::open(dir.path()).expect("open");
        cache
            .put_node(&Node::new(1234, tags(&[("foo", "bar")])))
            .expect("put");
        cache.close().expect("close");

        let cache = NodesCache::open(dir.path()).expect("reopen");
        let node = cache.get_node(1234).expect("get").expect("present");
        assert_eq!(1234, node.id);
        assert_eq!(Some("bar"), node.tags.get("foo").map(String::as_str));
        assert_eq!(None, cache.get_node(99).expect("missing node is not an error"));
    }

    #[test]
    fn test_read_write_way() {
        let dir = cache_dir();
        let cache = WaysCache::open(dir.path()).expect("open");
        cache
            .put_way(&Way::new(
                1234,
                tags(&[("foo", "bar")]),
                vec![942374923, 23948234],
            ))
            .expect("put");
        cache.close().expect("close");

        let cache = WaysCache::open(dir.path()).expect("reopen");
        let way = cache.get_way(1234).expect("get").expect("present");
        assert_eq!(1234, way.id);
        assert_eq!(Some("bar"), way.tags.get("foo").map(String::as_str));
        assert_eq!(vec![942374923, 23948234], way.refs);
    }

    #[test]
    fn test_read_missing_way() {
        let dir = cache_dir();
        let cache = WaysCache::open(dir.path()).expect("open");
        assert_eq!(None, cache.get_way(1234).expect("get"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_read_without_reopen() {
        let dir = cache_dir();
        let cache = WaysCache::open(dir.path()).expect("open");
        let template = Way::new(0, tags(&[("foo", "bar")]), vec![942374923, 23948234]);
        for id in 0..1000 {
            let way = Way { id, ..template.clone() };
            cache.put_way(&way).expect("put");
        }
        for id in 0..1000 {
            let way = cache.get_way(id).expect("get").expect("present");
            assert_eq!(id, way.id);
            assert_eq!(template.refs, way.refs);
        }
        assert_eq!(1000, cache.len());
    }

    #[test]
    fn test_read_write_relation() {
        let dir = cache_dir();
        let relation = Relation::new(
            4,
            tags(&[("type", "multipolygon")]),
            vec![
                Member::new(10, MemberType::Way, "outer"),
                Member::new(11, MemberType::Way, "inner"),
            ],
        );
        let cache = RelationsCache::open(dir.path()).expect("open");
        cache.put_relation(&relation).expect("put");
        cache.close().expect("close");

        let cache = RelationsCache::open(dir.path()).expect("reopen");
        assert_eq!(Some(relation), cache.get_relation(4).expect("get"));
        assert_eq!(None, cache.get_relation(5).expect("get"));
        assert_eq!(1, cache.iter().count());
    }

    #[test]
    fn test_fill_way() {
        let dir = cache_dir();
        let cache = CoordsCache::open(dir.path()).expect("open");
        cache
            .put_coords(&[
                Coord::new(1, 0.0, 0.0),
                Coord::new(2, 1.0, 0.0),
                Coord::new(3, 1.0, 1.0),
            ])
            .expect("put");
        let ring = Way::new(7, Tags::default(), vec![1, 2, 3, 1]);
        let coords = cache.fill_way(&ring).expect("fill").expect("complete");
        let ids: Vec<i64> = coords.iter().map(|c| c.id).collect();
        assert_eq!(vec![1, 2, 3, 1], ids);
        assert_eq!(Coord::new(2, 1.0, 0.0), coords[1]);

        let dangling = Way::new(8, Tags::default(), vec![1, 2, 4]);
        assert_eq!(None, cache.fill_way(&dangling).expect("fill"));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = cache_dir();
        let options = CacheOptions::default().with_bucket_size(64);
        let ways: Vec<Way> = (0..300)
            .map(|i| Way::new(i * 3, tags(&[("ref", i.to_string().as_str())]), vec![i, i * 2, i]))
            .collect();
        let before: Vec<(Option<Coord>, Option<Way>)> = {
            let cache = OsmCache::open_with(dir.path(), &options).expect("open");
            for way in ways.iter() {
                cache.ways.put_way(way).expect("put way");
                for node_id in way.refs.iter() {
                    let coord = Coord::new(*node_id, *node_id as f64 / 100.0, 45.0);
                    cache.coords.put_coord(&coord).expect("put coord");
                }
            }
            let seen = (0..1000)
                .map(|id| {
                    (
                        cache.coords.get_coord(id).expect("get coord"),
                        cache.ways.get_way(id).expect("get way"),
                    )
                })
                .collect();
            cache.close().expect("close");
            seen
        };
        let cache = OsmCache::open_with(dir.path(), &options).expect("reopen");
        let after: Vec<(Option<Coord>, Option<Way>)> = (0..1000)
            .map(|id| {
                (
                    cache.coords.get_coord(id).expect("get coord"),
                    cache.ways.get_way(id).expect("get way"),
                )
            })
            .collect();
        assert_eq!(before, after);
        assert_eq!(300, cache.ways.len());
    }

    #[test]
    fn test_concurrent_readers() {
        let dir = cache_dir();
        let options = CacheOptions::default()
            .with_bucket_size(128)
            .with_open_buckets(4);
        let cache = Arc::new(OsmCache::open_with(dir.path(), &options).expect("open"));
        (0..2000i64).into_par_iter().for_each(|id| {
            cache
                .coords
                .put_coord(&Coord::new(id, 10.0, id as f64 / 1000.0))
                .expect("put coord");
            if id % 10 == 0 {
                cache
                    .nodes
                    .put_node(&Node::new(id, tags(&[("n", "v")])))
                    .expect("put node");
            }
        });
        let found: usize = (0..4000i64)
            .into_par_iter()
            .map(|id| {
                let coord = cache.coords.get_coord(id).expect("get coord");
                let node = cache.nodes.get_node(id).expect("get node");
                match coord {
                    Some(coord) => {
                        assert_eq!(id as f64 / 1000.0, coord.lat);
                        assert_eq!(id % 10 == 0, node.is_some());
                        1
                    }
                    None => {
                        assert!(node.is_none());
                        0
                    }
                }
            })
            .sum();
        assert_eq!(2000, found);
        assert_eq!(200, cache.nodes.len());
        let cache = Arc::try_unwrap(cache).ok().expect("single owner");
        cache.close().expect("close");
    }

    #[test]
    fn test_caches_do_not_share_ids() {
        let dir = cache_dir();
        let cache = OsmCache::open(dir.path()).expect("open");
        cache
            .nodes
            .put_node(&Node::new(1, tags(&[("kind", "node")])))
            .expect("put");
        cache
            .ways
            .put_way(&Way::new(1, tags(&[("kind", "way")]), vec![1]))
            .expect("put");
        assert_eq!(None, cache.coords.get_coord(1).expect("get"));
        assert_eq!(None, cache.relations.get_relation(1).expect("get"));
        assert_eq!(
            Some("node"),
            cache
                .nodes
                .get_node(1)
                .expect("get")
                .as_ref()
                .and_then(|n| n.tags.get("kind").map(String::as_str))
        );
        cache.close().expect("close");
    }

    #[test]
    fn test_remove() {
        let dir = cache_dir();
        let root = dir.path().join("cache");
        let cache = OsmCache::open(&root).expect("open");
        assert_eq!(root.as_path(), cache.dir());
        cache.close().expect("close");
        OsmCache::remove(&root).expect("remove");
        assert!(!root.exists());
        OsmCache::remove(&root).expect("removing twice is fine");
    }
}
