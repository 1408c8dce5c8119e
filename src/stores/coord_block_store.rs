//! Dense coordinate storage addressed by node id.
//!
//! Ids are split into buckets of `bucket_size` slots, each bucket is one file
//! of fixed-width records. Finding a coordinate is pure arithmetic on the id,
//! there is no index to keep in memory.
use super::ensure_dir;
use crate::{
    codec::{decode_coord, encode_coord, COORD_RECORD_LEN},
    osm_data::Coord,
    BucketSizeMismatchSnafu,
    CorruptIndexSnafu,
    CorruptRecordSnafu,
    InvalidCoordSnafu,
    InvalidIdSnafu,
    InvalidOptionsSnafu,
    IoSnafu,
    CacheOptions,
    Result,
};
use bytes::{Buf, BufMut};
use lru::LruCache;
use memmap::{MmapMut, MmapOptions};
use snafu::prelude::*;
use std::{
    fs::{File, OpenOptions},
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};
use walkdir::WalkDir;

const META_FILE: &str = "coords.meta";
const META_MAGIC: &[u8; 8] = b"OSMCOORD";
const META_VERSION: u32 = 1;
const META_LEN: usize = 8 + 4 + 8 + 4;
const BUCKET_EXTENSION: &str = "coords";

/// Map an id to its `(bucket, slot)` address.
///
/// Negative ids have no address.
pub fn locate(id: i64, bucket_size: u64) -> Option<(u64, usize)> {
    if id < 0 {
        None
    } else {
        let id = id as u64;
        Some((id / bucket_size, (id % bucket_size) as usize))
    }
}

pub struct CoordBlockStore {
    dir: PathBuf,
    bucket_size: u64,
    sync_on_close: bool,
    buckets: RwLock<LruCache<u64, Arc<Bucket>>>,
    closed: bool,
}

impl CoordBlockStore {
    pub fn open(dir: &Path, options: &CacheOptions) -> Result<Self> {
        ensure!(
            options.coords_bucket_size > 0,
            InvalidOptionsSnafu {
                description: "coords_bucket_size must be positive"
            }
        );
        ensure!(
            options
                .coords_bucket_size
                .checked_mul(COORD_RECORD_LEN as u64)
                .map_or(false, |len| usize::try_from(len).is_ok()),
            InvalidOptionsSnafu {
                description: "coords_bucket_size is too large to map into memory"
            }
        );
        let open_buckets =
            NonZeroUsize::new(options.open_buckets).context(InvalidOptionsSnafu {
                description: "open_buckets must be positive",
            })?;
        ensure_dir(dir)?;
        check_or_write_meta(dir, options.coords_bucket_size)?;
        let store = CoordBlockStore {
            dir: dir.to_path_buf(),
            bucket_size: options.coords_bucket_size,
            sync_on_close: options.sync_on_close,
            buckets: RwLock::new(LruCache::new(open_buckets)),
            closed: false,
        };
        log::info!(
            "Opened coordinate cache at {} with {} existing buckets",
            dir.display(),
            store.bucket_count()
        );
        Ok(store)
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    /// Number of bucket files on disk.
    pub fn bucket_count(&self) -> usize {
        WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().map_or(false, |ext| ext == BUCKET_EXTENSION)
            })
            .count()
    }

    pub fn put(&self, coord: &Coord) -> Result<()> {
        let (bucket_idx, slot) = self.locate_for_write(coord)?;
        let bucket = self.writable_bucket(bucket_idx)?;
        bucket.write_slot(slot, coord);
        Ok(())
    }

    /// Store a batch, reusing the bucket handle while consecutive ids share a bucket.
    pub fn put_all(&self, coords: &[Coord]) -> Result<()> {
        let mut current: Option<(u64, Arc<Bucket>)> = None;
        for coord in coords {
            let (bucket_idx, slot) = self.locate_for_write(coord)?;
            let bucket = match current.take() {
                Some((idx, bucket)) if idx == bucket_idx => bucket,
                _ => self.writable_bucket(bucket_idx)?,
            };
            bucket.write_slot(slot, coord);
            current = Some((bucket_idx, bucket));
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<Coord>> {
        let Some((bucket_idx, slot)) = locate(id, self.bucket_size) else {
            return Ok(None);
        };
        match self.existing_bucket(bucket_idx)? {
            Some(bucket) => bucket.read_slot(id, slot),
            None => Ok(None),
        }
    }

    /// Flush all mapped buckets and release them.
    pub fn close(mut self) -> Result<()> {
        self.release_buckets()?;
        self.closed = true;
        log::info!("Closed coordinate cache at {}", self.dir.display());
        Ok(())
    }

    fn release_buckets(&mut self) -> Result<()> {
        let buckets = self.buckets.get_mut().unwrap_or_else(PoisonError::into_inner);
        while let Some((_idx, bucket)) = buckets.pop_lru() {
            bucket.flush(self.sync_on_close)?;
        }
        Ok(())
    }

    /// Address of a coordinate about to be written.
    ///
    /// Values outside WGS84 bounds would not survive the fixed-point encoding.
    fn locate_for_write(&self, coord: &Coord) -> Result<(u64, usize)> {
        ensure!(
            coord.is_valid(),
            InvalidCoordSnafu {
                id: coord.id,
                lon: coord.lon,
                lat: coord.lat
            }
        );
        locate(coord.id, self.bucket_size).context(InvalidIdSnafu { id: coord.id })
    }

    fn bucket_path(&self, bucket_idx: u64) -> PathBuf {
        self.dir
            .join(format!("bucket-{bucket_idx:010}.{BUCKET_EXTENSION}"))
    }

    fn bucket_len(&self) -> u64 {
        self.bucket_size * COORD_RECORD_LEN as u64
    }

    fn existing_bucket(&self, bucket_idx: u64) -> Result<Option<Arc<Bucket>>> {
        if let Some(bucket) = self.resident_bucket(bucket_idx) {
            return Ok(Some(bucket));
        }
        match Bucket::open(self.bucket_path(bucket_idx), self.bucket_len())? {
            Some(bucket) => self.cache_bucket(bucket_idx, bucket).map(Some),
            None => Ok(None),
        }
    }

    fn writable_bucket(&self, bucket_idx: u64) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.resident_bucket(bucket_idx) {
            return Ok(bucket);
        }
        let bucket = Bucket::create(self.bucket_path(bucket_idx), self.bucket_len())?;
        self.cache_bucket(bucket_idx, bucket)
    }

    /// Look up a mapped bucket without blocking other readers.
    fn resident_bucket(&self, bucket_idx: u64) -> Option<Arc<Bucket>> {
        let bucket = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(&bucket_idx)
            .cloned()?;
        // Recency is only a hint, skip it when someone else holds the lock.
        if let Ok(mut buckets) = self.buckets.try_write() {
            buckets.promote(&bucket_idx);
        }
        Some(bucket)
    }

    /// Insert a freshly mapped bucket, unless another thread mapped it first.
    fn cache_bucket(&self, bucket_idx: u64, bucket: Bucket) -> Result<Arc<Bucket>> {
        let (bucket, evicted) = {
            let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = buckets.get(&bucket_idx) {
                return Ok(existing.clone());
            }
            let bucket = Arc::new(bucket);
            let evicted = buckets.push(bucket_idx, bucket.clone());
            (bucket, evicted)
        };
        if let Some((evicted_idx, evicted)) = evicted {
            log::trace!("Unmapping coordinate bucket {evicted_idx}");
            evicted.flush(false)?;
        }
        Ok(bucket)
    }
}

impl Drop for CoordBlockStore {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.release_buckets() {
                log::error!(
                    "Could not flush coordinate cache at {}: {e}",
                    self.dir.display()
                );
            }
        }
    }
}

struct Bucket {
    path: PathBuf,
    map: RwLock<MmapMut>,
}

impl Bucket {
    fn create(path: PathBuf, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let actual_len = file.metadata().context(IoSnafu { path: &path })?.len();
        if actual_len == 0 {
            log::debug!("Creating coordinate bucket {}", path.display());
            // Unwritten slots stay holes on file systems with sparse file support.
            file.set_len(len).context(IoSnafu { path: &path })?;
        }
        Self::map(path, file, len)
    }

    fn open(path: PathBuf, len: u64) -> Result<Option<Self>> {
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Self::map(path, file, len).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(IoSnafu { path: &path }),
        }
    }

    fn map(path: PathBuf, file: File, len: u64) -> Result<Self> {
        let actual_len = file.metadata().context(IoSnafu { path: &path })?.len();
        ensure!(
            actual_len == len,
            CorruptRecordSnafu {
                description: format!(
                    "bucket {} has {actual_len} bytes, expected {len}",
                    path.display()
                )
            }
        );
        let map = unsafe { MmapOptions::new().map_mut(&file) }.context(IoSnafu { path: &path })?;
        Ok(Bucket {
            path,
            map: RwLock::new(map),
        })
    }

    fn read_slot(&self, id: i64, slot: usize) -> Result<Option<Coord>> {
        let offset = slot * COORD_RECORD_LEN;
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        decode_coord(id, &map[offset..offset + COORD_RECORD_LEN])
    }

    fn write_slot(&self, slot: usize, coord: &Coord) {
        let offset = slot * COORD_RECORD_LEN;
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        encode_coord(coord, &mut map[offset..offset + COORD_RECORD_LEN]);
    }

    fn flush(&self, sync: bool) -> Result<()> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        let res = if sync { map.flush() } else { map.flush_async() };
        res.context(IoSnafu { path: &self.path })
    }
}

fn check_or_write_meta(dir: &Path, bucket_size: u64) -> Result<()> {
    let path = dir.join(META_FILE);
    match std::fs::read(&path) {
        Ok(data) => {
            let found = parse_meta(&path, &data)?;
            ensure!(
                found == bucket_size,
                BucketSizeMismatchSnafu {
                    expected: bucket_size,
                    found
                }
            );
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut data = Vec::with_capacity(META_LEN);
            data.put_slice(META_MAGIC);
            data.put_u32(META_VERSION);
            data.put_u64(bucket_size);
            data.put_u32(COORD_RECORD_LEN as u32);
            std::fs::write(&path, data).context(IoSnafu { path: &path })
        }
        Err(e) => Err(e).context(IoSnafu { path: &path }),
    }
}

fn parse_meta(path: &Path, data: &[u8]) -> Result<u64> {
    ensure!(
        data.len() == META_LEN && data.starts_with(META_MAGIC),
        CorruptIndexSnafu {
            path,
            description: "not a coordinate cache meta file"
        }
    );
    let mut buf = &data[META_MAGIC.len()..];
    let version = buf.get_u32();
    ensure!(
        version == META_VERSION,
        CorruptIndexSnafu {
            path,
            description: format!("unsupported format version {version}")
        }
    );
    let bucket_size = buf.get_u64();
    let record_len = buf.get_u32();
    ensure!(
        record_len as usize == COORD_RECORD_LEN,
        CorruptIndexSnafu {
            path,
            description: format!("unsupported record length {record_len}")
        }
    );
    Ok(bucket_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::cache_dir;
    use approx::assert_abs_diff_eq;

    fn small_options() -> CacheOptions {
        CacheOptions::default()
            .with_bucket_size(16)
            .with_open_buckets(2)
    }

    #[test]
    fn test_locate() {
        assert_eq!(Some((0, 0)), locate(0, 16));
        assert_eq!(Some((0, 15)), locate(15, 16));
        assert_eq!(Some((1, 0)), locate(16, 16));
        assert_eq!(Some((62500, 1)), locate(1_000_001, 16));
        assert_eq!(None, locate(-1, 16));
    }

    #[test]
    fn test_put_get() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        let coord = Coord::new(3, 13.4049539, 52.5200066);
        store.put(&coord).expect("put");
        let read = store.get(3).expect("get").expect("present");
        assert_eq!(3, read.id);
        assert_abs_diff_eq!(13.4049539, read.lon, epsilon = 1e-9);
        assert_abs_diff_eq!(52.5200066, read.lat, epsilon = 1e-9);
        // same bucket, never written
        assert_eq!(None, store.get(4).expect("get"));
        // bucket that doesn't exist
        assert_eq!(None, store.get(1000).expect("get"));
        assert_eq!(None, store.get(-3).expect("get"));
        assert_eq!(1, store.bucket_count());
        store.close().expect("close");
    }

    #[test]
    fn test_get_does_not_create_buckets() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        for id in 0..100 {
            assert_eq!(None, store.get(id).expect("get"));
        }
        assert_eq!(0, store.bucket_count());
    }

    #[test]
    fn test_zero_coord_is_present() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        store.put(&Coord::new(5, 0.0, 0.0)).expect("put");
        assert_eq!(Some(Coord::new(5, 0.0, 0.0)), store.get(5).expect("get"));
        assert_eq!(None, store.get(6).expect("get"));
    }

    #[test]
    fn test_overwrite() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        store.put(&Coord::new(9, 1.0, 2.0)).expect("put");
        store.put(&Coord::new(9, -3.5, -4.25)).expect("put");
        assert_eq!(Some(Coord::new(9, -3.5, -4.25)), store.get(9).expect("get"));
    }

    #[test]
    fn test_out_of_range_coord_is_rejected() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        let err = store.put(&Coord::new(3, f64::NAN, 500.0)).expect_err("NaN");
        assert!(matches!(err, crate::CacheError::InvalidCoord { id: 3, .. }));
        let err = store
            .put_all(&[Coord::new(4, 1.0, 1.0), Coord::new(5, 181.0, 0.0)])
            .expect_err("out of range");
        assert!(matches!(err, crate::CacheError::InvalidCoord { id: 5, .. }));
        assert_eq!(None, store.get(3).expect("get"));
        assert_eq!(None, store.get(5).expect("get"));
        assert_eq!(Some(Coord::new(4, 1.0, 1.0)), store.get(4).expect("get"));
        store.put(&Coord::new(6, -180.0, 90.0)).expect("bounds are inclusive");
    }

    #[test]
    fn test_negative_id_is_rejected() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        let err = store.put(&Coord::new(-1, 1.0, 1.0)).expect_err("negative id");
        assert!(matches!(err, crate::CacheError::InvalidId { id: -1, .. }));
    }

    #[test]
    fn test_many_buckets_with_eviction() {
        let dir = cache_dir();
        let coords: Vec<Coord> = (0..200)
            .map(|i| Coord::new(i, (i as f64) / 10.0, -(i as f64) / 20.0))
            .collect();
        {
            let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
            store.put_all(&coords).expect("put");
            // 200 ids over 16 slots each, while only 2 stay mapped
            assert_eq!(13, store.bucket_count());
            for coord in coords.iter() {
                assert_eq!(Some(*coord), store.get(coord.id).expect("get"));
            }
            store.close().expect("close");
        }
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("reopen");
        for coord in coords.iter().rev() {
            assert_eq!(Some(*coord), store.get(coord.id).expect("get"));
        }
    }

    #[test]
    fn test_drop_flushes() {
        let dir = cache_dir();
        {
            let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
            store.put(&Coord::new(42, 7.0, 8.0)).expect("put");
        }
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("reopen");
        assert_eq!(Some(Coord::new(42, 7.0, 8.0)), store.get(42).expect("get"));
    }

    #[test]
    fn test_bucket_size_mismatch() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        store.close().expect("close");
        let err = CoordBlockStore::open(dir.path(), &small_options().with_bucket_size(32))
            .err()
            .expect("mismatch");
        assert!(matches!(
            err,
            crate::CacheError::BucketSizeMismatch {
                expected: 32,
                found: 16,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_options() {
        let dir = cache_dir();
        let res = CoordBlockStore::open(dir.path(), &small_options().with_bucket_size(0));
        assert!(matches!(res, Err(crate::CacheError::InvalidOptions { .. })));
        let res = CoordBlockStore::open(dir.path(), &small_options().with_open_buckets(0));
        assert!(matches!(res, Err(crate::CacheError::InvalidOptions { .. })));
        // nothing was written for the rejected options
        assert!(!dir.path().join(META_FILE).exists());
        let store = CoordBlockStore::open(dir.path(), &small_options().with_open_buckets(1))
            .expect("open");
        store.put(&Coord::new(1, 1.0, 1.0)).expect("put");
        store.put(&Coord::new(100, 1.0, 1.0)).expect("put");
        assert!(store.get(1).expect("get").is_some());
    }

    #[test]
    fn test_parallel_readers_share_buckets() {
        use rayon::prelude::*;

        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options().with_open_buckets(3))
            .expect("open");
        let coords: Vec<Coord> = (0..160)
            .map(|i| Coord::new(i, (i as f64) / 8.0, 1.0))
            .collect();
        store.put_all(&coords).expect("put");
        // ten buckets behind three mapped slots, so readers race on misses
        (0..4000usize).into_par_iter().for_each(|i| {
            let coord = coords[(i * 37) % coords.len()];
            assert_eq!(Some(coord), store.get(coord.id).expect("get"));
        });
        assert!(store.buckets.read().expect("lock").len() <= 3);
        store.close().expect("close");
    }

    #[test]
    fn test_corrupt_meta() {
        let dir = cache_dir();
        std::fs::write(dir.path().join(META_FILE), b"garbage").expect("write");
        let res = CoordBlockStore::open(dir.path(), &small_options());
        assert!(matches!(res, Err(crate::CacheError::CorruptIndex { .. })));
    }

    #[test]
    fn test_truncated_bucket() {
        let dir = cache_dir();
        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("open");
        store.put(&Coord::new(1, 1.0, 1.0)).expect("put");
        let path = store.bucket_path(0);
        store.close().expect("close");

        let file = OpenOptions::new().write(true).open(&path).expect("open bucket");
        file.set_len(20).expect("truncate");
        drop(file);

        let store = CoordBlockStore::open(dir.path(), &small_options()).expect("reopen");
        let err = store.get(1).expect_err("truncated bucket");
        assert!(err.is_corruption());
    }
}
