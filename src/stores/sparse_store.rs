//! Id-keyed storage for variable-size records.
//!
//! Records are appended to `data.log` as `[len: u32][payload]` frames. An
//! in-memory index maps ids to the payload position and is written to
//! `index.bin` on close:
//!
//! ```text
//! [magic: 8][version: u32][covered log length: u64][#entries: u64]
//! [(id: i64, offset: u64, len: u32)...]
//! ```
//!
//! On open the index is only trusted if it covers exactly the current log.
//! Otherwise it is rebuilt by replaying the log.
use super::{ensure_dir, read_exact_at};
use crate::{
    codec::{peek_id, VarSizeSerde},
    CacheOptions,
    CorruptIndexSnafu,
    CorruptRecordSnafu,
    IoSnafu,
    RecordTooLargeSnafu,
    Result,
};
use bytes::BufMut;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;
use rustc_hash::FxHashMap;
use snafu::prelude::*;
use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

const LOG_FILE: &str = "data.log";
const INDEX_FILE: &str = "index.bin";
const INDEX_TMP_FILE: &str = "index.bin.tmp";
const INDEX_MAGIC: &[u8; 8] = b"OSMINDEX";
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_LEN: u64 = 8 + 4 + 8 + 8;
const INDEX_ENTRY_LEN: u64 = 8 + 8 + 4;
const FRAME_HEADER_LEN: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Location {
    /// Start of the payload, after the frame header.
    offset: u64,
    len: u32,
}

impl Location {
    fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

type Index = FxHashMap<i64, Location>;

struct LogWriter {
    file: File,
    len: u64,
    /// Set when a failed write could not be rolled back. The end of the file
    /// is unknown from then on, so no further frames are accepted.
    broken: bool,
}

impl LogWriter {
    fn new(file: File, len: u64) -> Self {
        LogWriter {
            file,
            len,
            broken: false,
        }
    }

    /// Append a frame and return the offset of its payload.
    ///
    /// A failed write is rolled back, so the log never ends in a partial frame.
    fn append(&mut self, frame: &[u8], path: &Path) -> Result<u64> {
        if self.broken {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "log ends in a partial frame after a failed write",
            ))
            .context(IoSnafu { path });
        }
        if let Err(e) = self.file.write_all(frame) {
            if let Err(truncate_error) = self.file.set_len(self.len) {
                log::error!(
                    "Could not roll back partial write to {}, refusing further writes: {truncate_error}",
                    path.display()
                );
                self.broken = true;
            }
            return Err(e).context(IoSnafu { path });
        }
        let offset = self.len + FRAME_HEADER_LEN;
        self.len += frame.len() as u64;
        Ok(offset)
    }
}

pub struct SparseStore<T> {
    dir: PathBuf,
    log_path: PathBuf,
    writer: Mutex<LogWriter>,
    reader: File,
    index: RwLock<Index>,
    sync_on_close: bool,
    closed: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T> SparseStore<T>
where
    T: VarSizeSerde,
{
    pub fn open(dir: &Path, options: &CacheOptions) -> Result<Self> {
        ensure_dir(dir)?;
        let log_path = dir.join(LOG_FILE);
        let log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .context(IoSnafu { path: &log_path })?;
        let mut log_len = log_file
            .metadata()
            .context(IoSnafu { path: &log_path })?
            .len();

        let index_path = dir.join(INDEX_FILE);
        let persisted = match load_index(&index_path, log_len) {
            Ok(index) => index,
            Err(e) if e.is_corruption() => {
                log::warn!("Ignoring unreadable index: {e}");
                None
            }
            Err(e) => return Err(e),
        };
        let index = match persisted {
            Some(index) => index,
            None if log_len == 0 => Index::default(),
            None => {
                log::warn!(
                    "Rebuilding index for {} from its log",
                    dir.display()
                );
                let (index, valid_len) = replay_log(&log_path, log_len)?;
                if valid_len < log_len {
                    log::warn!(
                        "Dropping {} bytes of incomplete data at the end of {}",
                        log_len - valid_len,
                        log_path.display()
                    );
                    log_file
                        .set_len(valid_len)
                        .context(IoSnafu { path: &log_path })?;
                    log_len = valid_len;
                }
                index
            }
        };

        let reader = log_file.try_clone().context(IoSnafu { path: &log_path })?;
        log::info!(
            "Opened element cache at {} with {} records",
            dir.display(),
            index.len()
        );
        Ok(SparseStore {
            dir: dir.to_path_buf(),
            log_path,
            writer: Mutex::new(LogWriter::new(log_file, log_len)),
            reader,
            index: RwLock::new(index),
            sync_on_close: options.sync_on_close,
            closed: false,
            _record: PhantomData,
        })
    }

    /// Number of distinct ids in the store.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.index().contains_key(&id)
    }

    /// Size of the log in bytes, including overwritten records.
    pub fn log_size(&self) -> u64 {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).len
    }

    pub fn put(&self, record: &T) -> Result<()> {
        let id = record.id();
        let payload = record.to_bytes();
        let len = u32::try_from(payload.len())
            .ok()
            .context(RecordTooLargeSnafu {
                id,
                len: payload.len(),
            })?;
        let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
        frame.put_u32(len);
        frame.put_slice(&payload);

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = writer.append(&frame, &self.log_path)?;
        // Still holding the writer, so concurrent puts of one id keep log order.
        self.index_mut().insert(id, Location { offset, len });
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<T>> {
        let Some(location) = self.index().get(&id).copied() else {
            return Ok(None);
        };
        let record = self.read_record(id, location)?;
        Ok(Some(record))
    }

    /// All records in the order they were written.
    ///
    /// Works on a snapshot of the index taken when called.
    pub fn iter(&self) -> SparseIter<'_, T> {
        let locations: Vec<(i64, Location)> = self
            .index()
            .iter()
            .map(|(id, location)| (*id, *location))
            .sorted_by_key(|(_, location)| location.offset)
            .collect();
        SparseIter {
            store: self,
            locations: locations.into_iter(),
        }
    }

    /// Sync the log and persist the index.
    pub fn close(mut self) -> Result<()> {
        self.persist()?;
        self.closed = true;
        log::info!("Closed element cache at {}", self.dir.display());
        Ok(())
    }

    fn read_record(&self, id: i64, location: Location) -> Result<T> {
        let mut data = vec![0u8; location.len as usize];
        read_exact_at(&self.reader, &mut data, location.offset)
            .context(IoSnafu { path: &self.log_path })?;
        let record = T::deser_from(&data)?;
        ensure!(
            record.id() == id,
            CorruptRecordSnafu {
                description: format!(
                    "index entry for {id} points at record {} in {}",
                    record.id(),
                    self.log_path.display()
                )
            }
        );
        Ok(record)
    }

    fn persist(&self) -> Result<()> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.sync_on_close {
            writer
                .file
                .sync_data()
                .context(IoSnafu { path: &self.log_path })?;
        }
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        write_index(&self.dir, &index, writer.len, self.sync_on_close)?;
        log::debug!(
            "Persisted {} index entries covering {} bytes of {}",
            index.len(),
            writer.len,
            self.log_path.display()
        );
        Ok(())
    }

    fn index(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for SparseStore<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = write_index(&self.dir, &index, writer.len, self.sync_on_close) {
            log::error!(
                "Could not persist index of {} on drop: {e}",
                self.dir.display()
            );
        }
    }
}

pub struct SparseIter<'a, T> {
    store: &'a SparseStore<T>,
    locations: std::vec::IntoIter<(i64, Location)>,
}

impl<'a, T> Iterator for SparseIter<'a, T>
where
    T: VarSizeSerde,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, location) = self.locations.next()?;
        Some(self.store.read_record(id, location))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.locations.size_hint()
    }
}

/// Write the index next to the log, replacing any previous one atomically.
fn write_index(dir: &Path, index: &Index, log_len: u64, sync: bool) -> Result<()> {
    let tmp_path = dir.join(INDEX_TMP_FILE);
    let path = dir.join(INDEX_FILE);
    let file = File::create(&tmp_path).context(IoSnafu { path: &tmp_path })?;
    let mut out = BufWriter::new(file);
    let write_all = |out: &mut BufWriter<File>| -> io::Result<()> {
        out.write_all(INDEX_MAGIC)?;
        out.write_u32::<BigEndian>(INDEX_VERSION)?;
        out.write_u64::<BigEndian>(log_len)?;
        out.write_u64::<BigEndian>(index.len() as u64)?;
        for (id, location) in index.iter().sorted_by_key(|(id, _)| **id) {
            out.write_i64::<BigEndian>(*id)?;
            out.write_u64::<BigEndian>(location.offset)?;
            out.write_u32::<BigEndian>(location.len)?;
        }
        out.flush()
    };
    write_all(&mut out).context(IoSnafu { path: &tmp_path })?;
    let file = out
        .into_inner()
        .map_err(|e| e.into_error())
        .context(IoSnafu { path: &tmp_path })?;
    if sync {
        file.sync_all().context(IoSnafu { path: &tmp_path })?;
    }
    drop(file);
    std::fs::rename(&tmp_path, &path).context(IoSnafu { path: &path })
}

/// Load a persisted index, if there is one that matches the log.
fn load_index(path: &Path, log_len: u64) -> Result<Option<Index>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(IoSnafu { path }),
    };
    let file_len = file.metadata().context(IoSnafu { path })?.len();
    ensure!(
        file_len >= INDEX_HEADER_LEN,
        CorruptIndexSnafu {
            path,
            description: format!("{file_len} bytes is too short for a header")
        }
    );
    let mut input = BufReader::new(file);
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).context(IoSnafu { path })?;
    ensure!(
        &magic == INDEX_MAGIC,
        CorruptIndexSnafu {
            path,
            description: "not an index file"
        }
    );
    let version = input.read_u32::<BigEndian>().context(IoSnafu { path })?;
    ensure!(
        version == INDEX_VERSION,
        CorruptIndexSnafu {
            path,
            description: format!("unsupported format version {version}")
        }
    );
    let covered_len = input.read_u64::<BigEndian>().context(IoSnafu { path })?;
    if covered_len != log_len {
        log::warn!(
            "Index {} covers {covered_len} bytes of log, but the log has {log_len}",
            path.display()
        );
        return Ok(None);
    }
    let num_entries = input.read_u64::<BigEndian>().context(IoSnafu { path })?;
    ensure!(
        Some(file_len) == num_entries
            .checked_mul(INDEX_ENTRY_LEN)
            .and_then(|len| len.checked_add(INDEX_HEADER_LEN)),
        CorruptIndexSnafu {
            path,
            description: format!("{file_len} bytes does not fit {num_entries} entries")
        }
    );
    let mut index = Index::default();
    index.reserve(num_entries as usize);
    for _i in 0..num_entries {
        let id = input.read_i64::<BigEndian>().context(IoSnafu { path })?;
        let offset = input.read_u64::<BigEndian>().context(IoSnafu { path })?;
        let len = input.read_u32::<BigEndian>().context(IoSnafu { path })?;
        let location = Location { offset, len };
        ensure!(
            location.offset >= FRAME_HEADER_LEN && location.end() <= log_len,
            CorruptIndexSnafu {
                path,
                description: format!("entry for {id} points outside the log")
            }
        );
        index.insert(id, location);
    }
    Ok(Some(index))
}

/// Rebuild the index from the log.
///
/// Returns the index and the length of the log up to the last complete frame.
/// Replay stops at the first frame that is cut short or too small to hold a
/// record, everything from there on is treated as a torn tail.
fn replay_log(path: &Path, log_len: u64) -> Result<(Index, u64)> {
    let file = File::open(path).context(IoSnafu { path })?;
    let mut input = BufReader::new(file);
    let mut index = Index::default();
    let mut position = 0u64;
    let mut id_bytes = [0u8; 8];
    while log_len - position >= FRAME_HEADER_LEN {
        let len = input.read_u32::<BigEndian>().context(IoSnafu { path })?;
        let offset = position + FRAME_HEADER_LEN;
        let location = Location { offset, len };
        if location.end() > log_len || (len as usize) < id_bytes.len() {
            break;
        }
        input.read_exact(&mut id_bytes).context(IoSnafu { path })?;
        let Ok(id) = peek_id(&id_bytes) else {
            break;
        };
        input
            .seek_relative(len as i64 - id_bytes.len() as i64)
            .context(IoSnafu { path })?;
        index.insert(id, location);
        position = location.end();
    }
    Ok((index, position))
}
