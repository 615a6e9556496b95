//! AVALON - Segment Files
//! Immutable on-disk snapshots of retired memtables, tagged with their key range.
//!
//! Segments are created once by the flush worker and never modified or
//! deleted afterwards. The key range sits in front of the body so range
//! pruning only has to decode two small records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AvalonError, Result};
use crate::types::{KeyOrder, Lookup};

use super::memtable::MemTable;

/// First bytes of every segment file.
pub const SEGMENT_MAGIC: &[u8; 4] = b"AVSG";

/// Suffix of a segment that is still being written.
const TMP_SUFFIX: &str = ".tmp";

/// Length prefix plus trailing checksum.
const RECORD_OVERHEAD: u64 = 8 + 4;

/// Name of the segment with the given index.
pub fn segment_file_name(prefix: &str, index: u64) -> String {
    format!("{prefix}{index}")
}

/// Parse `{prefix}{digits}`; anything else is not a segment.
/// Leading zeros are rejected so every index has exactly one file name.
pub fn parse_segment_index(prefix: &str, file_name: &str) -> Option<u64> {
    let digits = file_name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// Encode one record.
///
/// ## Binary Format
/// ```text
/// [len: 8 bytes (LE)][payload: len bytes (bincode)][crc: 4 bytes (LE), over len + payload]
/// ```
fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Read one record and verify its checksum. `limit` bounds the payload length
/// so a damaged length prefix cannot trigger a huge allocation.
fn read_record<R: Read>(reader: &mut R, limit: u64, what: &str) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > limit {
        return Err(AvalonError::Corruption(format!(
            "{what} record claims {len} bytes, file holds at most {limit}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_bytes);
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(AvalonError::Corruption(format!("{what} checksum mismatch")));
    }
    Ok(payload)
}

fn read_magic<R: Read>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != SEGMENT_MAGIC {
        return Err(AvalonError::Corruption("not a segment file".into()));
    }
    Ok(())
}

/// Handle to one immutable segment file with its key range cached in memory.
#[derive(Debug, Clone)]
pub struct Segment<K> {
    index: u64,
    path: PathBuf,
    min_key: K,
    max_key: K,
    file_size: u64,
}

impl<K> Segment<K> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_key(&self) -> &K {
        &self.min_key
    }

    pub fn max_key(&self) -> &K {
        &self.max_key
    }

    /// Returns the file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Range test used to skip segments on the read path.
    /// Both ends are inclusive: the recorded max key lives in this segment.
    pub fn may_contain<C: KeyOrder<K>>(&self, key: &K, order: &C) -> bool {
        order.compare(key, &self.min_key).is_ge() && order.compare(key, &self.max_key).is_le()
    }
}

impl<K: Serialize + DeserializeOwned + Clone> Segment<K> {
    /// Persist `table` as segment `index` in `dir`.
    ///
    /// The file is written under a temporary name, fsynced, then renamed,
    /// so a segment is only ever visible once its write has completed.
    pub fn create<V, C>(dir: &Path, prefix: &str, index: u64, table: &MemTable<K, V, C>) -> Result<Self>
    where
        V: Serialize,
    {
        if !dir.is_dir() {
            return Err(AvalonError::StorageDir {
                path: dir.to_path_buf(),
                reason: "missing or not a directory".into(),
            });
        }
        let (Some(min_key), Some(max_key)) = (table.first_key(), table.last_key()) else {
            return Err(AvalonError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment {index}: cannot persist an empty memtable"),
            )));
        };

        let name = segment_file_name(prefix, index);
        let path = dir.join(&name);
        if path.exists() {
            return Err(AvalonError::SegmentCreate {
                path,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "segment index already taken"),
            });
        }

        let tmp_path = dir.join(format!("{name}{TMP_SUFFIX}"));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| AvalonError::SegmentCreate {
                path: tmp_path.clone(),
                source,
            })?;

        let written = Self::write_body(file, min_key, max_key, table)
            .and_then(|()| fs::rename(&tmp_path, &path).map_err(AvalonError::from));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        let file_size = fs::metadata(&path)?.len();
        Ok(Self {
            index,
            path,
            min_key: min_key.clone(),
            max_key: max_key.clone(),
            file_size,
        })
    }

    fn write_body<V: Serialize, C>(
        file: File,
        min_key: &K,
        max_key: &K,
        table: &MemTable<K, V, C>,
    ) -> Result<()> {
        let mut writer = BufWriter::new(file);
        writer.write_all(SEGMENT_MAGIC)?;
        writer.write_all(&encode_record(&bincode::serialize(min_key)?))?;
        writer.write_all(&encode_record(&bincode::serialize(max_key)?))?;
        writer.write_all(&encode_record(&bincode::serialize(table)?))?;
        writer.flush()?;
        writer.get_ref().sync_all()?; // fsync before the rename publishes it
        Ok(())
    }

    /// Open an existing segment, reading only its magic and key range.
    pub fn open(path: PathBuf, index: u64) -> Result<Self> {
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        read_magic(&mut reader)?;
        let min_key = bincode::deserialize(&read_record(&mut reader, file_size, "min key")?)?;
        let max_key = bincode::deserialize(&read_record(&mut reader, file_size, "max key")?)?;

        Ok(Self {
            index,
            path,
            min_key,
            max_key,
            file_size,
        })
    }

    /// Read and decode the full memtable stored in this segment.
    pub fn load<V, C>(&self, order: &C) -> Result<MemTable<K, V, C>>
    where
        V: DeserializeOwned,
        C: Default + Clone,
    {
        let mut reader = BufReader::new(File::open(&self.path)?);
        read_magic(&mut reader)?;
        read_record(&mut reader, self.file_size, "min key")?;
        read_record(&mut reader, self.file_size, "max key")?;
        let body = read_record(&mut reader, self.file_size, "memtable")?;

        let mut table: MemTable<K, V, C> = bincode::deserialize(&body)?;
        if !table.is_well_formed() {
            return Err(AvalonError::Corruption(format!(
                "segment {} holds a malformed tree",
                self.index
            )));
        }
        table.set_order(order.clone());
        Ok(table)
    }

    /// Probe this segment for `key`. A tombstone comes back as `Lookup::Deleted`.
    pub fn get<V, C>(&self, key: &K, order: &C) -> Result<Lookup<V>>
    where
        V: DeserializeOwned + Clone,
        C: KeyOrder<K> + Default + Clone,
    {
        let table = self.load::<V, C>(order)?;
        Ok(table.lookup(key).map(V::clone))
    }
}

/// Result of scanning a storage directory at startup.
#[derive(Debug)]
pub struct Discovery<K> {
    /// Readable segments, oldest (lowest index) first.
    pub segments: Vec<Segment<K>>,
    /// One past the highest index seen, readable or not.
    pub next_index: u64,
}

/// Find the segments in `dir`, ordered by index.
///
/// Unreadable segments are skipped with a warning but still reserve their
/// index. Leftover temporary files from an interrupted flush are removed.
pub fn discover<K>(dir: &Path, prefix: &str) -> Result<Discovery<K>>
where
    K: Serialize + DeserializeOwned + Clone,
{
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if let Some(stem) = name.strip_suffix(TMP_SUFFIX) {
            if parse_segment_index(prefix, stem).is_some() {
                log::warn!("Removing unfinished segment {:?}", entry.path());
                if let Err(e) = fs::remove_file(entry.path()) {
                    log::warn!("Could not remove {:?}: {}", entry.path(), e);
                }
            }
            continue;
        }

        if let Some(index) = parse_segment_index(prefix, name) {
            found.push((index, entry.path()));
        }
    }

    found.sort_by_key(|(index, _)| *index);
    let next_index = found.last().map_or(0, |(index, _)| index + 1);

    let mut segments = Vec::with_capacity(found.len());
    for (index, path) in found {
        match Segment::open(path.clone(), index) {
            Ok(segment) => segments.push(segment),
            Err(e) => log::warn!("Skipping unreadable segment {:?}: {}", path, e),
        }
    }

    Ok(Discovery {
        segments,
        next_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NaturalOrder, ReverseOrder};

    fn sample_table() -> MemTable<u32, String> {
        let mut table = MemTable::new();
        for k in [10, 20, 30, 40] {
            table.insert(k, format!("v{k}"));
        }
        table.delete(&30);
        table
    }

    fn flip_byte(path: &Path, offset_from_end: usize) {
        let mut bytes = fs::read(path).unwrap();
        let at = bytes.len() - offset_from_end;
        bytes[at] ^= 0xFF;
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_parse_segment_index() {
        assert_eq!(parse_segment_index("segment_", "segment_0"), Some(0));
        assert_eq!(parse_segment_index("segment_", "segment_12"), Some(12));
        assert_eq!(parse_segment_index("segment_", "segment_"), None);
        assert_eq!(parse_segment_index("segment_", "segment_1a"), None);
        assert_eq!(parse_segment_index("segment_", "segment_-1"), None);
        assert_eq!(parse_segment_index("segment_", "segment_3.tmp"), None);
        assert_eq!(parse_segment_index("segment_", "other_3"), None);
        assert_eq!(parse_segment_index("segment_", "segment_01"), None);
        assert_eq!(parse_segment_index("segment_", "segment_00"), None);
        assert_eq!(parse_segment_index("segment_", "segment_10"), Some(10));
        assert_eq!(segment_file_name("segment_", 7), "segment_7");
    }

    #[test]
    fn test_create_then_open_header() {
        let dir = tempfile::tempdir().unwrap();
        let created = Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        assert_eq!(created.path(), dir.path().join("seg0"));
        assert_eq!(created.min_key(), &10);
        assert_eq!(created.max_key(), &40);
        assert!(created.file_size() > 0);

        let opened: Segment<u32> = Segment::open(dir.path().join("seg0"), 0).unwrap();
        assert_eq!(opened.min_key(), &10);
        assert_eq!(opened.max_key(), &40);
        assert_eq!(opened.file_size(), created.file_size());
        assert!(!dir.path().join("seg0.tmp").exists());
    }

    #[test]
    fn test_range_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        assert!(segment.may_contain(&10, &NaturalOrder));
        assert!(segment.may_contain(&25, &NaturalOrder));
        assert!(segment.may_contain(&40, &NaturalOrder));
        assert!(!segment.may_contain(&9, &NaturalOrder));
        assert!(!segment.may_contain(&41, &NaturalOrder));
    }

    #[test]
    fn test_range_follows_injected_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = MemTable::with_order(ReverseOrder);
        table.insert(1u32, ());
        table.insert(9u32, ());
        let segment = Segment::create(dir.path(), "seg", 0, &table).unwrap();
        assert_eq!(segment.min_key(), &9);
        assert_eq!(segment.max_key(), &1);
        assert!(segment.may_contain(&5, &ReverseOrder));
        assert!(!segment.may_contain(&10, &ReverseOrder));
    }

    #[test]
    fn test_get_found_deleted_missing() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        let found: Lookup<String> = segment.get(&20, &NaturalOrder).unwrap();
        assert_eq!(found, Lookup::Found("v20".to_string()));
        assert_eq!(segment.get::<String, _>(&30, &NaturalOrder).unwrap(), Lookup::Deleted);
        assert_eq!(segment.get::<String, _>(&25, &NaturalOrder).unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_load_keeps_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::create(dir.path(), "seg", 3, &sample_table()).unwrap();
        let table: MemTable<u32, String> = segment.load(&NaturalOrder).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.hidden_len(), 4);
    }

    #[test]
    fn test_create_refuses_taken_index() {
        let dir = tempfile::tempdir().unwrap();
        Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        let err = Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap_err();
        assert!(matches!(err, AvalonError::SegmentCreate { .. }));
    }

    #[test]
    fn test_create_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = Segment::create(&missing, "seg", 0, &sample_table()).unwrap_err();
        assert!(matches!(err, AvalonError::StorageDir { .. }));
    }

    #[test]
    fn test_create_rejects_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let empty: MemTable<u32, String> = MemTable::new();
        assert!(matches!(
            Segment::create(dir.path(), "seg", 0, &empty),
            Err(AvalonError::Io(_))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupted_body_detected() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        flip_byte(segment.path(), 5); // last payload byte of the body
        // header still opens, body is rejected
        let reopened: Segment<u32> = Segment::open(segment.path().to_path_buf(), 0).unwrap();
        let err = reopened.get::<String, _>(&20, &NaturalOrder).unwrap_err();
        assert!(matches!(err, AvalonError::Corruption(_)));
    }

    #[test]
    fn test_corrupted_header_detected() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        let mut bytes = fs::read(segment.path()).unwrap();
        bytes[4 + 8] ^= 0xFF; // first payload byte of the min key
        fs::write(segment.path(), bytes).unwrap();
        let err = Segment::<u32>::open(segment.path().to_path_buf(), 0).unwrap_err();
        assert!(matches!(err, AvalonError::Corruption(_)));
    }

    #[test]
    fn test_bad_magic_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0");
        fs::write(&path, b"NOPE and more bytes").unwrap();
        let err = Segment::<u32>::open(path, 0).unwrap_err();
        assert!(matches!(err, AvalonError::Corruption(_)));
    }

    #[test]
    fn test_discover_orders_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for index in [2, 10, 1] {
            Segment::create(dir.path(), "seg", index, &sample_table()).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        fs::write(dir.path().join("seg"), b"no digits").unwrap();
        fs::create_dir(dir.path().join("seg99")).unwrap();
        // a zero-padded copy would alias index 2
        fs::copy(dir.path().join("seg2"), dir.path().join("seg02")).unwrap();

        let found: Discovery<u32> = discover(dir.path(), "seg").unwrap();
        let indices: Vec<u64> = found.segments.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![1, 2, 10]);
        assert_eq!(found.next_index, 11);
    }

    #[test]
    fn test_discover_skips_unreadable_but_reserves_index() {
        let dir = tempfile::tempdir().unwrap();
        Segment::create(dir.path(), "seg", 0, &sample_table()).unwrap();
        fs::write(dir.path().join("seg5"), b"garbage").unwrap();
        fs::write(dir.path().join("seg6.tmp"), b"half written").unwrap();

        let found: Discovery<u32> = discover(dir.path(), "seg").unwrap();
        assert_eq!(found.segments.len(), 1);
        assert_eq!(found.next_index, 6);
        assert!(!dir.path().join("seg6.tmp").exists());
    }

    #[test]
    fn test_discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let found: Discovery<u32> = discover(dir.path(), "seg").unwrap();
        assert!(found.segments.is_empty());
        assert_eq!(found.next_index, 0);
    }
}
