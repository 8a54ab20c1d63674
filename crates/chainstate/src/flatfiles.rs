//! Append-only block and undo files.
//!
//! Frames are `magic(4) ‖ size(4 LE) ‖ payload`, optionally followed by a
//! 32-byte trailing checksum (undo records). Files rotate at a fixed size
//! and are unlinked wholesale by pruning.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file_id);
        encoder.write_u64_le(self.offset);
        encoder.write_u32_le(self.len);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            file_id: decoder.read_u32_le()?,
            offset: decoder.read_u64_le()?,
            len: decoder.read_u32_le()?,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(String),
    Corrupt(&'static str),
    Pruned(u32),
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(message) => write!(f, "{message}"),
            FlatFileError::Corrupt(message) => write!(f, "{message}"),
            FlatFileError::Pruned(file_id) => write!(f, "block file {file_id} has been pruned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err.to_string())
    }
}

struct TailState {
    file_id: u32,
    len: u64,
    /// Lengths of files written through `append_at`.
    lengths: std::collections::HashMap<u32, u64>,
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    max_file_size: u64,
    tail: Mutex<TailState>,
}

impl FlatFileStore {
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: &'static str,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut last_id = 0u32;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = parse_file_name(name, prefix) {
                last_id = last_id.max(id);
            }
        }
        let len = fs::metadata(file_path(&dir, prefix, last_id))
            .map(|meta| meta.len())
            .unwrap_or(0);
        Ok(Self {
            dir,
            prefix,
            magic,
            max_file_size,
            tail: Mutex::new(TailState {
                file_id: last_id,
                len,
                lengths: std::collections::HashMap::new(),
            }),
        })
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        file_path(&self.dir, self.prefix, file_id)
    }

    /// Append one frame; returns where the payload landed. The frame
    /// overhead (magic, size, trailer) is not part of `len`.
    pub fn append(
        &self,
        payload: &[u8],
        trailer: Option<&[u8; 32]>,
    ) -> Result<FileLocation, FlatFileError> {
        let mut tail = self.tail.lock().expect("flat file lock poisoned");
        let frame_len = 8 + payload.len() as u64 + trailer.map(|_| 32).unwrap_or(0) as u64;
        if tail.len > 0 && tail.len + frame_len > self.max_file_size {
            tail.file_id += 1;
            tail.len = 0;
        }
        let path = self.file_path(tail.file_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = tail.len + 8;
        file.write_all(&self.magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        if let Some(trailer) = trailer {
            file.write_all(trailer)?;
        }
        let location = FileLocation {
            file_id: tail.file_id,
            offset,
            len: payload.len() as u32,
        };
        tail.len += frame_len;
        Ok(location)
    }

    /// Append one frame to a specific file, ignoring rotation. Undo
    /// records go to the `rev` file paired with the block's `blk` file so
    /// pruning can unlink them together.
    pub fn append_at(
        &self,
        file_id: u32,
        payload: &[u8],
        trailer: Option<&[u8; 32]>,
    ) -> Result<FileLocation, FlatFileError> {
        let mut tail = self.tail.lock().expect("flat file lock poisoned");
        let path = self.file_path(file_id);
        let current_len = match tail.lengths.get(&file_id) {
            Some(len) => *len,
            None => fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0),
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = current_len + 8;
        file.write_all(&self.magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        if let Some(trailer) = trailer {
            file.write_all(trailer)?;
        }
        let frame_len = 8 + payload.len() as u64 + trailer.map(|_| 32).unwrap_or(0) as u64;
        tail.lengths.insert(file_id, current_len + frame_len);
        tail.file_id = tail.file_id.max(file_id);
        Ok(FileLocation {
            file_id,
            offset,
            len: payload.len() as u32,
        })
    }

    /// Read a frame payload back, verifying the magic and length fields.
    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        let path = self.file_path(location.file_id);
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FlatFileError::Pruned(location.file_id));
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(location.offset - 8))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(FlatFileError::Corrupt("bad frame magic"));
        }
        let len = u32::from_le_bytes(header[4..8].try_into().expect("length checked"));
        if len != location.len {
            return Err(FlatFileError::Corrupt("frame length mismatch"));
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read the 32-byte trailer that follows a frame's payload.
    pub fn read_trailer(&self, location: FileLocation) -> Result<[u8; 32], FlatFileError> {
        let path = self.file_path(location.file_id);
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(location.offset + location.len as u64))?;
        let mut trailer = [0u8; 32];
        file.read_exact(&mut trailer)?;
        Ok(trailer)
    }

    /// fsync the file currently being appended to.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let tail = self.tail.lock().expect("flat file lock poisoned");
        let path = self.file_path(tail.file_id);
        if path.exists() {
            File::open(path)?.sync_all()?;
        }
        Ok(())
    }

    pub fn current_file_id(&self) -> u32 {
        self.tail.lock().expect("flat file lock poisoned").file_id
    }

    /// Delete a rotated file; pruning only. Unlinking the tail file is a
    /// caller bug and is refused.
    pub fn unlink(&self, file_id: u32) -> Result<(), FlatFileError> {
        let tail = self.tail.lock().expect("flat file lock poisoned");
        if file_id == tail.file_id {
            return Err(FlatFileError::Corrupt("refusing to unlink active file"));
        }
        drop(tail);
        match fs::remove_file(self.file_path(file_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn file_path(dir: &Path, prefix: &str, file_id: u32) -> PathBuf {
    dir.join(format!("{prefix}{file_id:05}.dat"))
}

fn parse_file_name(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.strip_suffix(".dat")?;
    if digits.len() != 5 {
        return None;
    }
    digits.parse().ok()
}

/// Aggregate statistics for one flat file, keyed by file id in the index
/// database; pruning consults the height range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlatFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub height_min: i32,
    pub height_max: i32,
    pub time_min: u32,
    pub time_max: u32,
}

impl FlatFileInfo {
    pub fn record(&mut self, height: i32, time: u32, frame_size: u64) {
        if self.blocks == 0 {
            self.height_min = height;
            self.height_max = height;
            self.time_min = time;
            self.time_max = time;
        } else {
            self.height_min = self.height_min.min(height);
            self.height_max = self.height_max.max(height);
            self.time_min = self.time_min.min(time);
            self.time_max = self.time_max.max(time);
        }
        self.blocks += 1;
        self.size += frame_size;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(28);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_min);
        encoder.write_i32_le(self.height_max);
        encoder.write_u32_le(self.time_min);
        encoder.write_u32_le(self.time_max);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u64_le()?,
            height_min: decoder.read_i32_le()?,
            height_max: decoder.read_i32_le()?,
            time_min: decoder.read_u32_le()?,
            time_max: decoder.read_u32_le()?,
        };
        decoder.finish()?;
        Ok(info)
    }
}

pub fn file_info_key(file_id: u32) -> [u8; 4] {
    file_id.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::{FlatFileInfo, FlatFileStore};

    #[test]
    fn append_read_roundtrip_with_rotation() {
        let dir = std::env::temp_dir().join(format!("plbd-flatfile-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = FlatFileStore::open(&dir, "blk", *b"TEST", 24).expect("open");

        let first = store.append(b"payload-one", None).expect("append");
        let second = store.append(b"payload-two-is-longer", None).expect("append");
        // Tiny max size forces the second frame into a new file.
        assert_ne!(first.file_id, second.file_id);

        assert_eq!(store.read(first).expect("read"), b"payload-one");
        assert_eq!(store.read(second).expect("read"), b"payload-two-is-longer");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn trailer_roundtrip() {
        let dir = std::env::temp_dir().join(format!("plbd-flattrail-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = FlatFileStore::open(&dir, "rev", *b"TEST", 1 << 20).expect("open");
        let checksum = [0x5a; 32];
        let location = store.append(b"undo-bytes", Some(&checksum)).expect("append");
        assert_eq!(store.read(location).expect("read"), b"undo-bytes");
        assert_eq!(store.read_trailer(location).expect("trailer"), checksum);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_info_tracks_ranges() {
        let mut info = FlatFileInfo::default();
        info.record(10, 1_000, 100);
        info.record(8, 900, 50);
        info.record(12, 1_100, 50);
        assert_eq!(info.blocks, 3);
        assert_eq!(info.size, 200);
        assert_eq!(info.height_min, 8);
        assert_eq!(info.height_max, 12);
        assert_eq!(info.time_min, 900);
        assert_eq!(info.time_max, 1_100);
    }
}
