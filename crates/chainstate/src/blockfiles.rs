//! Append-only block storage: size-prefixed records in rolling flat
//! files, addressed by `(file, offset, len)` locations kept in the block
//! index.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::InvalidLocation => write!(f, "invalid block file location"),
            BlockFileError::LengthMismatch => write!(f, "block file length mismatch"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

pub struct BlockFiles {
    dir: PathBuf,
    max_file_size: u64,
    state: Mutex<ActiveFile>,
}

#[derive(Debug)]
struct ActiveFile {
    current_file: u32,
    current_len: u64,
}

impl BlockFiles {
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, max_file_size)?;
        Ok(Self {
            dir,
            max_file_size,
            state: Mutex::new(ActiveFile {
                current_file,
                current_len,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, BlockFileError> {
        let mut state = self.state.lock().expect("block file lock");
        let needed = 4u64 + bytes.len() as u64;
        if state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = bytes.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, BlockFileError> {
        if location.len == 0 {
            return Err(BlockFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        if u32::from_le_bytes(len_bytes) != location.len {
            return Err(BlockFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; location.len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn sync(&self) -> Result<(), BlockFileError> {
        let state = self.state.lock().expect("block file lock");
        let path = self.file_path(state.current_file);
        if path.exists() {
            File::open(&path)?.sync_all()?;
        }
        Ok(())
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("blk{file_id:05}.dat"))
    }

    fn locate_active_file(dir: &Path, max_file_size: u64) -> Result<(u32, u64), BlockFileError> {
        let mut file_id = 0u32;
        let mut last_existing: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(format!("blk{file_id:05}.dat"));
            if !path.exists() {
                break;
            }
            let len = std::fs::metadata(&path)?.len();
            last_existing = Some((file_id, len));
            file_id += 1;
        }
        match last_existing {
            Some((last_id, len)) => {
                if len >= max_file_size {
                    Ok((last_id + 1, 0))
                } else {
                    Ok((last_id, len))
                }
            }
            None => Ok((0, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let files = BlockFiles::open(dir.path(), 1 << 20).unwrap();
        let a = files.append(b"first block").unwrap();
        let b = files.append(b"second").unwrap();
        assert_eq!(files.read(a).unwrap(), b"first block");
        assert_eq!(files.read(b).unwrap(), b"second");
        assert_eq!(b.offset, 4 + a.len as u64);
    }

    #[test]
    fn rolls_to_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = BlockFiles::open(dir.path(), 32).unwrap();
        let a = files.append(&[1u8; 20]).unwrap();
        let b = files.append(&[2u8; 20]).unwrap();
        assert_eq!(a.file_id, 0);
        assert_eq!(b.file_id, 1);
        assert_eq!(files.read(b).unwrap(), vec![2u8; 20]);
    }

    #[test]
    fn reopen_continues_where_left_off() {
        let dir = tempfile::tempdir().unwrap();
        let first = BlockFiles::open(dir.path(), 1 << 20).unwrap();
        let a = first.append(b"persisted").unwrap();
        drop(first);
        let reopened = BlockFiles::open(dir.path(), 1 << 20).unwrap();
        let b = reopened.append(b"appended").unwrap();
        assert_eq!(reopened.read(a).unwrap(), b"persisted");
        assert_eq!(b.offset, 4 + a.len as u64);
    }

    #[test]
    fn length_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let files = BlockFiles::open(dir.path(), 1 << 20).unwrap();
        let mut loc = files.append(b"block").unwrap();
        loc.len = 99;
        assert!(matches!(
            files.read(loc),
            Err(BlockFileError::LengthMismatch)
        ));
    }
}
