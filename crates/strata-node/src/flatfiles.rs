//! Append-only block and undo files.
//!
//! Records are framed as `[magic:4][len:4 LE][payload]` inside numbered
//! files (`blk00000.dat`, `rev00000.dat`, ...). A file is rotated once the
//! next record would push it past the size limit, and grown in fixed chunks
//! so appends rarely extend it. Pre-allocated space is zero-filled, which is
//! how the scan on open finds the end of the data.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_core::constants::NetworkType;
use strata_core::error::FatalError;
use strata_core::traits::{DiskPos, FlatStore};

/// Rotate block files past this size.
pub const MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;
/// Block files grow in chunks of this size.
pub const BLOCKFILE_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
/// Undo files grow in chunks of this size.
pub const UNDOFILE_CHUNK_SIZE: u64 = 1024 * 1024;

const HEADER_LEN: u64 = 8;

fn io_err(path: &Path, e: io::Error) -> FatalError {
    FatalError::Storage(format!("{}: {e}", path.display()))
}

/// Reads framed records from any byte stream until the data ends.
///
/// The stream ends cleanly at EOF, at a zero-filled gap, or at a truncated
/// trailing record; a foreign magic is reported as corruption.
pub struct RecordReader<R> {
    inner: R,
    magic: [u8; 4],
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, magic: [u8; 4]) -> Self {
        Self {
            inner,
            magic,
            done: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>, FatalError> {
        let mut header = [0u8; HEADER_LEN as usize];
        if !read_full(&mut self.inner, &mut header)? {
            return Ok(None);
        }
        let (magic, len) = header.split_at(4);
        if magic == [0u8; 4] {
            return Ok(None);
        }
        if magic != self.magic {
            return Err(FatalError::Corruption(format!("unexpected record magic {}", hex::encode(magic))));
        }
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        let mut payload = vec![0u8; len];
        if !read_full(&mut self.inner, &mut payload)? {
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>, FatalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` completely. `false` on EOF before the buffer is full.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, FatalError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(FatalError::Storage(e.to_string())),
        }
    }
    Ok(true)
}

/// Open `path` and iterate over its records.
pub fn read_records(path: &Path, magic: [u8; 4]) -> Result<RecordReader<BufReader<File>>, FatalError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    Ok(RecordReader::new(BufReader::new(file), magic))
}

/// Numbered record files in one directory sharing a name prefix.
#[derive(Debug)]
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    max_file_size: u64,
    chunk_size: u64,
    current: u32,
    /// End of the last record in the current file.
    offset: u64,
    /// Length the current file has been grown to.
    allocated: u64,
    file: Option<File>,
}

impl FlatFileStore {
    /// Block store (`blkNNNNN.dat`) for `network` under `dir`.
    pub fn blocks(dir: impl Into<PathBuf>, network: NetworkType) -> Result<Self, FatalError> {
        Self::open(dir, "blk", network.magic_bytes(), MAX_BLOCKFILE_SIZE, BLOCKFILE_CHUNK_SIZE)
    }

    /// Undo store (`revNNNNN.dat`) for `network` under `dir`.
    pub fn undo(dir: impl Into<PathBuf>, network: NetworkType) -> Result<Self, FatalError> {
        Self::open(dir, "rev", network.magic_bytes(), MAX_BLOCKFILE_SIZE, UNDOFILE_CHUNK_SIZE)
    }

    /// Open the store, resuming after the last complete record of the
    /// highest-numbered file.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: &'static str,
        magic: [u8; 4],
        max_file_size: u64,
        chunk_size: u64,
    ) -> Result<Self, FatalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let current = list_files(&dir, prefix)?.last().map_or(0, |(n, _)| *n);

        let mut store = Self {
            dir,
            prefix,
            magic,
            max_file_size,
            chunk_size: chunk_size.max(1),
            current,
            offset: 0,
            allocated: 0,
            file: None,
        };
        let path = store.file_path(current);
        if path.exists() {
            store.offset = scan_end(&path, magic)?;
            store.allocated = fs::metadata(&path).map_err(|e| io_err(&path, e))?.len();
            debug!(file = %path.display(), offset = store.offset, "resumed flat file");
        }
        Ok(store)
    }

    pub fn file_path(&self, file: u32) -> PathBuf {
        file_name(&self.dir, self.prefix, file)
    }

    /// Number of the file currently appended to.
    pub fn current_file(&self) -> u32 {
        self.current
    }

    /// Every file of this store in ascending order.
    pub fn files(&self) -> Result<Vec<PathBuf>, FatalError> {
        Ok(list_files(&self.dir, self.prefix)?.into_iter().map(|(_, p)| p).collect())
    }

    fn current_handle(&mut self) -> Result<&mut File, FatalError> {
        if self.file.is_none() {
            let path = self.file_path(self.current);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| FatalError::Storage("flat file handle unavailable".into()))
    }

    fn rotate(&mut self) -> Result<(), FatalError> {
        if let Some(file) = self.file.take() {
            // Hand back the unused pre-allocated tail.
            let path = self.file_path(self.current);
            file.set_len(self.offset).map_err(|e| io_err(&path, e))?;
            file.sync_all().map_err(|e| io_err(&path, e))?;
        }
        self.current += 1;
        self.offset = 0;
        self.allocated = 0;
        debug!(prefix = self.prefix, file = self.current, "rotated flat file");
        Ok(())
    }
}

impl FlatStore for FlatFileStore {
    fn write(&mut self, bytes: &[u8]) -> Result<DiskPos, FatalError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| FatalError::Storage(format!("record too large: {}", bytes.len())))?;
        let record_len = HEADER_LEN + u64::from(len);
        if self.offset > 0 && self.offset + record_len > self.max_file_size {
            self.rotate()?;
        }

        let path = self.file_path(self.current);
        let start = self.offset;
        let end = start + record_len;
        let needs_growth = end > self.allocated;
        let grown = end.div_ceil(self.chunk_size) * self.chunk_size;
        let magic = self.magic;

        let file = self.current_handle()?;
        if needs_growth {
            file.set_len(grown).map_err(|e| io_err(&path, e))?;
        }
        file.seek(SeekFrom::Start(start)).map_err(|e| io_err(&path, e))?;
        file.write_all(&magic).map_err(|e| io_err(&path, e))?;
        file.write_all(&len.to_le_bytes()).map_err(|e| io_err(&path, e))?;
        file.write_all(bytes).map_err(|e| io_err(&path, e))?;

        if needs_growth {
            self.allocated = grown;
        }
        self.offset = end;
        Ok(DiskPos {
            file: self.current,
            offset: start + HEADER_LEN,
            len,
        })
    }

    fn read(&self, pos: &DiskPos) -> Result<Vec<u8>, FatalError> {
        let path = self.file_path(pos.file);
        let missing = || FatalError::MissingBlockData(format!("{}:{}", path.display(), pos.offset));
        if pos.offset < HEADER_LEN {
            return Err(missing());
        }
        let mut file = File::open(&path).map_err(|_| missing())?;
        file.seek(SeekFrom::Start(pos.offset - HEADER_LEN))
            .map_err(|e| io_err(&path, e))?;

        let mut header = [0u8; HEADER_LEN as usize];
        if !read_full(&mut file, &mut header)? {
            return Err(missing());
        }
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if header[..4] != self.magic || stored_len != pos.len {
            return Err(FatalError::Corruption(format!(
                "record header mismatch at {}:{}",
                path.display(),
                pos.offset
            )));
        }
        let mut payload = vec![0u8; pos.len as usize];
        if !read_full(&mut file, &mut payload)? {
            return Err(missing());
        }
        Ok(payload)
    }

    fn flush(&mut self) -> Result<(), FatalError> {
        let path = self.file_path(self.current);
        match self.file.as_mut() {
            Some(file) => {
                file.flush().map_err(|e| io_err(&path, e))?;
                file.sync_data().map_err(|e| io_err(&path, e))
            }
            None => Ok(()),
        }
    }
}

/// Block files (`blkNNNNN.dat`) in `dir`, in ascending order.
pub fn block_files(dir: &Path) -> Result<Vec<PathBuf>, FatalError> {
    Ok(list_files(dir, "blk")?.into_iter().map(|(_, p)| p).collect())
}

fn file_name(dir: &Path, prefix: &str, file: u32) -> PathBuf {
    dir.join(format!("{prefix}{file:05}.dat"))
}

/// Numbered files in `dir` named `<prefix>NNNNN.dat`, in ascending order.
fn list_files(dir: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>, FatalError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let number = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".dat"))
            .filter(|digits| digits.len() == 5)
            .and_then(|digits| digits.parse::<u32>().ok());
        if let Some(number) = number {
            files.push((number, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// Offset just past the last complete record of `path`.
fn scan_end(path: &Path, magic: [u8; 4]) -> Result<u64, FatalError> {
    let mut end = 0u64;
    for record in read_records(path, magic)? {
        match record {
            Ok(payload) => end += HEADER_LEN + payload.len() as u64,
            // A torn tail is overwritten by the next append.
            Err(FatalError::Corruption(_)) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(end)
}
