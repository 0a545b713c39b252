//! The append-only data file.
//!
//! Every record is laid out as
//! `key_len:u32 BE | value_len:u32 BE | key | value`. A record's offset is the
//! file position of its first byte and its length is the total bytes of all
//! four fields; the pair is what the index stores.
//!
//! The file is only ever appended to. Reads go through a separate read-only
//! handle using positional I/O, so any number of threads can read at distinct
//! offsets while one writer appends. The data file performs no locking of its
//! own; callers hold the store's data lock (read for `read`, write for
//! `append`).

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{KvError, Result};

/// size of the two length prefixes at the start of every record
const RECORD_HEADER_LEN: u64 = 8;

/// An append-only file of key/value records with positional reads.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    // append writer; its pos is the authoritative file size
    writer: BufWriterWithPos<File>,
    // independent read-only handle used for positional reads
    reader: File,
}

impl DataFile {
    /// open (creating if absent) the data file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DataFile> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&path)?;
        let mut writer = BufWriterWithPos::new(file)?;
        writer.seek(SeekFrom::End(0))?;
        let reader = File::open(&path)?;
        debug!(path = ?path, size = writer.pos, "opened data file");

        Ok(DataFile { path, writer, reader })
    }

    /// append one record, returning its `(offset, length)`.
    ///
    /// The bytes are flushed to the OS before returning so a subsequent
    /// `read` at the returned offset observes them. Durability is the WAL's
    /// job, so no fsync happens here.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(u64, u64)> {
        let offset = self.writer.pos;
        let record = encode_record(key, value);
        self.writer.write_all(&record)?;
        self.writer.flush()?;
        Ok((offset, record.len() as u64))
    }

    /// read the record at `offset`, returning `(stored_key, value)`.
    ///
    /// Callers must compare `stored_key` against the key they looked up; a
    /// mismatch means the index and the file disagree.
    pub fn read(&self, offset: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let size = self.size();
        if offset + RECORD_HEADER_LEN > size {
            return Err(KvError::Corruption(format!(
                "record header at offset {} is beyond file size {}",
                offset, size
            )));
        }

        let mut header = [0_u8; RECORD_HEADER_LEN as usize];
        self.reader.read_exact_at(&mut header, offset)?;
        let key_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let value_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;

        if offset + RECORD_HEADER_LEN + key_len + value_len > size {
            return Err(KvError::Corruption(format!(
                "record at offset {} claims {} key bytes and {} value bytes past end of file",
                offset, key_len, value_len
            )));
        }

        let mut key = vec![0_u8; key_len as usize];
        self.reader.read_exact_at(&mut key, offset + RECORD_HEADER_LEN)?;
        let mut value = vec![0_u8; value_len as usize];
        self.reader
            .read_exact_at(&mut value, offset + RECORD_HEADER_LEN + key_len)?;

        Ok((key, value))
    }

    /// current length of the file in bytes
    pub fn size(&self) -> u64 {
        self.writer.pos
    }

    /// the path this data file lives at
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// flush buffered writes and drop the handles
    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// encode one record in the on-disk layout
pub fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + key.len() + value.len());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// A struct that holds a BufferedWriter along with the current seek `pos` of that BufferedWriter
#[derive(Debug)]
struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write + Seek> Seek for BufWriterWithPos<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.writer.seek(pos)?;
        Ok(self.pos)
    }
}
