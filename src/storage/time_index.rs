//! Time-indexed file pair (spec §4.2, C2).
//!
//! `IndexTimeFile` is an append-only sequence of `[i64 time_ms | i16 len |
//! payload]` records. For the XLog/counter/alert/summary kinds `payload` is
//! the record itself; for text/profile kinds `payload` is a 5-byte
//! big-endian offset into a companion `RealDataFile` (see
//! `IndexTimeFile::write_offset`). Readers scan from the start and tolerate
//! a truncated final record left by a crash mid-write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};

pub struct IndexTimeFile {
    file: File,
    path: PathBuf,
}

impl IndexTimeFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[time_ms | len | payload]`, returning the offset the record
    /// started at. `payload.len()` MUST fit in an `i16` (<= 32767 bytes).
    pub fn write(&mut self, time_ms: i64, payload: &[u8]) -> Result<u64> {
        if payload.len() > i16::MAX as usize {
            return Err(ServerError::WireFormat(format!(
                "index payload too large: {} bytes",
                payload.len()
            )));
        }
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&time_ms.to_be_bytes())?;
        self.file.write_all(&(payload.len() as i16).to_be_bytes())?;
        self.file.write_all(payload)?;
        Ok(offset)
    }

    /// Convenience for the text/profile variant: the payload is a 5-byte
    /// big-endian offset into the companion data file.
    pub fn write_offset(&mut self, time_ms: i64, data_offset: u64) -> Result<u64> {
        let mut payload = [0u8; 5];
        payload.copy_from_slice(&data_offset.to_be_bytes()[3..8]);
        self.write(time_ms, &payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    /// Scan forward from the start of the file calling `visit(time, payload)`
    /// for every record with `t_lo <= time <= t_hi`, in on-disk (insertion)
    /// order. Returning `false` from `visit` stops the scan early. A
    /// truncated final record (partial write before a crash) ends the scan
    /// cleanly rather than erroring.
    pub fn read_range<F>(&self, t_lo: i64, t_hi: i64, mut visit: F) -> Result<()>
    where
        F: FnMut(i64, &[u8]) -> bool,
    {
        let mut file = File::open(&self.path)?;
        let mut header = [0u8; 10];
        loop {
            match read_fully(&mut file, &mut header) {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => break,
            }
            let time_ms = i64::from_be_bytes(header[0..8].try_into().unwrap());
            let len = i16::from_be_bytes(header[8..10].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; len];
            match read_fully(&mut file, &mut payload) {
                Ok(true) => {}
                _ => break,
            }
            if time_ms >= t_lo && time_ms <= t_hi && !visit(time_ms, &payload) {
                break;
            }
        }
        Ok(())
    }

    /// Extract the 5-byte big-endian offset written by `write_offset`.
    pub fn decode_offset(payload: &[u8]) -> Option<u64> {
        if payload.len() != 5 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[3..8].copy_from_slice(payload);
        Some(u64::from_be_bytes(buf))
    }
}

/// `Ok(true)` = filled the buffer, `Ok(false)` = clean EOF at the start of
/// the buffer, `Err` = a short read mid-record (truncated, treated as EOF
/// by callers).
fn read_fully(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(false)
            } else {
                Err(ServerError::ShortRead {
                    expected: buf.len(),
                    got: filled,
                })
            };
        }
        filled += n;
    }
    Ok(true)
}

/// Append-only opaque blob store. `Write` returns the offset the blob
/// started at; bytes are durable only after `Flush`. Each blob is prefixed
/// with a 4-byte length so `Read` doesn't need external bookkeeping beyond
/// the offset the writer handed back.
pub struct RealDataFile {
    file: File,
}

impl RealDataFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.file.write_all(payload)?;
        Ok(offset)
    }

    pub fn read(&mut self, offset: u64) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        self.file
            .read_exact(&mut len_buf)
            .map_err(|_| ServerError::ShortRead {
                expected: 4,
                got: 0,
            })?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.file
            .read_exact(&mut payload)
            .map_err(|_| ServerError::ShortRead {
                expected: len,
                got: 0,
            })?;
        Ok(payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn real_data_file_write_then_read_is_exact() {
        let dir = tempdir().unwrap();
        let mut data = RealDataFile::open(dir.path().join("xlog.data")).unwrap();
        let offset = data.write(b"hello world").unwrap();
        data.flush().unwrap();
        assert_eq!(data.read(offset).unwrap(), b"hello world");
    }

    #[test]
    fn index_time_file_read_range_matches_insertion_order() {
        let dir = tempdir().unwrap();
        let mut idx = IndexTimeFile::open(dir.path().join("xlog")).unwrap();
        idx.write(100, b"a").unwrap();
        idx.write(50, b"b").unwrap();
        idx.write(200, b"c").unwrap();
        idx.flush().unwrap();

        let mut seen = Vec::new();
        idx.read_range(50, 150, |t, p| {
            seen.push((t, p.to_vec()));
            true
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![(100, b"a".to_vec()), (50, b"b".to_vec())]
        );
    }

    #[test]
    fn read_range_stops_when_visit_returns_false() {
        let dir = tempdir().unwrap();
        let mut idx = IndexTimeFile::open(dir.path().join("xlog")).unwrap();
        idx.write(1, b"a").unwrap();
        idx.write(2, b"b").unwrap();
        idx.write(3, b"c").unwrap();

        let mut seen = Vec::new();
        idx.read_range(0, 10, |t, _| {
            seen.push(t);
            seen.len() < 2
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn read_range_tolerates_truncated_final_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("xlog");
        {
            let mut idx = IndexTimeFile::open(&path).unwrap();
            idx.write(1, b"complete").unwrap();
        }
        // Simulate a crash mid-write: append a header with no payload.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&2i64.to_be_bytes()).unwrap();
            f.write_all(&100i16.to_be_bytes()).unwrap(); // claims 100 bytes, none follow
        }
        let idx = IndexTimeFile::open(&path).unwrap();
        let mut seen = Vec::new();
        idx.read_range(0, 10, |t, p| {
            seen.push((t, p.to_vec()));
            true
        })
        .unwrap();
        assert_eq!(seen, vec![(1, b"complete".to_vec())]);
    }

    #[test]
    fn write_offset_roundtrips_through_decode_offset() {
        let dir = tempdir().unwrap();
        let mut idx = IndexTimeFile::open(dir.path().join("text")).unwrap();
        idx.write_offset(10, 1_099_511_627_775).unwrap();
        let mut captured = None;
        idx.read_range(0, 100, |_, payload| {
            captured = IndexTimeFile::decode_offset(payload);
            true
        })
        .unwrap();
        assert_eq!(captured, Some(1_099_511_627_775));
    }
}
