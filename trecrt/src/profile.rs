//! The on-disk profile format: writer and parser.
//!
//! One file per process, rewritten in full by every flush, little-endian:
//!
//! ```text
//! cmdline bytes, ETX,
//! executable path, ETX,
//! initial working directory, ETX,
//! mode byte (0=time, 1=cycle, 2=insn),
//! bucket count (i32),
//! then, in any order: fid (i64) followed by bucket_count i64 counters.
//! ```
//!
//! There is no trailer and no checksum; a reader detects a torn write by
//! hitting end-of-file in the middle of a record.

use crate::{clock::Mode, histogram::BUCKETS};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
};
use thiserror::Error;

/// The delimiter between the three header strings.
pub const ETX: u8 = 0x03;

/// The header fields, captured once at init and rewritten by every flush.
pub(crate) struct Header {
    /// Raw bytes of `/proc/self/cmdline` (NUL-separated arguments).
    pub cmdline: Vec<u8>,
    pub exe: Vec<u8>,
    pub cwd: Vec<u8>,
    pub mode: Mode,
}

/// Rewrite `path` from scratch with the header and every histogram.
///
/// Truncating and rewriting the whole file each time is what makes a flush
/// atomic from a reader's standpoint: a reader either sees a complete file
/// or detects the torn tail.
pub(crate) fn write_file(
    path: &Path,
    header: &Header,
    table: &HashMap<u64, Vec<i64>>,
) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&header.cmdline)?;
    w.write_u8(ETX)?;
    w.write_all(&header.exe)?;
    w.write_u8(ETX)?;
    w.write_all(&header.cwd)?;
    w.write_u8(ETX)?;
    w.write_u8(header.mode as u8)?;
    w.write_i32::<LittleEndian>(BUCKETS as i32)?;
    for (fid, buckets) in table {
        w.write_i64::<LittleEndian>(*fid as i64)?;
        for &c in buckets {
            w.write_i64::<LittleEndian>(c)?;
        }
    }
    w.flush()
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile I/O error: {0}")]
    Io(#[from] io::Error),
    /// End-of-file inside the header or a record: the writer was cut off.
    #[error("profile truncated mid-record")]
    Truncated,
    #[error("unknown mode byte {0}")]
    BadMode(u8),
    #[error("implausible bucket count {0}")]
    BadBucketCount(i32),
}

/// One `(fid, histogram)` record.
#[derive(Debug, PartialEq, Eq)]
pub struct ProfileRecord {
    pub fid: u64,
    pub buckets: Vec<i64>,
}

/// A parsed profile, as post-mortem tooling and tests consume it.
#[derive(Debug)]
pub struct Profile {
    pub cmdline: String,
    pub exe: String,
    pub cwd: String,
    pub mode: Mode,
    pub bucket_count: usize,
    pub records: Vec<ProfileRecord>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        Self::read(BufReader::new(File::open(path)?))
    }

    pub fn read(mut r: impl Read) -> Result<Self, ProfileError> {
        let cmdline = read_until_etx(&mut r)?;
        let exe = read_until_etx(&mut r)?;
        let cwd = read_until_etx(&mut r)?;
        let mode_byte = r.read_u8().map_err(map_eof)?;
        let mode = Mode::from_repr(mode_byte).ok_or(ProfileError::BadMode(mode_byte))?;
        let raw_count = r.read_i32::<LittleEndian>().map_err(map_eof)?;
        let bucket_count =
            usize::try_from(raw_count).map_err(|_| ProfileError::BadBucketCount(raw_count))?;

        let mut records = Vec::new();
        loop {
            // A clean end-of-file sits exactly between records; anything
            // else mid-record is a torn write.
            let mut fid_buf = [0u8; 8];
            match read_full(&mut r, &mut fid_buf)? {
                Filled::Eof => break,
                Filled::Full => (),
            }
            let fid = i64::from_le_bytes(fid_buf) as u64;
            let mut buckets = Vec::with_capacity(bucket_count);
            for _ in 0..bucket_count {
                buckets.push(r.read_i64::<LittleEndian>().map_err(map_eof)?);
            }
            records.push(ProfileRecord { fid, buckets });
        }

        Ok(Self {
            cmdline: String::from_utf8_lossy(&cmdline).into_owned(),
            exe: String::from_utf8_lossy(&exe).into_owned(),
            cwd: String::from_utf8_lossy(&cwd).into_owned(),
            mode,
            bucket_count,
            records,
        })
    }

    /// The command line split back into arguments (the header stores it as
    /// NUL-separated raw bytes).
    pub fn args(&self) -> Vec<&str> {
        self.cmdline
            .split('\0')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn map_eof(e: io::Error) -> ProfileError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ProfileError::Truncated
    } else {
        ProfileError::Io(e)
    }
}

fn read_until_etx(r: &mut impl Read) -> Result<Vec<u8>, ProfileError> {
    let mut out = Vec::new();
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Err(ProfileError::Truncated),
            Ok(_) => {
                if b[0] == ETX {
                    return Ok(out);
                }
                out.push(b[0]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }
}

enum Filled {
    Full,
    Eof,
}

/// Fill `buf` completely, or report a clean EOF if not even the first byte
/// was there. EOF partway through the buffer is a torn record.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> Result<Filled, ProfileError> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) if got == 0 => return Ok(Filled::Eof),
            Ok(0) => return Err(ProfileError::Truncated),
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Filled::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn header() -> Header {
        Header {
            cmdline: b"demo\0--fast\0".to_vec(),
            exe: b"/usr/bin/demo".to_vec(),
            cwd: b"/home/user".to_vec(),
            mode: Mode::Time,
        }
    }

    #[test]
    fn roundtrip_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.bin");

        let mut table: HashMap<u64, Vec<i64>> = HashMap::new();
        let mut h1 = vec![0i64; BUCKETS];
        h1[0] = 3;
        h1[BUCKETS - 1] = i64::MAX;
        table.insert((5 << 48) | (1 << 24) | 1, h1.clone());
        let mut h2 = vec![0i64; BUCKETS];
        h2[17] = -9; // counters are signed; parsing must not mangle them
        table.insert((5 << 48) | 2, h2.clone());

        write_file(&path, &header(), &table).unwrap();
        let p = Profile::load(&path).unwrap();

        assert_eq!(p.mode, Mode::Time);
        assert_eq!(p.bucket_count, BUCKETS);
        assert_eq!(p.exe, "/usr/bin/demo");
        assert_eq!(p.cwd, "/home/user");
        assert_eq!(p.args(), vec!["demo", "--fast"]);
        assert_eq!(p.records.len(), 2);
        for rec in &p.records {
            assert_eq!(rec.buckets, table[&rec.fid]);
        }
    }

    #[test]
    fn empty_table_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.bin");
        write_file(&path, &header(), &HashMap::new()).unwrap();
        let p = Profile::load(&path).unwrap();
        assert!(p.records.is_empty());
        assert_eq!(p.bucket_count, BUCKETS);
    }

    #[test]
    fn truncation_mid_record_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.bin");
        let mut table = HashMap::new();
        table.insert(1u64 << 48, vec![0i64; BUCKETS]);
        write_file(&path, &header(), &table).unwrap();

        let bytes = fs::read(&path).unwrap();
        // Chop inside the record's counters.
        let torn = &bytes[..bytes.len() - 11];
        match Profile::read(torn) {
            Err(ProfileError::Truncated) => (),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn truncation_in_header_is_detected() {
        match Profile::read(&b"cmd\x03exe"[..]) {
            Err(ProfileError::Truncated) => (),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn unknown_mode_byte_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"c\x03e\x03w\x03");
        bytes.push(7); // no such mode
        bytes.extend_from_slice(&1024i32.to_le_bytes());
        match Profile::read(&bytes[..]) {
            Err(ProfileError::BadMode(7)) => (),
            other => panic!("expected bad mode, got {other:?}"),
        }
    }
}
