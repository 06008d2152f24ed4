//! Record framing
//!
//! Every file starts with a 4-byte version. Records follow:
//!
//! ```text
//! +----------------------------+-------------+-----------------+
//! | type << 24 | size  (u32)   | CRC-32 (u32)| payload (size)  |
//! +----------------------------+-------------+-----------------+
//! ```
//!
//! Untyped records store the plain payload size in the first word. All
//! integers are little-endian. Payloads are `bincode` encoded.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::buffer::BufferedWriter;
use super::crc::CrcTable;
use crate::error::{StoreError, StoreResult};

/// Current file format version
pub const FILE_VERSION: u32 = 1;

/// Size of the version at the start of every file
pub const VERSION_SIZE: u64 = 4;

/// Size of a record header: type/size + CRC
pub const RECORD_HEADER_SIZE: usize = 8;

/// Record type of untyped records
pub const NO_TYPE: u8 = 0;

/// Largest payload of a typed record
pub const MAX_TYPED_RECORD_SIZE: usize = 0xFF_FFFF;

/// Destination of encoded records
pub trait RecordSink {
    /// Flush pending buffered bytes if `size` more would not fit.
    fn make_room(&mut self, size: usize) -> io::Result<()>;

    fn put(&mut self, data: &[u8]) -> io::Result<()>;
}

impl RecordSink for File {
    fn make_room(&mut self, _size: usize) -> io::Result<()> {
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)
    }
}

impl<W: Write> RecordSink for BufWriter<W> {
    fn make_room(&mut self, size: usize) -> io::Result<()> {
        let buffered = self.buffer().len();
        if buffered > 0 && self.capacity() - buffered < size {
            self.flush()?;
        }
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)
    }
}

/// A file written through a [`BufferedWriter`]
pub struct Buffered<'a> {
    pub writer: &'a mut BufferedWriter,
    pub file: &'a mut File,
}

impl RecordSink for Buffered<'_> {
    fn make_room(&mut self, size: usize) -> io::Result<()> {
        if self.writer.buffered() > 0 && self.writer.available() < size {
            self.writer.flush(self.file)?;
        }
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write(self.file, data)
    }
}

/// Open (or create) a log file for reading and appending.
pub fn open_file(path: &Path) -> StoreResult<File> {
    open_file_with(path, OpenOptions::new().read(true).append(true).create(true))
}

/// Open a file with the given options, checking the version of an existing
/// file or writing it in a new one. The position is left after the version.
pub fn open_file_with(path: &Path, options: &OpenOptions) -> StoreResult<File> {
    let exists = path.exists();
    let mut file = options.open(path)?;
    if exists {
        check_file_version(&mut file)?;
    } else {
        file.write_all(&FILE_VERSION.to_le_bytes())?;
    }
    Ok(file)
}

/// Create a file (truncating it) holding only the version.
pub fn create_versioned(path: &Path) -> StoreResult<File> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    file.write_all(&FILE_VERSION.to_le_bytes())?;
    Ok(file)
}

pub fn check_file_version<R: Read>(r: &mut R) -> StoreResult<()> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let found = u32::from_le_bytes(buf);
    if found == 0 || found > FILE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found,
            supported: FILE_VERSION,
        });
    }
    Ok(())
}

/// Encode `rec` with its header into `scratch`, returning the total size.
pub fn encode_record<T: Serialize>(
    scratch: &mut Vec<u8>,
    rec_type: u8,
    rec: &T,
    crc: &CrcTable,
) -> StoreResult<usize> {
    scratch.clear();
    scratch.extend_from_slice(&[0u8; RECORD_HEADER_SIZE]);
    bincode::serde::encode_into_std_write(rec, scratch, bincode::config::standard())?;

    let size = scratch.len() - RECORD_HEADER_SIZE;
    let first = if rec_type == NO_TYPE {
        u32::try_from(size).map_err(|_| StoreError::RecordTooBig(size))?
    } else {
        if size > MAX_TYPED_RECORD_SIZE {
            return Err(StoreError::RecordTooBig(size));
        }
        (rec_type as u32) << 24 | size as u32
    };
    let checksum = crc.checksum(&scratch[RECORD_HEADER_SIZE..]);
    scratch[..4].copy_from_slice(&first.to_le_bytes());
    scratch[4..RECORD_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    Ok(scratch.len())
}

/// Write an encoded record in one call, flushing the sink first if the
/// record would not fit in its buffer.
pub fn write_encoded<S: RecordSink + ?Sized>(sink: &mut S, record: &[u8]) -> StoreResult<()> {
    sink.make_room(record.len())?;
    sink.put(record)?;
    Ok(())
}

/// Encode and write a record, returning the number of bytes written.
pub fn write_record<S, T>(
    sink: &mut S,
    scratch: &mut Vec<u8>,
    rec_type: u8,
    rec: &T,
    crc: &CrcTable,
) -> StoreResult<usize>
where
    S: RecordSink + ?Sized,
    T: Serialize,
{
    let total = encode_record(scratch, rec_type, rec, crc)?;
    write_encoded(sink, &scratch[..total])?;
    Ok(total)
}

/// Read one record into `buf`, returning its type (or [`NO_TYPE`]) and
/// payload size. `None` means the reader was at a clean end of file.
pub fn read_record<R: Read + ?Sized>(
    r: &mut R,
    buf: &mut Vec<u8>,
    typed: bool,
    crc: &CrcTable,
    check_crc: bool,
) -> StoreResult<Option<(u8, usize)>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    if !read_exact_or_eof(r, &mut header)? {
        return Ok(None);
    }
    let first = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let (rec_type, size) = if typed {
        ((first >> 24) as u8, (first & 0xFF_FFFF) as usize)
    } else {
        (NO_TYPE, first as usize)
    };
    let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    buf.resize(size, 0);
    r.read_exact(&mut buf[..size])?;
    if check_crc {
        let computed = crc.checksum(&buf[..size]);
        if computed != stored_crc {
            return Err(StoreError::Corrupted(format!(
                "expected crc to be 0x{:08x}, got 0x{:08x}",
                stored_crc, computed
            )));
        }
    }
    Ok(Some((rec_type, size)))
}

/// Decode a payload read by [`read_record`].
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
    Ok(value)
}

/// Fill `buf`, returning false if the reader was already at end of file.
/// A partial read is an `UnexpectedEof` error.
fn read_exact_or_eof<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "partial record header")),
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientInfo, Message};
    use std::io::{Cursor, Seek, SeekFrom};
    use tempfile::TempDir;

    fn crc() -> CrcTable {
        CrcTable::default()
    }

    #[test]
    fn test_typed_record_header() {
        let info = ClientInfo {
            id: "me".into(),
            hb_inbox: "hb".into(),
        };
        let mut scratch = Vec::new();
        let total = encode_record(&mut scratch, 2, &info, &crc()).unwrap();
        let first = u32::from_le_bytes(scratch[..4].try_into().unwrap());
        assert_eq!(first >> 24, 2);
        assert_eq!((first & 0xFF_FFFF) as usize, total - RECORD_HEADER_SIZE);

        let mut buf = Vec::new();
        let (rec_type, size) = read_record(&mut Cursor::new(&scratch), &mut buf, true, &crc(), true)
            .unwrap()
            .unwrap();
        assert_eq!(rec_type, 2);
        let decoded: ClientInfo = decode_payload(&buf[..size]).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_crc_mismatch_only_detected_when_enabled() {
        let msg = Message::new(1, "foo", b"hello".to_vec(), 42);
        let mut scratch = Vec::new();
        let total = encode_record(&mut scratch, NO_TYPE, &msg, &crc()).unwrap();
        // Flip a bit in the payload (the last data byte).
        scratch[total - 2] ^= 0x01;

        let mut buf = Vec::new();
        let err = read_record(&mut Cursor::new(&scratch), &mut buf, false, &crc(), true).unwrap_err();
        assert!(err.is_corruption());
        assert!(read_record(&mut Cursor::new(&scratch), &mut buf, false, &crc(), false)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_clean_eof_and_partial_record() {
        let mut buf = Vec::new();
        let empty: &[u8] = &[];
        assert!(read_record(&mut Cursor::new(empty), &mut buf, false, &crc(), true)
            .unwrap()
            .is_none());

        let partial: &[u8] = &[1, 0, 0];
        let err = read_record(&mut Cursor::new(partial), &mut buf, false, &crc(), true).unwrap_err();
        assert!(matches!(err, StoreError::Io(ref e) if e.kind() == ErrorKind::UnexpectedEof));

        // Header announcing more bytes than present
        let mut truncated = vec![0u8; RECORD_HEADER_SIZE];
        truncated[0] = 10;
        truncated.push(1);
        assert!(read_record(&mut Cursor::new(&truncated), &mut buf, false, &crc(), false).is_err());
    }

    #[test]
    fn test_typed_record_too_big() {
        let big = vec![0u8; MAX_TYPED_RECORD_SIZE + 1];
        let mut scratch = Vec::new();
        assert!(matches!(
            encode_record(&mut scratch, 1, &big, &crc()),
            Err(StoreError::RecordTooBig(_))
        ));
        assert!(encode_record(&mut scratch, NO_TYPE, &big, &crc()).is_ok());
    }

    #[test]
    fn test_file_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subs.dat");

        drop(open_file(&path).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), FILE_VERSION.to_le_bytes());
        // Reopening checks the version and appends after it.
        let mut file = open_file(&path).unwrap();
        write_record(&mut file, &mut Vec::new(), 1, &"x", &crc()).unwrap();
        file.seek(SeekFrom::Start(VERSION_SIZE)).unwrap();
        let mut buf = Vec::new();
        assert!(read_record(&mut file, &mut buf, true, &crc(), true).unwrap().is_some());

        std::fs::write(&path, 7u32.to_le_bytes()).unwrap();
        assert!(matches!(
            open_file(&path),
            Err(StoreError::UnsupportedVersion { found: 7, .. })
        ));
        std::fs::write(&path, 0u32.to_le_bytes()).unwrap();
        assert!(open_file(&path).is_err());
    }

    #[test]
    fn test_bufwriter_sink_flushes_before_overflow() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idx");
        let file = File::create(&path).unwrap();
        let mut bw = BufWriter::with_capacity(16, file);
        write_encoded(&mut bw, &[1u8; 10]).unwrap();
        assert_eq!(bw.buffer().len(), 10);
        write_encoded(&mut bw, &[2u8; 10]).unwrap();
        // The first record went out before the second was buffered.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
        assert_eq!(bw.buffer().len(), 10);
    }
}
