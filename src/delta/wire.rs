//! delta stream record format
//!
//! ```text
//! header:  magic u32 BE (0x72730236) | block_size u32 BE
//! records: tag u8 followed by
//!   0x01 BLOCK        index leb128
//!   0x02 BLOCK_RANGE  first leb128 | last leb128   (inclusive)
//!   0x03 DATA         len leb128 (1..=MAX_DATA_OP) | bytes
//!   0x04 HASH         32 bytes sha256 of the target, ends the stream
//! ```
//!
//! end of input at a tag boundary ends the operation stream. end of input
//! anywhere else is `UnexpectedEof`.

use std::io::{self, Read};

use crate::error::{io_error, Error, Result};

pub const DELTA_MAGIC: u32 = 0x7273_0236;

/// largest literal payload a single DATA record may carry
pub const MAX_DATA_OP: usize = 16 * 1024;

/// largest block size accepted from a header
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// length of the trailing target checksum (sha256)
pub const CHECKSUM_LEN: usize = 32;

const TAG_BLOCK: u8 = 0x01;
const TAG_BLOCK_RANGE: u8 = 0x02;
const TAG_DATA: u8 = 0x03;
const TAG_HASH: u8 = 0x04;

const MAX_VARINT_LEN: usize = 10;

/// a single patch operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// copy one block of the basis
    Block(u64),
    /// copy blocks first..=last of the basis
    BlockRange { first: u64, last: u64 },
    /// insert literal bytes
    Data(Vec<u8>),
}

/// a decoded record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Op(Op),
    Checksum([u8; CHECKSUM_LEN]),
}

fn map_read_err(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof
    } else {
        io_error("<delta>", e)
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(map_read_err)?;
    Ok(u32::from_be_bytes(buf))
}

/// read one byte, returning None on a clean end of input
fn read_tag<R: Read>(r: &mut R) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_read_err(e)),
        }
    }
}

fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        r.read_exact(&mut byte).map_err(map_read_err)?;
        let low = u64::from(byte[0] & 0x7f);
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(Error::CorruptDelta("varint overflows u64".to_string()));
        }
        value |= low << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::CorruptDelta("varint too long".to_string()))
}

/// read the delta header and return the declared block size
pub fn read_header<R: Read>(r: &mut R) -> Result<u32> {
    let magic = read_u32(r)?;
    if magic != DELTA_MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let block_size = read_u32(r)?;
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(Error::CorruptDelta(format!(
            "block size {} out of range",
            block_size
        )));
    }
    Ok(block_size)
}

/// forward-only decoder over the records following the header
pub struct RecordReader<R> {
    inner: R,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    /// next record, or None once the stream has ended
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }

        let tag = match read_tag(&mut self.inner)? {
            Some(tag) => tag,
            None => {
                self.done = true;
                return Ok(None);
            }
        };

        let record = match tag {
            TAG_BLOCK => Record::Op(Op::Block(read_varint(&mut self.inner)?)),
            TAG_BLOCK_RANGE => {
                let first = read_varint(&mut self.inner)?;
                let last = read_varint(&mut self.inner)?;
                if last < first {
                    return Err(Error::CorruptDelta(format!(
                        "block range {}..={} is reversed",
                        first, last
                    )));
                }
                Record::Op(Op::BlockRange { first, last })
            }
            TAG_DATA => {
                let len = read_varint(&mut self.inner)?;
                if len == 0 || len > MAX_DATA_OP as u64 {
                    return Err(Error::CorruptDelta(format!(
                        "data record length {} out of range",
                        len
                    )));
                }
                let mut data = vec![0u8; len as usize];
                self.inner.read_exact(&mut data).map_err(map_read_err)?;
                Record::Op(Op::Data(data))
            }
            TAG_HASH => {
                let mut sum = [0u8; CHECKSUM_LEN];
                self.inner.read_exact(&mut sum).map_err(map_read_err)?;
                if read_tag(&mut self.inner)?.is_some() {
                    return Err(Error::CorruptDelta(
                        "trailing data after checksum".to_string(),
                    ));
                }
                self.done = true;
                Record::Checksum(sum)
            }
            other => {
                return Err(Error::CorruptDelta(format!(
                    "unknown record tag {:#04x}",
                    other
                )))
            }
        };

        Ok(Some(record))
    }
}

/// writes delta records; used to build fixtures
#[cfg(test)]
pub(crate) struct DeltaWriter {
    buf: Vec<u8>,
}

#[cfg(test)]
impl DeltaWriter {
    pub fn new(block_size: u32) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DELTA_MAGIC.to_be_bytes());
        buf.extend_from_slice(&block_size.to_be_bytes());
        Self { buf }
    }

    fn varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn block(mut self, index: u64) -> Self {
        self.buf.push(TAG_BLOCK);
        self.varint(index);
        self
    }

    pub fn block_range(mut self, first: u64, last: u64) -> Self {
        self.buf.push(TAG_BLOCK_RANGE);
        self.varint(first);
        self.varint(last);
        self
    }

    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.buf.push(TAG_DATA);
        self.varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn checksum(mut self, sum: &[u8; CHECKSUM_LEN]) -> Self {
        self.buf.push(TAG_HASH);
        self.buf.extend_from_slice(sum);
        self
    }

    /// append raw bytes (for corrupting fixtures)
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn records(bytes: Vec<u8>) -> Result<Vec<Record>> {
        let mut cursor = Cursor::new(bytes);
        read_header(&mut cursor)?;
        let mut reader = RecordReader::new(cursor);
        let mut out = Vec::new();
        while let Some(rec) = reader.next_record()? {
            out.push(rec);
        }
        Ok(out)
    }

    #[test]
    fn test_decodes_all_record_kinds() {
        let sum = [9u8; CHECKSUM_LEN];
        let bytes = DeltaWriter::new(4)
            .block(300)
            .block_range(1, 2)
            .data(b"hello")
            .checksum(&sum)
            .finish();

        assert_eq!(
            records(bytes).unwrap(),
            vec![
                Record::Op(Op::Block(300)),
                Record::Op(Op::BlockRange { first: 1, last: 2 }),
                Record::Op(Op::Data(b"hello".to_vec())),
                Record::Checksum(sum),
            ]
        );
    }

    #[test]
    fn test_truncated_header_is_unexpected_eof() {
        let mut cursor = Cursor::new(vec![0x72, 0x73, 0x02]);
        assert!(matches!(read_header(&mut cursor), Err(Error::UnexpectedEof)));

        let mut empty = Cursor::new(Vec::new());
        assert!(matches!(read_header(&mut empty), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn test_rejects_bad_magic_and_block_size() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 1, 0, 0, 0, 4]);
        assert!(matches!(read_header(&mut cursor), Err(Error::BadMagic(1))));

        let zero = DeltaWriter::new(0).finish();
        assert!(matches!(
            read_header(&mut Cursor::new(zero)),
            Err(Error::CorruptDelta(_))
        ));
    }

    #[test]
    fn test_truncated_record_is_unexpected_eof() {
        let mut bytes = DeltaWriter::new(4).data(b"abcdef").finish();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(records(bytes), Err(Error::UnexpectedEof)));

        let bytes = DeltaWriter::new(4).raw(&[TAG_HASH, 1, 2, 3]).finish();
        assert!(matches!(records(bytes), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn test_rejects_malformed_records() {
        let unknown = DeltaWriter::new(4).raw(&[0x7f]).finish();
        assert!(matches!(records(unknown), Err(Error::CorruptDelta(_))));

        let reversed = DeltaWriter::new(4).block_range(5, 2).finish();
        assert!(matches!(records(reversed), Err(Error::CorruptDelta(_))));

        let empty_data = DeltaWriter::new(4).raw(&[TAG_DATA, 0]).finish();
        assert!(matches!(records(empty_data), Err(Error::CorruptDelta(_))));

        let long_varint = DeltaWriter::new(4).raw(&[TAG_BLOCK]).raw(&[0xff; 11]).finish();
        assert!(matches!(records(long_varint), Err(Error::CorruptDelta(_))));

        let trailing = DeltaWriter::new(4)
            .checksum(&[0u8; CHECKSUM_LEN])
            .raw(&[TAG_BLOCK, 0])
            .finish();
        assert!(matches!(records(trailing), Err(Error::CorruptDelta(_))));
    }

    #[test]
    fn test_stream_without_checksum_ends_cleanly() {
        let bytes = DeltaWriter::new(8).block(0).finish();
        assert_eq!(records(bytes).unwrap(), vec![Record::Op(Op::Block(0))]);
    }
}
