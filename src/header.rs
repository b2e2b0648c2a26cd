//! Fixed-format container header that precedes the zip body of a packed
//! `.tilt` file.
//!
//! # Layout (little-endian)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | sentinel `tilT` |
//! | 4 | 2 | header size, including these 8 bytes |
//! | 6 | 2 | version (must be 1) |
//! | 8 | size - 8 | extra bytes, preserved verbatim |
//!
//! The header is treated as an opaque blob once validated: the extra bytes
//! are never interpreted, only replayed byte-for-byte when re-packing.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

pub const SENTINEL: &[u8; 4] = b"tilT";
pub const VERSION: u16 = 1;
/// Sentinel + header size + version.
pub const FIXED_SIZE: usize = 8;
/// Size of the header written when a directory carries no `header.bin`:
/// the fixed portion followed by two reserved `u32` fields.
pub const DEFAULT_SIZE: u16 = 16;
/// Local file header signature that must follow the header.
pub const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("malformed header: truncated fixed portion ({0} of {} bytes)", FIXED_SIZE)]
    Truncated(usize),
    #[error("malformed header: sentinel looks weird: {0:?}")]
    BadSentinel([u8; 4]),
    #[error("malformed header: strange header size {0}")]
    BadSize(u16),
    #[error("malformed header: bad header size (claim {claimed}, actual {actual})")]
    ShortExtra { claimed: usize, actual: usize },
    #[error("malformed header: no zip signature after header: {0:?}")]
    MissingZipSignature(Vec<u8>),
    #[error("malformed header: {0} bytes past the declared header size")]
    TrailingBytes(usize),
    #[error("malformed header: bogus version {0}")]
    BadVersion(u16),
    #[error("malformed header: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiltHeader {
    pub header_size: u16,
    pub version:     u16,
    bytes:           Vec<u8>,
}

impl TiltHeader {
    /// The header written for directories that lack `header.bin`.
    pub fn default_v1() -> Self {
        let mut bytes = Vec::with_capacity(DEFAULT_SIZE as usize);
        bytes.extend_from_slice(SENTINEL);
        // Writing into a Vec cannot fail.
        let _ = bytes.write_u16::<LittleEndian>(DEFAULT_SIZE);
        let _ = bytes.write_u16::<LittleEndian>(VERSION);
        let _ = bytes.write_u32::<LittleEndian>(0);
        let _ = bytes.write_u32::<LittleEndian>(0);
        Self { header_size: DEFAULT_SIZE, version: VERSION, bytes }
    }

    /// Read and validate a header, consuming it plus up to four bytes of
    /// the zip signature that must follow it.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let mut fixed = [0u8; FIXED_SIZE];
        let got = read_up_to(&mut reader, &mut fixed)?;
        if got < FIXED_SIZE {
            return Err(HeaderError::Truncated(got));
        }

        let mut cursor = Cursor::new(&fixed[..]);
        let mut sentinel = [0u8; 4];
        cursor.read_exact(&mut sentinel)?;
        let header_size = cursor.read_u16::<LittleEndian>()?;
        let version = cursor.read_u16::<LittleEndian>()?;

        if &sentinel != SENTINEL {
            return Err(HeaderError::BadSentinel(sentinel));
        }
        let claimed = match (header_size as usize).checked_sub(FIXED_SIZE) {
            Some(n) => n,
            None    => return Err(HeaderError::BadSize(header_size)),
        };

        let mut extra = Vec::with_capacity(claimed);
        let actual = (&mut reader).take(claimed as u64).read_to_end(&mut extra)?;
        if actual < claimed {
            return Err(HeaderError::ShortExtra { claimed, actual });
        }

        let mut zip_sentinel = [0u8; 4];
        let peeked = read_up_to(&mut reader, &mut zip_sentinel)?;
        if peeked != 0 && &zip_sentinel[..peeked] != ZIP_MAGIC {
            return Err(HeaderError::MissingZipSignature(zip_sentinel[..peeked].to_vec()));
        }

        if version != VERSION {
            return Err(HeaderError::BadVersion(version));
        }

        let mut bytes = fixed.to_vec();
        bytes.extend_from_slice(&extra);
        Ok(Self { header_size, version, bytes })
    }

    /// Validate a stored header blob. The blob alone is allowed: end of input
    /// right after the header satisfies the zip-signature check.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let header = Self::read(bytes)?;
        if header.bytes.len() != bytes.len() {
            return Err(HeaderError::TrailingBytes(bytes.len() - header.bytes.len()));
        }
        Ok(header)
    }

    /// Fixed portion and extra bytes, exactly as read.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The opaque bytes past the fixed portion.
    pub fn extra(&self) -> &[u8] {
        &self.bytes[FIXED_SIZE..]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.bytes)
    }
}

/// Like `read_exact`, but reports how much was filled instead of failing on EOF.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with_extra(extra: &[u8]) -> Vec<u8> {
        let mut out = SENTINEL.to_vec();
        out.extend_from_slice(&((FIXED_SIZE + extra.len()) as u16).to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(extra);
        out
    }

    #[test]
    fn default_header_validates() {
        let header = TiltHeader::default_v1();
        assert_eq!(header.len(), DEFAULT_SIZE as usize);
        let reparsed = TiltHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(reparsed, header);
        assert_eq!(reparsed.extra(), &[0u8; 8]);
    }

    #[test]
    fn extra_bytes_are_preserved() {
        let blob = header_with_extra(b"\x01\x02\x03\x04\x05");
        let mut stream = blob.clone();
        stream.extend_from_slice(ZIP_MAGIC);
        stream.extend_from_slice(b"rest of the zip");

        let header = TiltHeader::read(&stream[..]).unwrap();
        assert_eq!(header.as_bytes(), &blob[..]);
        assert_eq!(header.extra(), b"\x01\x02\x03\x04\x05");
    }

    #[test]
    fn rejects_bad_sentinel() {
        let mut blob = header_with_extra(&[]);
        blob[0] = b'x';
        assert!(matches!(TiltHeader::from_bytes(&blob), Err(HeaderError::BadSentinel(_))));
    }

    #[test]
    fn rejects_size_smaller_than_fixed_portion() {
        let mut blob = header_with_extra(&[]);
        blob[4] = 4;
        assert!(matches!(TiltHeader::from_bytes(&blob), Err(HeaderError::BadSize(4))));
    }

    #[test]
    fn rejects_short_extra() {
        let mut blob = header_with_extra(&[0; 8]);
        blob.truncate(12);
        assert!(matches!(
            TiltHeader::read(&blob[..]),
            Err(HeaderError::ShortExtra { claimed: 8, actual: 4 })
        ));
    }

    #[test]
    fn rejects_missing_zip_signature() {
        let mut stream = header_with_extra(&[]);
        stream.extend_from_slice(b"JUNK");
        assert!(matches!(
            TiltHeader::read(&stream[..]),
            Err(HeaderError::MissingZipSignature(_))
        ));
    }

    #[test]
    fn rejects_other_versions() {
        let mut blob = header_with_extra(&[]);
        blob[6] = 2;
        assert!(matches!(TiltHeader::from_bytes(&blob), Err(HeaderError::BadVersion(2))));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(TiltHeader::read(&b"tilT"[..]), Err(HeaderError::Truncated(4))));
    }
}
