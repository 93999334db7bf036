use crate::codec::reader::ValueReader;
use crate::error::ExportError;

/// Magic bytes at the start of every artifact.
pub const MAGIC: [u8; 4] = *b"GCAP";

/// Major version of the artifact format written by this crate.
///
/// Artifacts with a different major version are rejected.
pub const FORMAT_MAJOR: u16 = 1;

/// Minor version of the artifact format written by this crate.
///
/// Minor versions only add optional sections, which older readers skip.
pub const FORMAT_MINOR: u16 = 0;

/// Header flag indicating that the body is followed by a checksum footer.
pub const FLAG_CHECKSUM: u32 = 1;

/// Fixed-size prefix of an artifact.
///
/// This specifies the format version, flags and the length of the body
/// which follows it.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub format_major: u16,
    pub format_minor: u16,

    /// Bit flags. Unknown bits are ignored when reading.
    pub flags: u32,

    /// Length of the body in bytes, excluding the checksum footer.
    pub body_len: u64,
}

impl Header {
    /// Size of the serialized header in bytes.
    pub const LEN: usize = 20;

    /// Create a header for the current format version.
    pub fn new(body_len: u64, checksum: bool) -> Header {
        Header {
            format_major: FORMAT_MAJOR,
            format_minor: FORMAT_MINOR,
            flags: if checksum { FLAG_CHECKSUM } else { 0 },
            body_len,
        }
    }

    /// Return true if the artifact has a checksum footer.
    pub fn has_checksum(&self) -> bool {
        self.flags & FLAG_CHECKSUM != 0
    }

    /// Read the header from the start of an artifact.
    ///
    /// The major version is checked immediately after the magic bytes, so an
    /// artifact from an unsupported major version fails with
    /// [`ExportError::UnsupportedVersion`] without reading anything else.
    pub fn from_buf(buf: &[u8]) -> Result<Header, ExportError> {
        let mut reader = ValueReader::new(buf);

        let magic = reader.read_n::<4>()?;
        if magic != MAGIC {
            return Err(ExportError::corrupt(
                "magic",
                format!("expected {:?} but found {:?}", MAGIC, magic),
            ));
        }

        let format_major = reader.read::<u16>()?;
        if format_major != FORMAT_MAJOR {
            return Err(ExportError::UnsupportedVersion {
                major: format_major,
            });
        }

        let format_minor = reader.read()?;
        let flags = reader.read()?;
        let body_len = reader.read()?;

        Ok(Header {
            format_major,
            format_minor,
            flags,
            body_len,
        })
    }

    /// Serialize this header to a byte buffer.
    pub fn to_buf(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::LEN);

        buffer.extend(MAGIC);
        buffer.extend(self.format_major.to_le_bytes());
        buffer.extend(self.format_minor.to_le_bytes());
        buffer.extend(self.flags.to_le_bytes());
        buffer.extend(self.body_len.to_le_bytes());

        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, FORMAT_MAJOR, FORMAT_MINOR};
    use crate::error::ErrorKind;

    #[test]
    fn test_read_header() {
        let expected_header = Header::new(128, true);
        let header = Header::from_buf(&expected_header.to_buf()).unwrap();
        assert_eq!(header, expected_header);
        assert_eq!(header.format_major, FORMAT_MAJOR);
        assert_eq!(header.format_minor, FORMAT_MINOR);
        assert!(header.has_checksum());
        assert!(!Header::new(0, false).has_checksum());
    }

    #[test]
    fn test_unknown_flags_ignored() {
        let mut header = Header::new(0, false);
        header.flags = 0xffff_fff0;
        let header = Header::from_buf(&header.to_buf()).unwrap();
        assert!(!header.has_checksum());
    }

    #[test]
    fn test_invalid_header() {
        struct Case {
            buf: Vec<u8>,
            expected: ErrorKind,
        }

        let mut future_version = Header::new(0, false).to_buf();
        future_version[4..6].copy_from_slice(&(FORMAT_MAJOR + 1).to_le_bytes());

        let cases = [
            Case {
                buf: Vec::new(),
                expected: ErrorKind::TruncatedInput,
            },
            Case {
                buf: b"This is some random ASCII text and not a valid header".to_vec(),
                expected: ErrorKind::CorruptField,
            },
            Case {
                buf: Header::new(0, false).to_buf()[..12].to_vec(),
                expected: ErrorKind::TruncatedInput,
            },
            // The version is rejected before the truncated fields after it.
            Case {
                buf: future_version[..6].to_vec(),
                expected: ErrorKind::UnsupportedVersion,
            },
        ];

        for Case { buf, expected } in cases {
            let err = Header::from_buf(&buf).unwrap_err();
            assert_eq!(err.kind(), expected);
        }
    }
}
