//! oiDL: a list container holding N opaque byte blobs or N strings (C6).
//!
//! Wire layout (`spec.md` §6, §4.6):
//!
//! ```text
//! [magic?] [version] [flags] [type] [sizeTypes] [count] [iv][tag]? [lengths table] [payload]
//! ```
//!
//! When encrypted, `[lengths table][payload]` is the ciphertext region and
//! everything before `[iv]` is the AAD.

use crate::crc32c;
use crate::crypto::{self, EncryptionKey};
use crate::error::{OxError, OxResult};
use crate::sha256;
use crate::size::{decode_version, encode_version, Cursor, SizeType, Writer};

pub const MAGIC: u32 = 0x4C44_696F;
const SUPPORTED_VERSION: u8 = 0; // 1.0

const FLAG_USE_SHA256: u8 = 1 << 0;
const FLAG_IS_STRING: u8 = 1 << 1;
const FLAG_IS_UTF8: u8 = 1 << 2;
const FLAG_AES_CHUNK_MASK: u8 = 0b11 << 3;
const FLAG_HAS_EXTENDED_DATA: u8 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    None = 0,
    Aes256Gcm = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Data,
    Ascii,
    Utf8,
}

/// Settings for an oiDL container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DLSettings {
    pub compression: CompressionType,
    pub encryption: EncryptionType,
    pub data_type: DataType,
    pub use_sha256: bool,
    pub key: Option<[u8; 32]>,
}

impl Default for DLSettings {
    fn default() -> Self {
        Self {
            compression: CompressionType::None,
            encryption: EncryptionType::None,
            data_type: DataType::Data,
            use_sha256: false,
            key: None,
        }
    }
}

/// The entry payloads, shaped by `settings.data_type`.
#[derive(Debug, Clone)]
pub enum DLEntries {
    Data(Vec<Vec<u8>>),
    Ascii(Vec<String>),
    Utf8(Vec<String>),
}

impl DLEntries {
    fn raw_bytes(&self) -> OxResult<Vec<Vec<u8>>> {
        match self {
            DLEntries::Data(v) => Ok(v.clone()),
            DLEntries::Ascii(v) => {
                for s in v {
                    if !s.bytes().all(|b| b < 0x80) {
                        return Err(OxError::InvalidParameter(format!(
                            "ASCII entry {s:?} contains a byte >= 0x80"
                        )));
                    }
                }
                Ok(v.iter().map(|s| s.as_bytes().to_vec()).collect())
            }
            DLEntries::Utf8(v) => Ok(v.iter().map(|s| s.as_bytes().to_vec()).collect()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DLEntries::Data(v) => v.len(),
            DLEntries::Ascii(v) => v.len(),
            DLEntries::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory oiDL container.
#[derive(Debug, Clone)]
pub struct DLFile {
    pub settings: DLSettings,
    pub entries: DLEntries,
    /// Bytes consumed by the last `read` call — exposed so an outer codec
    /// (oiCA, oiSH) embedding this as a sub-file knows where to resume.
    pub read_length: usize,
}

impl DLFile {
    pub fn new(settings: DLSettings, entries: DLEntries) -> Self {
        Self {
            settings,
            entries,
            read_length: 0,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The string at `index`, for ASCII/UTF-8 containers.
    pub fn string_at(&self, index: usize) -> OxResult<&str> {
        match &self.entries {
            DLEntries::Ascii(v) | DLEntries::Utf8(v) => v
                .get(index)
                .map(|s| s.as_str())
                .ok_or_else(|| OxError::OutOfBounds(format!("string index {index} out of range"))),
            DLEntries::Data(_) => Err(OxError::InvalidState("not a string list".into())),
        }
    }

    /// Index of the first entry equal to `needle`, if any.
    pub fn find(&self, needle: &str) -> Option<usize> {
        match &self.entries {
            DLEntries::Ascii(v) | DLEntries::Utf8(v) => v.iter().position(|s| s == needle),
            DLEntries::Data(_) => None,
        }
    }

    /// Serializes this container. `hide_magic_number` is set by an outer
    /// codec embedding this oiDL as a sub-file.
    pub fn write(&self, hide_magic_number: bool) -> OxResult<Vec<u8>> {
        if !matches!(self.settings.compression, CompressionType::None) {
            return Err(OxError::Unsupported("compression is not supported".into()));
        }

        let raw = self.entries.raw_bytes()?;
        let entry_count = raw.len() as u64;
        let max_len = raw.iter().map(|e| e.len() as u64).max().unwrap_or(0);
        let count_st = SizeType::required_for(entry_count);
        let entry_st = SizeType::required_for(max_len);

        let mut flags = 0u8;
        if self.settings.use_sha256 {
            flags |= FLAG_USE_SHA256;
        }
        match self.settings.data_type {
            DataType::Data => {}
            DataType::Ascii => flags |= FLAG_IS_STRING,
            DataType::Utf8 => flags |= FLAG_IS_STRING | FLAG_IS_UTF8,
        }

        let mut header = Writer::new();
        if !hide_magic_number {
            header.put_u32(MAGIC);
        }
        header.put_u8(encode_version(1, 0)?);
        header.put_u8(flags);
        header.put_u8((self.settings.compression as u8) << 4 | self.settings.encryption as u8);
        header.put_u8(count_st.code() | (entry_st.code() << 2) | (entry_st.code() << 4));
        header.put_size(count_st, entry_count)?;

        let mut body = Writer::new();
        for e in &raw {
            body.put_size(entry_st, e.len() as u64)?;
        }
        for e in &raw {
            body.put_bytes(e);
        }

        let mut out = header.buf;
        match self.settings.encryption {
            EncryptionType::None => {
                out.extend_from_slice(&body.buf);
            }
            EncryptionType::Aes256Gcm => {
                let key_bytes = self
                    .settings
                    .key
                    .ok_or_else(|| OxError::Unauthorized("encryption declared but no key given".into()))?;
                let key = EncryptionKey::new(key_bytes);
                let (iv, tag, ciphertext) = crypto::encrypt(&key, &out, &body.buf)?;
                out.extend_from_slice(&iv);
                out.extend_from_slice(&tag);
                out.extend_from_slice(&ciphertext);
            }
        }
        Ok(out)
    }

    /// Parses an oiDL container. `is_sub_file` tolerates a missing magic
    /// number and leftover bytes after the logical end, per `spec.md` §4.6.
    pub fn read(buf: &[u8], key: Option<&[u8; 32]>, is_sub_file: bool) -> OxResult<Self> {
        let mut cursor = Cursor::new(buf);

        if !is_sub_file {
            let magic = cursor.consume_u32()?;
            if magic != MAGIC {
                return Err(OxError::Unsupported(format!(
                    "bad oiDL magic number: {magic:#x}"
                )));
            }
        }

        let version_byte = cursor.consume_u8()?;
        let (major, minor) = decode_version(version_byte);
        if (major, minor) != (1, 0) {
            return Err(OxError::Unsupported(format!(
                "unsupported oiDL version {major}.{minor}"
            )));
        }

        let flags = cursor.consume_u8()?;
        if flags & FLAG_AES_CHUNK_MASK != 0 {
            return Err(OxError::Unsupported("AES-chunk mode is not supported".into()));
        }
        let use_sha256 = flags & FLAG_USE_SHA256 != 0;
        let is_string = flags & FLAG_IS_STRING != 0;
        let is_utf8 = flags & FLAG_IS_UTF8 != 0;
        let has_extended = flags & FLAG_HAS_EXTENDED_DATA != 0;

        let type_byte = cursor.consume_u8()?;
        let compression_code = type_byte >> 4;
        let encryption_code = type_byte & 0x0F;
        if compression_code != 0 {
            return Err(OxError::Unsupported("compression is not supported".into()));
        }
        let encryption = match encryption_code {
            0 => EncryptionType::None,
            1 => EncryptionType::Aes256Gcm,
            other => return Err(OxError::Unsupported(format!("unknown encryption type {other}"))),
        };

        let size_types_byte = cursor.consume_u8()?;
        let count_st = SizeType::from_code(size_types_byte)?;
        let entry_st = SizeType::from_code(size_types_byte >> 2)?;

        let entry_count = cursor.consume_size(count_st)?;

        if has_extended {
            let _extended_magic = cursor.consume_u32()?;
            let header_ext_size = cursor.consume_u16()? as usize;
            let _dir_or_per_entry_stride = cursor.consume_u8()?;
            let _reserved = cursor.consume_u8()?;
            cursor.consume(header_ext_size)?;
        }

        let header_len = cursor.offset();
        let aad = &buf[..header_len];

        let body_slice: Vec<u8>;
        let data_offset_for_sub_file: usize;

        match encryption {
            EncryptionType::None => {
                let remaining = &buf[header_len..];
                body_slice = remaining.to_vec();
                data_offset_for_sub_file = header_len;
            }
            EncryptionType::Aes256Gcm => {
                let key_bytes = key.ok_or_else(|| {
                    OxError::Unauthorized("container is encrypted but no key was given".into())
                })?;
                let enc_key = EncryptionKey::new(*key_bytes);
                let iv: [u8; crypto::IV_LEN] = cursor.consume(crypto::IV_LEN)?.try_into().unwrap();
                let tag: [u8; crypto::TAG_LEN] = cursor.consume(crypto::TAG_LEN)?.try_into().unwrap();
                let ciphertext = &buf[cursor.offset()..];
                body_slice = crypto::decrypt(&enc_key, &iv, &tag, aad, ciphertext)?;
                data_offset_for_sub_file = buf.len();
            }
        }

        let mut body_cursor = Cursor::new(&body_slice);
        let mut lengths = Vec::with_capacity(entry_count as usize);
        let mut total_len: u64 = 0;
        for _ in 0..entry_count {
            let len = body_cursor.consume_size(entry_st)?;
            total_len = total_len
                .checked_add(len)
                .ok_or_else(|| OxError::Overflow("entry length accumulation overflowed".into()))?;
            lengths.push(len);
        }
        if total_len > (1u64 << 48) {
            return Err(OxError::Overflow("payload exceeds 48-bit buffer ceiling".into()));
        }

        let mut raw_entries = Vec::with_capacity(lengths.len());
        for len in &lengths {
            raw_entries.push(body_cursor.consume(*len as usize)?.to_vec());
        }

        if !is_sub_file && !body_cursor.is_empty() {
            return Err(OxError::InvalidState("leftover bytes after oiDL payload".into()));
        }

        let read_length = match encryption {
            EncryptionType::None => data_offset_for_sub_file + body_cursor.offset(),
            EncryptionType::Aes256Gcm => data_offset_for_sub_file,
        };

        let entries = if !is_string {
            DLEntries::Data(raw_entries)
        } else if is_utf8 {
            let mut v = Vec::with_capacity(raw_entries.len());
            for bytes in raw_entries {
                v.push(String::from_utf8(bytes).map_err(|_| {
                    OxError::InvalidState("entry is not valid UTF-8".into())
                })?);
            }
            DLEntries::Utf8(v)
        } else {
            let mut v = Vec::with_capacity(raw_entries.len());
            for bytes in raw_entries {
                if !bytes.iter().all(|b| *b < 0x80) {
                    return Err(OxError::InvalidState("ASCII entry contains a byte >= 0x80".into()));
                }
                v.push(String::from_utf8(bytes).map_err(|_| {
                    OxError::InvalidState("ASCII entry is not valid UTF-8".into())
                })?);
            }
            DLEntries::Ascii(v)
        };

        let data_type = match (is_string, is_utf8) {
            (false, _) => DataType::Data,
            (true, false) => DataType::Ascii,
            (true, true) => DataType::Utf8,
        };

        Ok(DLFile {
            settings: DLSettings {
                compression: CompressionType::None,
                encryption,
                data_type,
                use_sha256,
                key: key.copied(),
            },
            entries,
            read_length,
        })
    }

    /// Concatenates `a` and `b`'s entries, preserving order. Requires
    /// bit-identical settings (compared field-by-field, not by raw bytes
    /// the way the C reference compares a `U64` array — idiomatic here
    /// since the settings struct has no padding to worry about).
    pub fn combine(a: &DLFile, b: &DLFile) -> OxResult<DLFile> {
        let same = a.settings.compression == b.settings.compression
            && a.settings.encryption == b.settings.encryption
            && a.settings.data_type == b.settings.data_type
            && a.settings.use_sha256 == b.settings.use_sha256
            && a.settings.key == b.settings.key;
        if !same {
            return Err(OxError::InvalidParameter("settings mismatch in DLFile::combine".into()));
        }
        let entries = match (&a.entries, &b.entries) {
            (DLEntries::Data(x), DLEntries::Data(y)) => {
                DLEntries::Data(x.iter().chain(y.iter()).cloned().collect())
            }
            (DLEntries::Ascii(x), DLEntries::Ascii(y)) => {
                DLEntries::Ascii(x.iter().chain(y.iter()).cloned().collect())
            }
            (DLEntries::Utf8(x), DLEntries::Utf8(y)) => {
                DLEntries::Utf8(x.iter().chain(y.iter()).cloned().collect())
            }
            _ => return Err(OxError::InvalidParameter("entry kind mismatch in DLFile::combine".into())),
        };
        Ok(DLFile::new(a.settings.clone(), entries))
    }

    /// CRC32C or SHA-256 of `region`, per whichever hash the settings
    /// declare — exposed for callers (oiSH) that need the primitive
    /// directly rather than through a write/read round-trip.
    pub fn hash_region(use_sha256: bool, region: &[u8]) -> Vec<u8> {
        if use_sha256 {
            sha256::hash(region).to_vec()
        } else {
            crc32c::hash(region).to_le_bytes().to_vec()
        }
    }
}

impl PartialEq for DLSettings {
    fn eq(&self, other: &Self) -> bool {
        self.compression == other.compression
            && self.encryption == other.encryption
            && self.data_type == other.data_type
            && self.use_sha256 == other.use_sha256
            && self.key == other.key
    }
}
impl Eq for DLSettings {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_empty_list_no_encryption() {
        let file = DLFile::new(DLSettings::default(), DLEntries::Data(vec![]));
        let bytes = file.write(false).unwrap();
        assert_eq!(&bytes[0..4], &[0x6F, 0x69, 0x44, 0x4C]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[8..], &[0x00]);

        let back = DLFile::read(&bytes, None, false).unwrap();
        assert_eq!(back.entry_count(), 0);
    }

    #[test]
    fn s2_two_ascii_strings() {
        let mut settings = DLSettings::default();
        settings.data_type = DataType::Ascii;
        let file = DLFile::new(settings, DLEntries::Ascii(vec!["a".into(), "bc".into()]));
        let bytes = file.write(false).unwrap();

        // magic(4) version(1) flags(1) type(1) sizeTypes(1) count(1) = 9 bytes header
        assert_eq!(bytes[8], 2); // count
        assert_eq!(&bytes[9..11], &[0x01, 0x02]); // lengths table
        assert_eq!(&bytes[11..], b"abc");

        let back = DLFile::read(&bytes, None, false).unwrap();
        match back.entries {
            DLEntries::Ascii(v) => assert_eq!(v, vec!["a".to_string(), "bc".to_string()]),
            _ => panic!("expected ascii entries"),
        }
    }

    #[test]
    fn round_trip_data_entries() {
        let file = DLFile::new(
            DLSettings::default(),
            DLEntries::Data(vec![vec![1, 2, 3], vec![], vec![9; 300]]),
        );
        let bytes = file.write(false).unwrap();
        let back = DLFile::read(&bytes, None, false).unwrap();
        match back.entries {
            DLEntries::Data(v) => {
                assert_eq!(v[0], vec![1, 2, 3]);
                assert_eq!(v[1], Vec::<u8>::new());
                assert_eq!(v[2], vec![9u8; 300]);
            }
            _ => panic!("expected data entries"),
        }
    }

    #[test]
    fn s4_encrypted_round_trip_and_tamper() {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        let mut settings = DLSettings::default();
        settings.encryption = EncryptionType::Aes256Gcm;
        settings.key = Some(key);
        let file = DLFile::new(settings, DLEntries::Ascii(vec!["secret".into()]));
        let bytes = file.write(false).unwrap();

        // IV+tag slot sits right after the 9-byte header (count = 1 -> U8 width).
        let iv_tag_region = &bytes[9..9 + 28];
        assert!(iv_tag_region.iter().any(|b| *b != 0));

        let back = DLFile::read(&bytes, Some(&key), false).unwrap();
        match back.entries {
            DLEntries::Ascii(v) => assert_eq!(v, vec!["secret".to_string()]),
            _ => panic!("expected ascii entries"),
        }

        let mut tampered = bytes.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(matches!(
            DLFile::read(&tampered, Some(&key), false),
            Err(OxError::Unauthorized(_))
        ));
    }

    #[test]
    fn missing_key_is_unauthorized() {
        let mut settings = DLSettings::default();
        settings.encryption = EncryptionType::Aes256Gcm;
        settings.key = Some([1u8; 32]);
        let file = DLFile::new(settings, DLEntries::Data(vec![vec![1]]));
        let bytes = file.write(false).unwrap();
        assert!(matches!(
            DLFile::read(&bytes, None, false),
            Err(OxError::Unauthorized(_))
        ));
    }

    #[test]
    fn combine_requires_matching_settings() {
        let a = DLFile::new(DLSettings::default(), DLEntries::Data(vec![vec![1]]));
        let mut other_settings = DLSettings::default();
        other_settings.data_type = DataType::Ascii;
        let b = DLFile::new(other_settings, DLEntries::Ascii(vec!["x".into()]));
        assert!(DLFile::combine(&a, &b).is_err());
    }

    #[test]
    fn combine_concatenates() {
        let a = DLFile::new(DLSettings::default(), DLEntries::Data(vec![vec![1]]));
        let b = DLFile::new(DLSettings::default(), DLEntries::Data(vec![vec![2]]));
        let c = DLFile::combine(&a, &b).unwrap();
        match c.entries {
            DLEntries::Data(v) => assert_eq!(v, vec![vec![1], vec![2]]),
            _ => panic!(),
        }
    }

    #[test]
    fn sub_file_tolerates_missing_magic_and_trailing_bytes() {
        let file = DLFile::new(DLSettings::default(), DLEntries::Data(vec![vec![1, 2]]));
        let mut bytes = file.write(true).unwrap();
        bytes.extend_from_slice(&[0xAA, 0xBB]); // trailing bytes belonging to the outer format
        let back = DLFile::read(&bytes, None, true).unwrap();
        assert_eq!(back.read_length, bytes.len() - 2);
    }

    use proptest::prelude::*;

    proptest! {
        /// `spec.md` §8 law 1/2: `read(write(m)) == m` for any data-kind
        /// entry list, and `write` is deterministic (unencrypted, so no IV
        /// to vary run-to-run).
        #[test]
        fn data_round_trips_for_any_entry_list(entries in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let file = DLFile::new(DLSettings::default(), DLEntries::Data(entries.clone()));
            let bytes = file.write(false).unwrap();
            let bytes_again = file.write(false).unwrap();
            prop_assert_eq!(&bytes, &bytes_again);

            let back = DLFile::read(&bytes, None, false).unwrap();
            match back.entries {
                DLEntries::Data(v) => prop_assert_eq!(v, entries),
                _ => prop_assert!(false, "expected data entries"),
            }
        }
    }
}
