//! oiCA: a virtual filesystem archive built on top of oiDL (C7).
//!
//! Wire layout (`spec.md` §3/§4.7):
//!
//! ```text
//! [magic] [version] [type] [flags]
//! [fileCount] [dirCount] [iv][tag]?
//! [embedded oiDL: dir names..., file names...]
//! [directory table: parent index per dir]
//! [file table: parent index, date?, data length]
//! [blob heap]
//! ```
//!
//! Directory and file rows are sorted `(depth asc, case-insensitive name
//! asc)`, which lets parent indices be resolved by a single backward scan.

use crate::archive::{Archive, EntryKind};
use crate::crypto::{self, EncryptionKey};
use crate::error::{OxError, OxResult};
use crate::formats::oidl::{DLEntries, DLFile, DLSettings};
use crate::size::{decode_version, encode_version, Cursor, SizeType, Writer};

pub const MAGIC: u32 = 0x4143_696F;

const FLAG_USE_SHA256: u16 = 1 << 0;
const FLAG_FILES_HAVE_DATE: u16 = 1 << 1;
const FLAG_FILES_HAVE_EXTENDED_DATE: u16 = 1 << 2;
const FLAG_FILE_SIZE_TYPE_SHIFT: u16 = 3;
const FLAG_AES_CHUNK_MASK: u16 = 0b11 << 5;
const FLAG_HAS_EXTENDED_DATA: u16 = 1 << 7;
const FLAG_DIRECTORIES_COUNT_LONG: u16 = 1 << 10;
const FLAG_FILES_COUNT_LONG: u16 = 1 << 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    None = 0,
    Aes256Gcm = 1,
}

/// Settings for an oiCA container (`original_source/inc/formats/oiCA.h::CASettings`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CASettings {
    pub compression: CompressionType,
    pub encryption: EncryptionType,
    pub include_date: bool,
    pub include_full_date: bool,
    pub use_sha256: bool,
    pub key: Option<[u8; 32]>,
}

impl Default for CASettings {
    fn default() -> Self {
        Self {
            compression: CompressionType::None,
            encryption: EncryptionType::None,
            include_date: false,
            include_full_date: false,
            use_sha256: false,
            key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CAFile {
    pub settings: CASettings,
    pub archive: Archive,
}

/// Seconds-since-epoch granularity is halved to fit the DOS `time` field's
/// 5-bit second slot (`original_source/src/formats/oiCA.c::CAFile_storeDate`).
///
/// Unlike the original C, this encode/decode pair is internally consistent:
/// year occupies bits 9-15 of `date` on both sides (7 bits, matching the
/// `[1980, 2107]` range). The original's `CAFile_storeDate` writes year at
/// `<<11` while `CAFile_loadDate` reads it back with `>>9` — a mismatch that
/// would both truncate the year to 5 bits and break the round-trip law
/// (`spec.md` §8 law 1) were it carried over verbatim; this implementation
/// follows the read side's bit position since it matches the documented
/// year range. Day/month/hour/minute bit widths match the original.
pub fn store_date(unix_ns: u64) -> Option<(u16, u16)> {
    let secs = unix_ns / 1_000_000_000;
    let days = secs / 86_400;
    let day_secs = secs % 86_400;
    let hour = (day_secs / 3600) as u16;
    let minute = ((day_secs % 3600) / 60) as u16;
    let second = (day_secs % 60) as u16;

    let (year, month, day) = civil_from_days(days as i64);
    if year < 1980 || year > (1980 + 0x7F) {
        return None;
    }

    let time = (second >> 1) | (minute << 5) | (hour << 11);
    let date = (day as u16) | ((month as u16) << 5) | (((year - 1980) as u16) << 9);
    Some((time, date))
}

/// Returns `0` (unknown timestamp) rather than failing when the DOS fields
/// decode to an impossible date — deliberate per `spec.md` §9 Open Question.
pub fn load_date(time: u16, date: u16) -> u64 {
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0xF) as u32;
    let year = 1980 + (date >> 9) as i64;

    let second = ((time & 0x1F) << 1) as u64;
    let minute = ((time >> 5) & 0x3F) as u64;
    let hour = (time >> 11) as u64;

    if day == 0 || day > 31 || month == 0 || month > 12 || hour > 23 || minute > 59 {
        return 0;
    }

    let days = days_from_civil(year, month, day);
    if days < 0 {
        return 0;
    }
    let secs = days as u64 * 86_400 + hour * 3600 + minute * 60 + second;
    secs * 1_000_000_000
}

/// Howard Hinnant's civil-from-days algorithm (proleptic Gregorian, days
/// since 1970-01-01).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

impl CAFile {
    pub fn new(settings: CASettings, archive: Archive) -> Self {
        Self { settings, archive }
    }

    pub fn write(&self) -> OxResult<Vec<u8>> {
        if !matches!(self.settings.compression, CompressionType::None) {
            return Err(OxError::Unsupported("compression is not supported".into()));
        }

        let mut directories: Vec<String> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        for entry in self.archive.canonical_order() {
            match entry.kind {
                EntryKind::Folder => directories.push(entry.path.clone()),
                EntryKind::File => files.push(entry.path.clone()),
            }
        }

        if directories.len() >= 0xFFFE {
            return Err(OxError::OutOfBounds("too many directories for oiCA".into()));
        }
        if files.len() >= 0xFFFF_FFFE {
            return Err(OxError::OutOfBounds("too many files for oiCA".into()));
        }

        let dirs_long = directories.len() > 254;
        let files_long = files.len() > 0xFFFE;

        let max_file_len = files
            .iter()
            .map(|p| self.archive.get_data(p).map(|d| d.len() as u64))
            .collect::<OxResult<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);
        let size_type = SizeType::required_for(max_file_len);

        // Embedded oiDL: directory basenames, then file basenames, ASCII, no magic.
        let mut names: Vec<String> = Vec::with_capacity(directories.len() + files.len());
        names.extend(directories.iter().map(|p| basename(p).to_string()));
        names.extend(files.iter().map(|p| basename(p).to_string()));
        let dl = DLFile::new(DLSettings { data_type: crate::formats::oidl::DataType::Ascii, ..Default::default() }, DLEntries::Ascii(names));
        let dl_bytes = dl.write(true)?;

        let mut flags = 0u16;
        if self.settings.use_sha256 {
            flags |= FLAG_USE_SHA256;
        }
        if self.settings.include_full_date {
            flags |= FLAG_FILES_HAVE_DATE | FLAG_FILES_HAVE_EXTENDED_DATE;
        } else if self.settings.include_date {
            flags |= FLAG_FILES_HAVE_DATE;
        }
        flags |= (size_type.code() as u16) << FLAG_FILE_SIZE_TYPE_SHIFT;
        if dirs_long {
            flags |= FLAG_DIRECTORIES_COUNT_LONG;
        }
        if files_long {
            flags |= FLAG_FILES_COUNT_LONG;
        }

        let mut header = Writer::new();
        header.put_u32(MAGIC);
        header.put_u8(encode_version(1, 0)?);
        header.put_u8((self.settings.compression as u8) << 4 | self.settings.encryption as u8);
        header.put_u16(flags);

        if files_long {
            header.put_u32(files.len() as u32);
        } else {
            header.put_u16(files.len() as u16);
        }
        if dirs_long {
            header.put_u16(directories.len() as u16);
        } else {
            header.put_u8(directories.len() as u8);
        }

        let mut body = Writer::new();
        body.put_bytes(&dl_bytes);

        for (i, dir) in directories.iter().enumerate() {
            let parent = find_parent_index(&directories[..i], dir);
            write_dir_index(&mut body, dirs_long, parent);
        }

        let mut blob = Writer::new();
        for file in &files {
            let parent = find_parent_index(&directories, file);
            write_dir_index(&mut body, dirs_long, parent);

            let entry = self.archive.get_info(file)?;
            if self.settings.include_full_date {
                body.put_u64(entry.timestamp);
            } else if self.settings.include_date {
                let (time, date) = store_date(entry.timestamp).ok_or_else(|| {
                    OxError::InvalidState(format!(
                        "{file}: timestamp can't be represented as a DOS date, use --full-date"
                    ))
                })?;
                body.put_u16(time);
                body.put_u16(date);
            }

            let data = self.archive.get_data(file)?;
            body.put_size(size_type, data.len() as u64)?;
            blob.put_bytes(data);
        }
        body.put_bytes(&blob.buf);

        let mut out = header.buf;
        match self.settings.encryption {
            EncryptionType::None => out.extend_from_slice(&body.buf),
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

    pub fn read(buf: &[u8], key: Option<&[u8; 32]>) -> OxResult<Self> {
        let mut cursor = Cursor::new(buf);

        let magic = cursor.consume_u32()?;
        if magic != MAGIC {
            return Err(OxError::Unsupported(format!("bad oiCA magic number: {magic:#x}")));
        }
        let version_byte = cursor.consume_u8()?;
        let (major, minor) = decode_version(version_byte);
        if (major, minor) != (1, 0) {
            return Err(OxError::Unsupported(format!("unsupported oiCA version {major}.{minor}")));
        }

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

        let flags = cursor.consume_u16()?;
        if flags & FLAG_AES_CHUNK_MASK != 0 {
            return Err(OxError::Unsupported("AES-chunk mode is not supported".into()));
        }
        if flags & FLAG_HAS_EXTENDED_DATA != 0 {
            return Err(OxError::Unsupported("extended info records are not supported".into()));
        }
        let use_sha256 = flags & FLAG_USE_SHA256 != 0;
        let has_date = flags & FLAG_FILES_HAVE_DATE != 0;
        let has_full_date = flags & FLAG_FILES_HAVE_EXTENDED_DATE != 0;
        let size_type = SizeType::from_code(((flags >> FLAG_FILE_SIZE_TYPE_SHIFT) & 0b11) as u8)?;
        let dirs_long = flags & FLAG_DIRECTORIES_COUNT_LONG != 0;
        let files_long = flags & FLAG_FILES_COUNT_LONG != 0;

        let file_count = if files_long {
            cursor.consume_u32()? as usize
        } else {
            cursor.consume_u16()? as usize
        };
        let dir_count = if dirs_long {
            cursor.consume_u16()? as usize
        } else {
            cursor.consume_u8()? as usize
        };

        let header_len = cursor.offset();
        let aad = &buf[..header_len];

        let body: Vec<u8>;
        match encryption {
            EncryptionType::None => {
                body = buf[header_len..].to_vec();
            }
            EncryptionType::Aes256Gcm => {
                let key_bytes = key.ok_or_else(|| {
                    OxError::Unauthorized("container is encrypted but no key was given".into())
                })?;
                let enc_key = EncryptionKey::new(*key_bytes);
                let iv: [u8; crypto::IV_LEN] = cursor.consume(crypto::IV_LEN)?.try_into().unwrap();
                let tag: [u8; crypto::TAG_LEN] = cursor.consume(crypto::TAG_LEN)?.try_into().unwrap();
                let ciphertext = &buf[cursor.offset()..];
                body = crypto::decrypt(&enc_key, &iv, &tag, aad, ciphertext)?;
            }
        }

        let dl = DLFile::read(&body, None, true)?;
        let names = match &dl.entries {
            DLEntries::Ascii(v) => v.clone(),
            _ => return Err(OxError::InvalidState("embedded oiDL must be ASCII names".into())),
        };
        if names.len() != dir_count + file_count {
            return Err(OxError::InvalidState(
                "embedded oiDL entry count doesn't match directory+file count".into(),
            ));
        }
        let dir_names = &names[..dir_count];
        let file_names = &names[dir_count..];

        let mut body_cursor = Cursor::new(&body);
        body_cursor.consume(dl.read_length)?;

        let mut dir_parents: Vec<Option<usize>> = Vec::with_capacity(dir_count);
        for i in 0..dir_count {
            let parent = read_dir_index(&mut body_cursor, dirs_long)?;
            if let Some(p) = parent {
                if p >= i {
                    return Err(OxError::InvalidState(format!(
                        "directory {i} has a parent index >= its own index"
                    )));
                }
            }
            dir_parents.push(parent);
        }

        let mut dir_paths: Vec<String> = Vec::with_capacity(dir_count);
        for (i, name) in dir_names.iter().enumerate() {
            let path = match dir_parents[i] {
                Some(p) => format!("{}/{}", dir_paths[p], name),
                None => name.clone(),
            };
            dir_paths.push(path);
        }

        let mut archive = Archive::new();
        for path in &dir_paths {
            archive.add_directory(path)?;
        }

        struct PendingFile {
            path: String,
            timestamp: u64,
            len: u64,
        }
        let mut pending = Vec::with_capacity(file_count);
        for (i, name) in file_names.iter().enumerate() {
            let parent = read_dir_index(&mut body_cursor, dirs_long)?;
            // Root files carry the sentinel "no parent"; only validate range when present.
            if let Some(p) = parent {
                if p >= dir_count {
                    return Err(OxError::InvalidState(format!(
                        "file {i} parent index {p} >= directory count {dir_count}"
                    )));
                }
            }

            let timestamp = if has_full_date {
                body_cursor.consume_u64()?
            } else if has_date {
                let time = body_cursor.consume_u16()?;
                let date = body_cursor.consume_u16()?;
                load_date(time, date)
            } else {
                0
            };

            let len = body_cursor.consume_size(size_type)?;
            let path = match parent {
                Some(p) => format!("{}/{}", dir_paths[p], name),
                None => name.clone(),
            };
            pending.push(PendingFile { path, timestamp, len });
        }

        for file in pending {
            let data = body_cursor.consume(file.len as usize)?.to_vec();
            archive.add_file(&file.path, data, file.timestamp)?;
        }

        if !body_cursor.is_empty() {
            return Err(OxError::InvalidState("leftover bytes after oiCA blob heap".into()));
        }

        for entry in archive.canonical_order() {
            if !crate::archive::is_valid_path(&entry.path) {
                return Err(OxError::InvalidState(format!(
                    "{} is not a valid archive path",
                    entry.path
                )));
            }
        }

        Ok(CAFile {
            settings: CASettings {
                compression: CompressionType::None,
                encryption,
                include_date: has_date,
                include_full_date: has_full_date,
                use_sha256,
                key: key.copied(),
            },
            archive,
        })
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}

/// Backward scan for the case-insensitive match of `path`'s parent among
/// `sorted` (parents always precede children in the canonical order, per
/// `spec.md` §4.7 "Reconstructing paths").
fn find_parent_index(sorted: &[String], path: &str) -> Option<usize> {
    let parent = parent_path(path)?;
    sorted
        .iter()
        .enumerate()
        .rev()
        .find(|(_, p)| p.eq_ignore_ascii_case(parent))
        .map(|(i, _)| i)
}

fn write_dir_index(w: &mut Writer, long: bool, parent: Option<usize>) {
    if long {
        w.put_u16(parent.map(|p| p as u16).unwrap_or(0xFFFF));
    } else {
        w.put_u8(parent.map(|p| p as u8).unwrap_or(0xFF));
    }
}

fn read_dir_index(c: &mut Cursor, long: bool) -> OxResult<Option<usize>> {
    if long {
        let v = c.consume_u16()?;
        Ok(if v == 0xFFFF { None } else { Some(v as usize) })
    } else {
        let v = c.consume_u8()?;
        Ok(if v == 0xFF { None } else { Some(v as usize) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_single_root_file() {
        let mut archive = Archive::new();
        archive.add_file("foo.txt", b"hi".to_vec(), 0).unwrap();
        let ca = CAFile::new(CASettings::default(), archive);
        let bytes = ca.write().unwrap();

        assert_eq!(&bytes[0..4], &[0x6F, 0x69, 0x43, 0x41]);
        // version(1) type(1) flags(2) = 4 bytes; then fileCount(u16)=1, dirCount(u8)=0
        assert_eq!(&bytes[6..8], &[0x01, 0x00]);
        assert_eq!(bytes[8], 0x00);

        let back = CAFile::read(&bytes, None).unwrap();
        assert!(back.archive.has_file("foo.txt"));
        assert_eq!(back.archive.get_data("foo.txt").unwrap(), b"hi");
    }

    #[test]
    fn round_trip_nested_directories() {
        let mut archive = Archive::new();
        archive.add_file("a/b/c.bin", vec![1, 2, 3, 4], 0).unwrap();
        archive.add_file("a/d.bin", vec![5; 10], 0).unwrap();
        archive.add_directory("empty").unwrap();
        let ca = CAFile::new(CASettings::default(), archive);
        let bytes = ca.write().unwrap();
        let back = CAFile::read(&bytes, None).unwrap();

        assert!(back.archive.has_folder("a"));
        assert!(back.archive.has_folder("a/b"));
        assert!(back.archive.has_folder("empty"));
        assert_eq!(back.archive.get_data("a/b/c.bin").unwrap(), &[1, 2, 3, 4]);
        assert_eq!(back.archive.get_data("a/d.bin").unwrap(), &[5u8; 10]);
    }

    #[test]
    fn encrypted_round_trip_and_tamper() {
        let mut archive = Archive::new();
        archive.add_file("secret.bin", b"classified".to_vec(), 0).unwrap();
        let mut settings = CASettings::default();
        settings.encryption = EncryptionType::Aes256Gcm;
        settings.key = Some([9u8; 32]);
        let ca = CAFile::new(settings, archive);
        let bytes = ca.write().unwrap();

        let back = CAFile::read(&bytes, Some(&[9u8; 32])).unwrap();
        assert_eq!(back.archive.get_data("secret.bin").unwrap(), b"classified");

        let mut tampered = bytes.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(matches!(
            CAFile::read(&tampered, Some(&[9u8; 32])),
            Err(OxError::Unauthorized(_))
        ));
    }

    #[test]
    fn date_round_trip() {
        // 2024-03-15 12:34:56 UTC, truncated to 2-second DOS granularity.
        let ns = 1_710_505_000_000_000_000u64;
        let (time, date) = store_date(ns).unwrap();
        let back = load_date(time, date);
        assert!(back > 0);
        assert!(back <= ns);
        assert!(ns - back < 2_000_000_000);
    }

    #[test]
    fn date_out_of_range_fails_store() {
        // Year 1970 is before the DOS epoch.
        assert!(store_date(0).is_none());
    }

    #[test]
    fn parent_index_resolution() {
        let dirs = vec!["a".to_string(), "a/b".to_string(), "z".to_string()];
        assert_eq!(find_parent_index(&dirs, "a/b/c"), Some(1));
        assert_eq!(find_parent_index(&dirs, "a/x"), Some(0));
        assert_eq!(find_parent_index(&dirs, "z/y"), Some(2));
        assert_eq!(find_parent_index(&dirs, "root-file"), None);
    }
}
