//! # oxc3 — OxC3 container format reference implementation
//!
//! Format guarantees:
//! - All numeric fields are little-endian; width is never negotiated, only
//!   ever narrowed to the minimal [`SizeType`] that fits (C1)
//! - Every container is self-describing: a 4-byte magic number, a packed
//!   version byte, and a settings/flags byte or two — no out-of-band schema
//! - Encryption, where enabled, is AES-256-GCM with the plaintext header as
//!   associated data; a tampered header or body fails closed (C4)
//! - oiCA and oiSH are both built on top of the oiDL list container rather
//!   than inventing their own string/blob table format (C6-C8)
//! - Sub-file embedding (`isSubFile`) tolerates a missing magic number and
//!   trailing bytes after the payload, so one format can nest inside another

pub mod archive;
pub mod crc32c;
pub mod crypto;
pub mod error;
pub mod formats;
pub mod sha256;
pub mod size;

pub use archive::{Archive, ArchiveEntry, EntryKind};
pub use crypto::{EncryptionKey, IV_LEN, KEY_LEN, TAG_LEN};
pub use error::{OxError, OxResult};
pub use formats::oica::{CAFile, CASettings, CompressionType as CACompressionType, EncryptionType as CAEncryptionType};
pub use formats::oidl::{CompressionType as DLCompressionType, DataType, DLEntries, DLFile, DLSettings, EncryptionType as DLEncryptionType};
pub use formats::oish::{BinaryType, PipelineStage, SHBinaryIdentifier, SHBinaryInfo, SHEntry, SHFile, SHInclude, SHRegister, SHSettings};
pub use size::{decode_version, encode_version, Cursor, SizeType, Writer};
