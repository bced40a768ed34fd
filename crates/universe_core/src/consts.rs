// crates/universe_core/src/consts.rs

/// File-level magic at offset 0 of every data file.
pub const SIGNATURE: u32 = 0xDA7A_F11E;

/// Format version written into new files.
pub const DATA_FILE_VERSION: u16 = 3;
/// Oldest version this reader still parses in full.
pub const MIN_SUPPORTED_VERSION: u16 = 1;
/// Tolerance window: files written by versions up to
/// `DATA_FILE_VERSION + VERSION_AGE` (exclusive) still open, so older
/// tooling can identify and back up files it cannot fully parse.
pub const VERSION_AGE: u16 = 1000;

pub const FILE_UID_BYTES: usize = 16;

/// Expansion record framing.
pub const EXPANSION_MARKER: u32 = 0xFFFF_FFFF;
pub const EXPANSION_END_MARKER: u32 = 0xAAAA_AAAA;
pub const ATOM_MARKER: u8 = 0x80;
pub const NO_MORE_ATOMS_MARKER: u8 = 0xC0;

/// Junction value codes (low 6 bits of the junction marker byte).
pub const VALUECODE_COMPACTLONG: u8 = 0x00;
pub const VALUECODE_UTF8STRING: u8 = 0x05;
pub const VALUECODE_STRING: u8 = 0x06;
pub const VALUECODE_BYTEARRAY: u8 = 0x07;

/// (marker & 0xC0) == 0x40 marks a skippable atom extension block.
pub const EXTENSION_MASK: u8 = 0xC0;
pub const EXTENSION_BITS: u8 = 0x40;

/// Custom element marks inside CRC-framed blocks.
pub const CUSTOM_PROPERTIES_MARK: u8 = b'P';
pub const CRC_MARK: u8 = b'C';
/// 1-byte mark + 4-byte CRC32.
pub const CRC_BLOCK_LENGTH: u32 = 5;

pub const PADDING_BYTE: u8 = 0x00;

/// Default data file name inside a database directory.
pub const DATA_FILE_NAME: &str = "universe.db";
/// Backup directories are created under `<db_dir>/backup/<timestamp>`.
pub const BACKUP_DIR_NAME: &str = "backup";

/// First UCN ever assigned by a fresh universe.
pub const START_UCN: u64 = 1;
