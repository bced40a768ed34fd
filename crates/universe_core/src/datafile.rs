//! Atom data file format & IO (append-only expansion log)
//!
//! Header (LE):
//!   magic[4]   = 0xDA7AF11E
//!   length[4]  = header frame length incl. CRC block
//!   uid[16]    = random file identity
//!   version[2] = DATA_FILE_VERSION
//!   elements*  = mark u8 | uvarint len | payload  ('P' = custom properties)
//!   'C' crc[4] = crc32 over magic..'C' inclusive
//!
//! Expansion record:
//!   marker[4] = 0xFFFFFFFF
//!   ucn         uvarint
//!   atom*     = 0x80 | atom_id uvarint | junction*
//!   junction  = code u8 | key uvarint | value
//!               0x00 long (zigzag varint)
//!               0x05 utf-8 string (uvarint len + bytes)
//!               0x06 iso string (uvarint len + latin-1 bytes)
//!               0x07 byte array (uvarint len + bytes; len 0 = empty)
//!               (code & 0xC0) == 0x40: skippable extension block
//!   0xC0      = no more atoms
//!   elements* | 'C' crc[4]
//!   end[4]    = 0xAAAAAAAA
//!
//! Records are written as one framed span each; zero bytes between records
//! are padding. A corrupt or truncated trailer is a hard format error.

use crate::atom::{Atom, AtomBuilder, Expansion, ExpansionSink};
use crate::consts::*;
use crate::errors::{Result, UniverseError};
use crate::particle::{iso_bytes, iso_string, Particle};
use crate::utils::{
    crc32, read_block, read_u16, read_u32, svarint_encode, svarint_read, uvarint_encode,
    uvarint_read, write_block,
};
use byteorder::ReadBytesExt;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Random 16-byte file identity, assigned at creation and stable for the
/// lifetime of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileUid([u8; FILE_UID_BYTES]);

impl FileUid {
    pub fn random() -> FileUid {
        let mut bytes = [0u8; FILE_UID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        FileUid(bytes)
    }

    pub fn from_bytes(bytes: [u8; FILE_UID_BYTES]) -> FileUid {
        FileUid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FILE_UID_BYTES] {
        &self.0
    }
}

impl fmt::Display for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// One physical expansion log.
#[derive(Debug)]
pub struct AtomDataFile {
    path: PathBuf,
    file: File,
    uid: FileUid,
    version: u16,
    custom_properties: BTreeMap<String, String>,
    read_only: bool,
}

impl AtomDataFile {
    /// Creates a new empty log with a fresh random UID.
    pub fn create(path: impl AsRef<Path>) -> Result<AtomDataFile> {
        AtomDataFile::create_with_properties(path, BTreeMap::new())
    }

    pub fn create_with_properties(
        path: impl AsRef<Path>,
        custom_properties: BTreeMap<String, String>,
    ) -> Result<AtomDataFile> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let uid = FileUid::random();
        let header = encode_header(&uid, DATA_FILE_VERSION, &custom_properties);
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(AtomDataFile {
            path,
            file,
            uid,
            version: DATA_FILE_VERSION,
            custom_properties,
            read_only: false,
        })
    }

    /// Opens an existing log and validates its header framing.
    pub fn open(path: impl AsRef<Path>) -> Result<AtomDataFile> {
        AtomDataFile::do_open(path, false)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<AtomDataFile> {
        AtomDataFile::do_open(path, true)
    }

    fn do_open(path: impl AsRef<Path>, read_only: bool) -> Result<AtomDataFile> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }
        let mut file = options.open(&path)?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut file);
        let (uid, version, custom_properties) = read_header(&mut reader)?;
        drop(reader);
        Ok(AtomDataFile { path, file, uid, version, custom_properties, read_only })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uid(&self) -> FileUid {
        self.uid
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn custom_properties(&self) -> &BTreeMap<String, String> {
        &self.custom_properties
    }

    /// Appends one expansion as a single framed write. On any error the
    /// expansion is not durable and the caller must retry the whole append.
    pub fn write_expansion(&mut self, info: &Expansion) -> Result<()> {
        if self.read_only {
            return Err(UniverseError::ReadOnly);
        }
        let frame = encode_expansion(info);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays every expansion from file start. The sink may stop the replay
    /// early by returning false. A corrupt tail surfaces as an error after
    /// every fully-parsed expansion has been delivered.
    pub fn read_all<S: ExpansionSink>(&mut self, sink: &mut S) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::with_capacity(16 * 1024, &mut self.file);
        read_header(&mut reader)?;
        loop {
            let info = match read_expansion(&mut reader)? {
                Some(info) => info,
                None => return Ok(()),
            };
            if !sink.visit_expansion(&info) {
                return Ok(());
            }
        }
    }
}

fn corrupt(what: impl Into<String>) -> UniverseError {
    UniverseError::Corrupt(what.into())
}

/// EOF inside a frame means a truncated trailer, which is a format error.
fn framed(e: io::Error) -> UniverseError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        corrupt("unexpected end of file inside a record")
    } else {
        UniverseError::Io(e)
    }
}

/// Reader wrapper that folds everything it reads into a running CRC.
struct FrameReader<'a, R: Read> {
    inner: &'a mut R,
    hasher: crc32fast::Hasher,
}

impl<'a, R: Read> FrameReader<'a, R> {
    fn new(inner: &'a mut R) -> FrameReader<'a, R> {
        FrameReader { inner, hasher: crc32fast::Hasher::new() }
    }

    fn seed(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn digest(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    fn read_unhashed_u32(&mut self) -> io::Result<u32> {
        read_u32(self.inner)
    }
}

impl<'a, R: Read> Read for FrameReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn encode_header(
    uid: &FileUid,
    version: u16,
    custom_properties: &BTreeMap<String, String>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&SIGNATURE.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // length, patched below
    buf.extend_from_slice(uid.as_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    if !custom_properties.is_empty() {
        let mut payload = Vec::new();
        uvarint_encode(custom_properties.len() as u64, &mut payload);
        for (key, value) in custom_properties {
            write_block(&mut payload, key.as_bytes());
            write_block(&mut payload, value.as_bytes());
        }
        buf.push(CUSTOM_PROPERTIES_MARK);
        write_block(&mut buf, &payload);
    }
    let total = buf.len() as u32 + CRC_BLOCK_LENGTH;
    buf[4..8].copy_from_slice(&total.to_le_bytes());
    buf.push(CRC_MARK);
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn read_header<R: Read>(
    r: &mut R,
) -> Result<(FileUid, u16, BTreeMap<String, String>)> {
    let mut fr = FrameReader::new(r);
    let magic = read_u32(&mut fr).map_err(|_| UniverseError::BadHeader)?;
    if magic != SIGNATURE {
        return Err(UniverseError::BadHeader);
    }
    read_u32(&mut fr).map_err(|_| UniverseError::BadHeader)?; // header length
    let mut uid = [0u8; FILE_UID_BYTES];
    fr.read_exact(&mut uid).map_err(|_| UniverseError::BadHeader)?;
    let version = read_u16(&mut fr).map_err(|_| UniverseError::BadHeader)?;
    if !version_supported(version) {
        return Err(UniverseError::UnsupportedVersion(version));
    }
    let mut custom_properties = BTreeMap::new();
    loop {
        let mark = fr.read_u8().map_err(framed)?;
        if mark == CRC_MARK {
            let digest = fr.digest();
            let stored = fr.read_unhashed_u32().map_err(framed)?;
            if stored != digest {
                return Err(corrupt("header crc mismatch"));
            }
            break;
        } else if mark == CUSTOM_PROPERTIES_MARK {
            let payload = read_block(&mut fr).map_err(framed)?;
            custom_properties = parse_properties(&payload)?;
        } else {
            // unknown element, skippable by its length prefix
            read_block(&mut fr).map_err(framed)?;
        }
    }
    Ok((FileUid::from_bytes(uid), version, custom_properties))
}

fn version_supported(version: u16) -> bool {
    version >= MIN_SUPPORTED_VERSION && version < DATA_FILE_VERSION + VERSION_AGE
}

fn parse_properties(payload: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut r = payload;
    let count = uvarint_read(&mut r).map_err(framed)?;
    let mut result = BTreeMap::new();
    for _ in 0..count {
        let key = read_block(&mut r).map_err(framed)?;
        let value = read_block(&mut r).map_err(framed)?;
        let key = String::from_utf8(key).map_err(|_| corrupt("bad property key"))?;
        let value = String::from_utf8(value).map_err(|_| corrupt("bad property value"))?;
        result.insert(key, value);
    }
    Ok(result)
}

fn encode_expansion(info: &Expansion) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(&EXPANSION_MARKER.to_le_bytes());
    uvarint_encode(info.ucn, &mut buf);
    for atom in &info.atoms {
        buf.push(ATOM_MARKER);
        uvarint_encode(atom.id(), &mut buf);
        for (key, particle) in atom.junctions() {
            write_junction(&mut buf, key, particle);
        }
    }
    buf.push(NO_MORE_ATOMS_MARKER);
    buf.push(CRC_MARK);
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&EXPANSION_END_MARKER.to_le_bytes());
    buf
}

fn write_junction(buf: &mut Vec<u8>, key: u64, particle: &Particle) {
    match particle {
        Particle::Long(v) => {
            buf.push(VALUECODE_COMPACTLONG);
            uvarint_encode(key, buf);
            svarint_encode(*v, buf);
        }
        Particle::IsoString(s) => {
            buf.push(VALUECODE_STRING);
            uvarint_encode(key, buf);
            write_block(buf, &iso_bytes(s));
        }
        Particle::Utf8String(s) => {
            buf.push(VALUECODE_UTF8STRING);
            uvarint_encode(key, buf);
            write_block(buf, s.as_bytes());
        }
        Particle::Empty => {
            buf.push(VALUECODE_BYTEARRAY);
            uvarint_encode(key, buf);
            write_block(buf, &[]);
        }
        Particle::Bytes(b) => {
            buf.push(VALUECODE_BYTEARRAY);
            uvarint_encode(key, buf);
            write_block(buf, b);
        }
    }
}

fn read_value<R: Read>(code: u8, r: &mut R) -> Result<Particle> {
    match code {
        VALUECODE_COMPACTLONG => Ok(Particle::Long(svarint_read(r).map_err(framed)?)),
        VALUECODE_STRING => Ok(Particle::IsoString(iso_string(&read_block(r).map_err(framed)?))),
        VALUECODE_UTF8STRING => {
            let bytes = read_block(r).map_err(framed)?;
            let s = String::from_utf8(bytes).map_err(|_| corrupt("bad utf-8 string value"))?;
            Ok(Particle::Utf8String(s))
        }
        VALUECODE_BYTEARRAY => {
            let bytes = read_block(r).map_err(framed)?;
            if bytes.is_empty() {
                Ok(Particle::Empty)
            } else {
                Ok(Particle::Bytes(bytes))
            }
        }
        other => Err(corrupt(format!("unknown value type {other}"))),
    }
}

/// Reads one expansion record, or None at a clean end of file. Leading
/// padding bytes before the record marker are skipped.
fn read_expansion<R: Read>(r: &mut R) -> Result<Option<Expansion>> {
    let first = loop {
        let mut byte = [0u8; 1];
        match r.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                if byte[0] != PADDING_BYTE {
                    break byte[0];
                }
            }
            Err(e) => return Err(framed(e)),
        }
    };
    let mut fr = FrameReader::new(r);
    fr.seed(&[first]);
    let mut rest = [0u8; 3];
    fr.read_exact(&mut rest).map_err(framed)?;
    let marker = u32::from_le_bytes([first, rest[0], rest[1], rest[2]]);
    if marker != EXPANSION_MARKER {
        return Err(corrupt(format!("bad record marker {marker:#010x}")));
    }

    let ucn = uvarint_read(&mut fr).map_err(framed)?;
    let mut atoms: Vec<Atom> = Vec::new();
    let mut current: Option<AtomBuilder> = None;
    loop {
        let m = fr.read_u8().map_err(framed)?;
        if m == NO_MORE_ATOMS_MARKER {
            if let Some(builder) = current.take() {
                atoms.push(builder.finish(ucn));
            }
            break;
        }
        if m == ATOM_MARKER {
            if let Some(builder) = current.take() {
                atoms.push(builder.finish(ucn));
            }
            let id = uvarint_read(&mut fr).map_err(framed)?;
            current = Some(AtomBuilder::new(id, 4));
            continue;
        }
        let builder = match current.as_mut() {
            Some(b) => b,
            None => return Err(corrupt(format!("junction byte {m:#04x} before any atom"))),
        };
        if m & EXTENSION_MASK == EXTENSION_BITS {
            read_block(&mut fr).map_err(framed)?;
            continue;
        }
        if m & EXTENSION_MASK != 0 {
            return Err(corrupt(format!("bad junction marker {m:#04x}")));
        }
        let key = uvarint_read(&mut fr).map_err(framed)?;
        let value = read_value(m & 0x3F, &mut fr)?;
        builder.junction(key, value);
    }

    loop {
        let mark = fr.read_u8().map_err(framed)?;
        if mark == CRC_MARK {
            let digest = fr.digest();
            let stored = fr.read_unhashed_u32().map_err(framed)?;
            if stored != digest {
                return Err(corrupt("record crc mismatch"));
            }
            break;
        }
        read_block(&mut fr).map_err(framed)?;
    }
    let end = fr.read_unhashed_u32().map_err(framed)?;
    if end != EXPANSION_END_MARKER {
        return Err(corrupt(format!("invalid record end marker {end:#010x}")));
    }
    Ok(Some(Expansion::new(ucn, atoms)))
}
