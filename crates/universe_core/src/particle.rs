//! Particle: the atomic unit of marshalled data stored inside an atom.
//!
//! A closed tagged union. Equality and hashing are defined over the
//! marshalled raw bytes, so particles produced by different code paths but
//! encoding the same bytes compare equal (`Empty` == zero-length `Bytes`,
//! `Long(2)` == `Bytes` of the same eight bytes).

use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub enum Particle {
    Empty,
    Long(i64),
    /// 8-bit/Latin-1 text, used for short identifiers.
    IsoString(String),
    Utf8String(String),
    Bytes(Vec<u8>),
}

impl Particle {
    pub fn empty() -> Particle {
        Particle::Empty
    }

    pub fn long(value: i64) -> Particle {
        Particle::Long(value)
    }

    pub fn iso(value: impl Into<String>) -> Particle {
        Particle::IsoString(value.into())
    }

    pub fn utf8(value: impl Into<String>) -> Particle {
        Particle::Utf8String(value.into())
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Particle {
        Particle::Bytes(value.into())
    }

    /// Marshalled bytes of this particle.
    pub fn raw(&self) -> Vec<u8> {
        match self {
            Particle::Empty => Vec::new(),
            Particle::Long(v) => v.to_be_bytes().to_vec(),
            Particle::IsoString(s) => iso_bytes(s),
            Particle::Utf8String(s) => s.as_bytes().to_vec(),
            Particle::Bytes(b) => b.clone(),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Particle::Empty => 0,
            Particle::Long(_) => 8,
            Particle::IsoString(s) => s.chars().count(),
            Particle::Utf8String(s) => s.len(),
            Particle::Bytes(b) => b.len(),
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Particle::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Particle::IsoString(s) | Particle::Utf8String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Particle {
    fn eq(&self, other: &Particle) -> bool {
        match (self, other) {
            (Particle::Long(a), Particle::Long(b)) => a == b,
            (Particle::IsoString(a), Particle::IsoString(b)) => a == b,
            (Particle::Utf8String(a), Particle::Utf8String(b)) => a == b,
            (Particle::Bytes(a), Particle::Bytes(b)) => a == b,
            (Particle::Empty, Particle::Empty) => true,
            (a, b) => a.byte_len() == b.byte_len() && a.raw() == b.raw(),
        }
    }
}

impl Eq for Particle {}

impl Hash for Particle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.raw());
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Particle::Empty => write!(f, "[E]"),
            Particle::Long(v) => write!(f, "L:{v}"),
            Particle::IsoString(s) => write!(f, "S:{s}"),
            Particle::Utf8String(s) => write!(f, "U:{s}"),
            Particle::Bytes(b) => write!(f, "A:[{}]", b.len()),
        }
    }
}

/// Latin-1 marshalling; chars above U+00FF degrade to '?'.
pub fn iso_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
        .collect()
}

pub fn iso_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
