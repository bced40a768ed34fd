//! Atoms: immutable versioned records of one entity's junction values.
//!
//! An atom is built through the mutable `AtomBuilder` and sealed with the
//! UCN assigned at commit time; after sealing all reads are pure value
//! accesses. Junctions are kept sorted by key so lookup is a binary search.

use crate::particle::Particle;
use std::fmt;
use std::sync::Arc;

pub type AtomId = u64;
/// Universe Change Number: global monotonically increasing commit counter.
pub type Ucn = u64;

/// Mutable construction phase of an atom.
#[derive(Debug, Clone)]
pub struct AtomBuilder {
    id: AtomId,
    junctions: Vec<(u64, Particle)>,
}

impl AtomBuilder {
    pub fn new(id: AtomId, junction_capacity: usize) -> AtomBuilder {
        AtomBuilder { id, junctions: Vec::with_capacity(junction_capacity) }
    }

    pub fn id(&self) -> AtomId {
        self.id
    }

    /// Adds or replaces one junction, keeping keys sorted and unique.
    pub fn junction(&mut self, key: u64, particle: Particle) -> &mut AtomBuilder {
        match self.junctions.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) => self.junctions[i].1 = particle,
            Err(i) => self.junctions.insert(i, (key, particle)),
        }
        self
    }

    pub fn junction_count(&self) -> usize {
        self.junctions.len()
    }

    /// Seals the atom with its commit UCN. No mutation is possible afterwards.
    pub fn finish(self, ucn: Ucn) -> Atom {
        Atom { id: self.id, ucn, junctions: self.junctions }
    }
}

/// Immutable record: entity id, commit UCN, sorted junction map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    id: AtomId,
    ucn: Ucn,
    junctions: Vec<(u64, Particle)>,
}

impl Atom {
    pub fn id(&self) -> AtomId {
        self.id
    }

    pub fn ucn(&self) -> Ucn {
        self.ucn
    }

    pub fn get(&self, key: u64) -> Option<&Particle> {
        self.junctions
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|i| &self.junctions[i].1)
    }

    pub fn get_long(&self, key: u64) -> Option<i64> {
        self.get(key).and_then(Particle::as_long)
    }

    pub fn get_str(&self, key: u64) -> Option<&str> {
        self.get(key).and_then(Particle::as_str)
    }

    /// Junctions in key order.
    pub fn junctions(&self) -> impl Iterator<Item = (u64, &Particle)> {
        self.junctions.iter().map(|(k, p)| (*k, p))
    }

    pub fn junction_count(&self) -> usize {
        self.junctions.len()
    }

    /// Rebuilds a mutable copy, e.g. for a migration rewrite.
    pub fn to_builder(&self) -> AtomBuilder {
        AtomBuilder { id: self.id, junctions: self.junctions.clone() }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A:{}", self.id)
    }
}

/// One committed batch: a UCN and the atoms that became visible together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub ucn: Ucn,
    pub atoms: Vec<Arc<Atom>>,
}

impl Expansion {
    pub fn new(ucn: Ucn, atoms: Vec<Atom>) -> Expansion {
        Expansion { ucn, atoms: atoms.into_iter().map(Arc::new).collect() }
    }
}

/// Replay callback; returning false stops the replay.
pub trait ExpansionSink {
    fn visit_expansion(&mut self, info: &Expansion) -> bool;
}

impl<F: FnMut(&Expansion) -> bool> ExpansionSink for F {
    fn visit_expansion(&mut self, info: &Expansion) -> bool {
        self(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_keys_sorted_and_unique() {
        let mut b = AtomBuilder::new(10, 4);
        b.junction(30, Particle::long(3));
        b.junction(10, Particle::long(1));
        b.junction(20, Particle::long(2));
        b.junction(10, Particle::long(11));
        let atom = b.finish(5);
        let keys: Vec<u64> = atom.junctions().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(atom.get_long(10), Some(11));
        assert_eq!(atom.junction_count(), 3);
    }

    #[test]
    fn sealed_atom_accessors() {
        let mut b = AtomBuilder::new(999, 2);
        b.junction(1, Particle::empty());
        b.junction(2, Particle::long(2));
        b.junction(3, Particle::iso("3"));
        let atom = b.finish(7);
        assert_eq!(atom.id(), 999);
        assert_eq!(atom.ucn(), 7);
        assert_eq!(atom.get(1), Some(&Particle::empty()));
        assert_eq!(atom.get_long(2), Some(2));
        assert_eq!(atom.get_str(3), Some("3"));
        assert_eq!(atom.get(4), None);
        assert_eq!(atom.get_long(3), None);
    }

    #[test]
    fn atom_equality_covers_id_ucn_and_junctions() {
        let mut a = AtomBuilder::new(1, 1);
        a.junction(5, Particle::iso("x"));
        let mut b = AtomBuilder::new(1, 1);
        b.junction(5, Particle::iso("x"));
        assert_eq!(a.clone().finish(3), b.clone().finish(3));
        assert_ne!(a.clone().finish(3), b.clone().finish(4));
        let mut c = AtomBuilder::new(1, 1);
        c.junction(5, Particle::iso("y"));
        assert_ne!(a.finish(3), c.finish(3));
    }
}
