//! Universe: the append-only log abstraction over one physical data file.
//!
//! One Universe instance exclusively owns its data file. UCN assignment and
//! the physical append share a single critical section, so UCNs are totally
//! ordered and a failed append consumes no UCN. The whole expansion history
//! is mirrored in memory at open time; replays for readers are served from
//! a snapshot of that mirror and never hold the append lock.

use crate::atom::{Atom, AtomBuilder, AtomId, Expansion, ExpansionSink, Ucn};
use crate::consts::{DATA_FILE_NAME, START_UCN};
use crate::datafile::{AtomDataFile, FileUid};
use crate::errors::{Result, UniverseError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Ordered hand-off buffer between the append path and one index.
/// Commits push under the append lock; the consumer drains at its own pace.
pub struct ExpansionQueue {
    inner: Mutex<VecDeque<Arc<Expansion>>>,
}

impl ExpansionQueue {
    pub fn new() -> ExpansionQueue {
        ExpansionQueue { inner: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, info: Arc<Expansion>) {
        self.inner.lock().unwrap().push_back(info);
    }

    pub fn drain(&self) -> Vec<Arc<Expansion>> {
        self.inner.lock().unwrap().drain(..).collect()
    }
}

struct UniverseInner {
    file: AtomDataFile,
    /// The UCN the next commit will receive.
    next_ucn: Ucn,
    atoms: HashMap<AtomId, Arc<Atom>>,
    log: Vec<Arc<Expansion>>,
    observers: Vec<Arc<ExpansionQueue>>,
    read_only: bool,
    closed: bool,
}

pub struct Universe {
    path: PathBuf,
    inner: Mutex<UniverseInner>,
}

impl Universe {
    /// Opens (or initializes) the universe stored in the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Universe> {
        Universe::open_with_properties(dir, BTreeMap::new())
    }

    /// Like `open`; the properties are written only when the data file is
    /// being created and are ignored for an existing file.
    pub fn open_with_properties(
        dir: impl AsRef<Path>,
        properties_if_creating: BTreeMap<String, String>,
    ) -> Result<Universe> {
        let path = dir.as_ref().join(DATA_FILE_NAME);
        let mut file = if path.exists() {
            AtomDataFile::open(&path)?
        } else {
            AtomDataFile::create_with_properties(&path, properties_if_creating)?
        };

        let mut next_ucn = START_UCN;
        let mut atoms: HashMap<AtomId, Arc<Atom>> = HashMap::new();
        let mut log: Vec<Arc<Expansion>> = Vec::new();
        let mut bad: Option<UniverseError> = None;
        file.read_all(&mut |info: &Expansion| {
            if info.ucn < next_ucn {
                bad = Some(UniverseError::Corrupt(format!(
                    "not monotonous ucn [{} < {}]",
                    info.ucn, next_ucn
                )));
                return false;
            }
            for atom in &info.atoms {
                atoms.insert(atom.id(), atom.clone());
            }
            next_ucn = info.ucn + 1;
            log.push(Arc::new(info.clone()));
            true
        })?;
        if let Some(e) = bad {
            return Err(e);
        }
        debug!(
            path = %path.display(),
            expansions = log.len(),
            atoms = atoms.len(),
            next_ucn,
            "universe opened"
        );
        Ok(Universe {
            path,
            inner: Mutex::new(UniverseInner {
                file,
                next_ucn,
                atoms,
                log,
                observers: Vec::new(),
                read_only: false,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uid(&self) -> FileUid {
        self.inner.lock().unwrap().file.uid()
    }

    pub fn custom_properties(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().file.custom_properties().clone()
    }

    /// The UCN the next commit will receive. For any committed atom,
    /// `atom.ucn() < universe.ucn()` holds.
    pub fn ucn(&self) -> Ucn {
        self.inner.lock().unwrap().next_ucn
    }

    pub fn atom_count(&self) -> usize {
        self.inner.lock().unwrap().atoms.len()
    }

    pub fn atom(&self, id: AtomId) -> Option<Arc<Atom>> {
        self.inner.lock().unwrap().atoms.get(&id).cloned()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.lock().unwrap().read_only = read_only;
    }

    /// Commits one expansion: assigns the next UCN, seals the atoms, appends
    /// the record and hands the expansion to every registered observer, all
    /// inside one critical section. On failure nothing is changed and no UCN
    /// is consumed.
    pub fn append(&self, atoms: Vec<AtomBuilder>) -> Result<Ucn> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(UniverseError::Closed);
        }
        if inner.read_only {
            return Err(UniverseError::ReadOnly);
        }
        let ucn = inner.next_ucn;
        let sealed: Vec<Atom> = atoms.into_iter().map(|b| b.finish(ucn)).collect();
        let info = Expansion::new(ucn, sealed);
        inner.file.write_expansion(&info)?;

        let info = Arc::new(info);
        for atom in &info.atoms {
            inner.atoms.insert(atom.id(), atom.clone());
        }
        inner.log.push(info.clone());
        inner.next_ucn = ucn + 1;
        for observer in &inner.observers {
            observer.push(info.clone());
        }
        debug!(ucn, atoms = info.atoms.len(), "expansion committed");
        Ok(ucn)
    }

    /// Replays every expansion in append order.
    pub fn read_all<S: ExpansionSink>(&self, sink: &mut S) -> Result<()> {
        self.read_from(0, sink)
    }

    /// Replays every expansion with UCN >= `start` in append order. The
    /// snapshot is taken under the lock; delivery happens outside it, so a
    /// long replay never blocks writers.
    pub fn read_from<S: ExpansionSink>(&self, start: Ucn, sink: &mut S) -> Result<()> {
        let snapshot: Vec<Arc<Expansion>> = {
            let inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(UniverseError::Closed);
            }
            inner.log.iter().filter(|e| e.ucn >= start).cloned().collect()
        };
        for info in snapshot {
            if !sink.visit_expansion(&info) {
                break;
            }
        }
        Ok(())
    }

    /// Registers an observer queue that will receive every expansion
    /// committed from now on, in commit order. Returns the UCN the next
    /// commit will receive: expansions below it are already in the log,
    /// everything at or above it will arrive through the queue.
    pub fn register_observer(&self, queue: &Arc<ExpansionQueue>) -> Ucn {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.push(queue.clone());
        inner.next_ucn
    }

    pub fn unregister_observer(&self, queue: &Arc<ExpansionQueue>) {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.retain(|o| !Arc::ptr_eq(o, queue));
    }

    /// Closes the universe; any further append or replay fails fast.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use tempfile::tempdir;

    fn builder(id: AtomId, key: u64, value: Particle) -> AtomBuilder {
        let mut b = AtomBuilder::new(id, 1);
        b.junction(key, value);
        b
    }

    #[test]
    fn ucn_strictly_increases() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        let mut last = universe.ucn();
        for i in 0..10 {
            universe.append(vec![builder(i, 1, Particle::iso("y"))]).unwrap();
            let new = universe.ucn();
            assert!(new > last);
            last = new;
        }
    }

    #[test]
    fn append_returns_assigned_ucn() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        let before = universe.ucn();
        let ucn = universe.append(vec![builder(7, 1, Particle::long(1))]).unwrap();
        assert_eq!(ucn, before);
        assert_eq!(universe.ucn(), ucn + 1);
        assert_eq!(universe.atom(7).unwrap().ucn(), ucn);
    }

    #[test]
    fn read_all_delivers_in_append_order() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        let mut expected = Vec::new();
        for i in 0..5 {
            let ucn = universe.append(vec![builder(100 + i, 2, Particle::long(i as i64))]).unwrap();
            expected.push(ucn);
        }
        let mut seen = Vec::new();
        universe.read_all(&mut |info: &Expansion| {
            seen.push(info.ucn);
            true
        })
        .unwrap();
        assert_eq!(seen, expected);
    }

    #[test]
    fn atom_by_id() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        assert!(universe.atom(42).is_none());
        universe.append(vec![builder(42, 1, Particle::iso("x"))]).unwrap();
        let atom = universe.atom(42).unwrap();
        assert_eq!(atom.get_str(1), Some("x"));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let (uid, ucn) = {
            let universe = Universe::open(dir.path()).unwrap();
            universe.append(vec![builder(1, 1, Particle::iso("a"))]).unwrap();
            universe.append(vec![builder(2, 1, Particle::iso("b"))]).unwrap();
            (universe.uid(), universe.ucn())
        };
        let universe = Universe::open(dir.path()).unwrap();
        assert_eq!(universe.uid(), uid);
        assert_eq!(universe.ucn(), ucn);
        assert_eq!(universe.atom(1).unwrap().get_str(1), Some("a"));
        assert_eq!(universe.atom(2).unwrap().get_str(1), Some("b"));
        assert_eq!(universe.atom_count(), 2);
    }

    #[test]
    fn read_only_append_fails_fast() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        universe.set_read_only(true);
        let err = universe.append(vec![builder(1, 1, Particle::empty())]);
        assert!(matches!(err, Err(UniverseError::ReadOnly)));
        universe.set_read_only(false);
        universe.append(vec![builder(1, 1, Particle::empty())]).unwrap();
    }

    #[test]
    fn closed_universe_fails_fast() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        universe.close();
        assert!(matches!(
            universe.append(vec![builder(1, 1, Particle::empty())]),
            Err(UniverseError::Closed)
        ));
        assert!(matches!(
            universe.read_all(&mut |_: &Expansion| true),
            Err(UniverseError::Closed)
        ));
    }

    #[test]
    fn observers_receive_commits_in_order() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        universe.append(vec![builder(1, 1, Particle::long(1))]).unwrap();

        let queue = Arc::new(ExpansionQueue::new());
        let snapshot = universe.register_observer(&queue);
        assert_eq!(snapshot, universe.ucn());

        let a = universe.append(vec![builder(2, 1, Particle::long(2))]).unwrap();
        let b = universe.append(vec![builder(3, 1, Particle::long(3))]).unwrap();
        let drained = queue.drain();
        let ucns: Vec<Ucn> = drained.iter().map(|e| e.ucn).collect();
        assert_eq!(ucns, vec![a, b]);
        assert!(ucns.iter().all(|&u| u >= snapshot));

        universe.unregister_observer(&queue);
        universe.append(vec![builder(4, 1, Particle::long(4))]).unwrap();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn empty_append_still_consumes_a_ucn() {
        let dir = tempdir().unwrap();
        let universe = Universe::open(dir.path()).unwrap();
        let ucn = universe.append(Vec::new()).unwrap();
        assert_eq!(universe.ucn(), ucn + 1);
        let mut count = 0;
        universe.read_all(&mut |_: &Expansion| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 1);
    }
}
