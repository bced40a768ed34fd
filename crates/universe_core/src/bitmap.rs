//! Bitmap indexing over one universe.
//!
//! One inverted index per (filter, junction-key) pair: particle value ->
//! set of atom ids currently carrying that value under the filter. Indexes
//! are built lazily on first request and then rolled forward from commit
//! notifications.
//!
//! The build closes the registration gap: the observer queue is registered
//! with the universe BEFORE the scan starts, the scan covers only
//! expansions below the registration snapshot, and everything the queue
//! buffered during the scan is replayed afterwards. A commit can therefore
//! never fall between "scan done" and "notifications on" — it is either in
//! the scanned prefix or in the queue, and the per-index UCN high-water
//! mark keeps each expansion from being applied twice.

use crate::atom::{Atom, AtomId, Expansion, Ucn};
use crate::errors::Result;
use crate::particle::Particle;
use crate::universe::{ExpansionQueue, Universe};
use roaring::RoaringTreemap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Predicate restricting which atoms an index covers.
pub trait AtomFilter: Send + Sync {
    /// Stable identity of this filter; indexes are pooled by it.
    fn persistable_key(&self) -> String;

    fn accepts(&self, atom: &Atom) -> bool;
}

/// The trivial filter: every atom is indexed.
pub struct AllAtoms;

impl AtomFilter for AllAtoms {
    fn persistable_key(&self) -> String {
        "ALL".to_string()
    }

    fn accepts(&self, _atom: &Atom) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    filter: String,
    junction_key: u64,
}

struct IndexState {
    buckets: HashMap<Particle, RoaringTreemap>,
    /// Reverse map: which value each atom id is currently indexed under.
    current: HashMap<AtomId, Particle>,
    /// Expansions with UCN below this are reflected in the buckets.
    next_ucn: Ucn,
}

impl IndexState {
    fn new() -> IndexState {
        IndexState { buckets: HashMap::new(), current: HashMap::new(), next_ucn: 0 }
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.current.clear();
        self.next_ucn = 0;
    }
}

/// One live inverted index. Obtained from `BitmapIndexManager`; queries
/// catch up with buffered commits before answering, so results are never
/// stale.
pub struct BitmapIndex {
    junction_key: u64,
    filter: Arc<dyn AtomFilter>,
    universe: Arc<Universe>,
    queue: Arc<ExpansionQueue>,
    state: Mutex<IndexState>,
}

impl BitmapIndex {
    pub fn junction_key(&self) -> u64 {
        self.junction_key
    }

    /// Atom ids currently carrying `value`, ascending.
    pub fn find(&self, value: &Particle) -> Result<Vec<AtomId>> {
        let state = self.catch_up()?;
        Ok(state
            .buckets
            .get(value)
            .map(|set| set.iter().collect())
            .unwrap_or_default())
    }

    pub fn count(&self, value: &Particle) -> Result<u64> {
        let state = self.catch_up()?;
        Ok(state.buckets.get(value).map(|set| set.len()).unwrap_or(0))
    }

    /// Distinct values currently present in the index.
    pub fn values(&self) -> Result<Vec<Particle>> {
        let state = self.catch_up()?;
        Ok(state.buckets.keys().cloned().collect())
    }

    /// Drops all index data and rebuilds it from the universe. Losing an
    /// index only ever costs a rebuild, never correctness.
    pub fn rebuild(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        warn!(junction_key = self.junction_key, "rebuilding bitmap index");
        self.queue.drain();
        state.clear();
        self.scan_into(&mut state)?;
        Ok(())
    }

    /// Applies buffered commit notifications; called before every query.
    fn catch_up(&self) -> Result<MutexGuard<'_, IndexState>> {
        let mut state = self.state.lock().unwrap();
        for info in self.queue.drain() {
            if info.ucn < state.next_ucn {
                // already covered by the build scan
                continue;
            }
            Self::apply(&mut state, self.junction_key, self.filter.as_ref(), &info);
        }
        Ok(state)
    }

    /// Full replay of the universe below its current UCN into `state`.
    /// Commits racing with the scan land in the queue and are applied by the
    /// next `catch_up`.
    fn scan_into(&self, state: &mut IndexState) -> Result<()> {
        let snapshot = self.universe.ucn();
        let junction_key = self.junction_key;
        let filter = self.filter.clone();
        let mut scanned = 0usize;
        {
            let sink = &mut |info: &Expansion| {
                if info.ucn >= snapshot {
                    return false;
                }
                Self::apply(state, junction_key, filter.as_ref(), info);
                scanned += 1;
                true
            };
            self.universe.read_all(sink)?;
        }
        if state.next_ucn < snapshot {
            state.next_ucn = snapshot;
        }
        debug!(junction_key, expansions = scanned, "bitmap index scan complete");
        Ok(())
    }

    /// Updates the buckets for exactly the atoms whose indexed junction
    /// changed in this expansion.
    fn apply(state: &mut IndexState, junction_key: u64, filter: &dyn AtomFilter, info: &Expansion) {
        for atom in &info.atoms {
            let id = atom.id();
            let new_value = if filter.accepts(atom) {
                atom.get(junction_key).cloned()
            } else {
                None
            };
            if state.current.get(&id) == new_value.as_ref() {
                continue;
            }
            if let Some(old) = state.current.remove(&id) {
                if let Some(set) = state.buckets.get_mut(&old) {
                    set.remove(id);
                    if set.is_empty() {
                        state.buckets.remove(&old);
                    }
                }
            }
            if let Some(value) = new_value {
                state
                    .buckets
                    .entry(value.clone())
                    .or_insert_with(RoaringTreemap::new)
                    .insert(id);
                state.current.insert(id, value);
            }
        }
        state.next_ucn = info.ucn + 1;
    }
}

impl Drop for BitmapIndex {
    fn drop(&mut self) {
        self.universe.unregister_observer(&self.queue);
    }
}

/// Pool of bitmap indexes over one universe, keyed by (filter, junction
/// key). The first query for a pair builds the index synchronously; callers
/// block until it is live.
pub struct BitmapIndexManager {
    universe: Arc<Universe>,
    indexes: Mutex<HashMap<IndexKey, Arc<BitmapIndex>>>,
    build_lock: Mutex<()>,
}

impl BitmapIndexManager {
    pub fn new(universe: Arc<Universe>) -> BitmapIndexManager {
        BitmapIndexManager {
            universe,
            indexes: Mutex::new(HashMap::new()),
            build_lock: Mutex::new(()),
        }
    }

    pub fn bitmap_index(
        &self,
        filter: Arc<dyn AtomFilter>,
        junction_key: u64,
    ) -> Result<Arc<BitmapIndex>> {
        let key = IndexKey { filter: filter.persistable_key(), junction_key };
        if let Some(index) = self.indexes.lock().unwrap().get(&key) {
            return Ok(index.clone());
        }
        let _build = self.build_lock.lock().unwrap();
        if let Some(index) = self.indexes.lock().unwrap().get(&key) {
            return Ok(index.clone());
        }
        // register before scanning: commits racing with the scan buffer in
        // the queue and are replayed once the scan completes
        let queue = Arc::new(ExpansionQueue::new());
        let snapshot = self.universe.register_observer(&queue);
        let index = self.build_registered(filter, junction_key, queue, snapshot)?;
        self.indexes.lock().unwrap().insert(key, index.clone());
        Ok(index)
    }

    pub fn rebuild_index(&self, index: &BitmapIndex) -> Result<()> {
        index.rebuild()
    }

    fn build_registered(
        &self,
        filter: Arc<dyn AtomFilter>,
        junction_key: u64,
        queue: Arc<ExpansionQueue>,
        snapshot: Ucn,
    ) -> Result<Arc<BitmapIndex>> {
        let index = Arc::new(BitmapIndex {
            junction_key,
            filter,
            universe: self.universe.clone(),
            queue,
            state: Mutex::new(IndexState::new()),
        });
        {
            let mut state = index.state.lock().unwrap();
            let junction_key = index.junction_key;
            let filter = index.filter.clone();
            index.universe.read_all(&mut |info: &Expansion| {
                if info.ucn >= snapshot {
                    // arrives through the queue instead
                    return false;
                }
                BitmapIndex::apply(&mut state, junction_key, filter.as_ref(), info);
                true
            })?;
            if state.next_ucn < snapshot {
                state.next_ucn = snapshot;
            }
        }
        // replay whatever the queue buffered while the scan ran
        index.catch_up()?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomBuilder;
    use std::thread;
    use tempfile::tempdir;

    fn commit(universe: &Universe, id: AtomId, key: u64, value: Particle) -> Ucn {
        let mut b = AtomBuilder::new(id, 1);
        b.junction(key, value);
        universe.append(vec![b]).unwrap()
    }

    #[test]
    fn build_and_find() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        commit(&universe, 1, 100, Particle::iso("open"));
        commit(&universe, 2, 100, Particle::iso("closed"));
        commit(&universe, 3, 100, Particle::iso("open"));
        commit(&universe, 4, 200, Particle::iso("open")); // different junction

        let manager = BitmapIndexManager::new(universe.clone());
        let index = manager.bitmap_index(Arc::new(AllAtoms), 100).unwrap();
        assert_eq!(index.find(&Particle::iso("open")).unwrap(), vec![1, 3]);
        assert_eq!(index.find(&Particle::iso("closed")).unwrap(), vec![2]);
        assert_eq!(index.find(&Particle::iso("missing")).unwrap(), Vec::<AtomId>::new());
        assert_eq!(index.count(&Particle::iso("open")).unwrap(), 2);
    }

    #[test]
    fn index_pool_returns_same_instance() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        let manager = BitmapIndexManager::new(universe);
        let a = manager.bitmap_index(Arc::new(AllAtoms), 5).unwrap();
        let b = manager.bitmap_index(Arc::new(AllAtoms), 5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn roll_forward_moves_ids_between_buckets() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        commit(&universe, 1, 100, Particle::iso("open"));

        let manager = BitmapIndexManager::new(universe.clone());
        let index = manager.bitmap_index(Arc::new(AllAtoms), 100).unwrap();
        assert_eq!(index.find(&Particle::iso("open")).unwrap(), vec![1]);

        // a later state of the same atom id changes the indexed value
        commit(&universe, 1, 100, Particle::iso("closed"));
        assert_eq!(index.find(&Particle::iso("open")).unwrap(), Vec::<AtomId>::new());
        assert_eq!(index.find(&Particle::iso("closed")).unwrap(), vec![1]);
    }

    #[test]
    fn atom_without_junction_leaves_the_index() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        commit(&universe, 1, 100, Particle::long(5));
        let manager = BitmapIndexManager::new(universe.clone());
        let index = manager.bitmap_index(Arc::new(AllAtoms), 100).unwrap();
        assert_eq!(index.find(&Particle::long(5)).unwrap(), vec![1]);

        let b = AtomBuilder::new(1, 0); // rewrite without the junction
        universe.append(vec![b]).unwrap();
        assert_eq!(index.find(&Particle::long(5)).unwrap(), Vec::<AtomId>::new());
    }

    #[test]
    fn filter_restricts_the_index() {
        struct OnlyEven;
        impl AtomFilter for OnlyEven {
            fn persistable_key(&self) -> String {
                "EVEN".to_string()
            }
            fn accepts(&self, atom: &Atom) -> bool {
                atom.id() % 2 == 0
            }
        }

        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        for id in 1..=6 {
            commit(&universe, id, 100, Particle::iso("x"));
        }
        let manager = BitmapIndexManager::new(universe.clone());
        let index = manager.bitmap_index(Arc::new(OnlyEven), 100).unwrap();
        assert_eq!(index.find(&Particle::iso("x")).unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn commit_in_registration_gap_is_reflected_exactly_once() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        commit(&universe, 1, 100, Particle::iso("a"));
        commit(&universe, 2, 100, Particle::iso("b"));

        let manager = BitmapIndexManager::new(universe.clone());
        // stage the hazard by hand: the queue is registered, then a commit
        // lands before the scan starts
        let queue = Arc::new(ExpansionQueue::new());
        let snapshot = universe.register_observer(&queue);
        commit(&universe, 3, 100, Particle::iso("a"));

        let index = manager
            .build_registered(Arc::new(AllAtoms), 100, queue, snapshot)
            .unwrap();
        assert_eq!(index.find(&Particle::iso("a")).unwrap(), vec![1, 3]);
        assert_eq!(index.find(&Particle::iso("b")).unwrap(), vec![2]);
        // the queue was drained; nothing is applied twice on the next query
        assert_eq!(index.find(&Particle::iso("a")).unwrap(), vec![1, 3]);
    }

    #[test]
    fn concurrent_writer_during_build_loses_nothing() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        for id in 0..20 {
            commit(&universe, id, 100, Particle::long((id % 5) as i64));
        }

        let writer = {
            let universe = universe.clone();
            thread::spawn(move || {
                for id in 20..60 {
                    commit(&universe, id, 100, Particle::long((id % 5) as i64));
                }
            })
        };

        let manager = BitmapIndexManager::new(universe.clone());
        let index = manager.bitmap_index(Arc::new(AllAtoms), 100).unwrap();
        writer.join().unwrap();

        for k in 0..5i64 {
            let expected: Vec<AtomId> = (0..60).filter(|id| (id % 5) as i64 == k).collect();
            assert_eq!(index.find(&Particle::long(k)).unwrap(), expected);
        }
    }

    #[test]
    fn rebuild_restores_a_dropped_index() {
        let dir = tempdir().unwrap();
        let universe = Arc::new(Universe::open(dir.path()).unwrap());
        commit(&universe, 1, 100, Particle::iso("v"));
        commit(&universe, 2, 100, Particle::iso("v"));

        let manager = BitmapIndexManager::new(universe.clone());
        let index = manager.bitmap_index(Arc::new(AllAtoms), 100).unwrap();
        assert_eq!(index.find(&Particle::iso("v")).unwrap(), vec![1, 2]);

        index.state.lock().unwrap().clear(); // simulate a lost index
        manager.rebuild_index(&index).unwrap();
        assert_eq!(index.find(&Particle::iso("v")).unwrap(), vec![1, 2]);

        // and it keeps rolling forward after the rebuild
        commit(&universe, 3, 100, Particle::iso("v"));
        assert_eq!(index.find(&Particle::iso("v")).unwrap(), vec![1, 2, 3]);
    }
}
