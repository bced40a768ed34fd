pub mod consts;
pub mod errors;
pub mod utils;
pub mod particle;
pub mod atom;
pub mod datafile;
pub mod universe;
pub mod bitmap;
pub mod migration;

pub use atom::{Atom, AtomBuilder, AtomId, Expansion, ExpansionSink, Ucn};
pub use bitmap::{AllAtoms, AtomFilter, BitmapIndex, BitmapIndexManager};
pub use datafile::{AtomDataFile, FileUid};
pub use errors::{Result, UniverseError};
pub use migration::{MigrationController, PassOutput};
pub use particle::Particle;
pub use universe::Universe;
