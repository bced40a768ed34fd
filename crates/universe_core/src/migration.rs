//! Offline multi-pass migration of a universe data file.
//!
//! A migration backs up the whole database directory, then chains one or
//! more passes. Each pass replays the current source log through a caller
//! sink that writes transformed expansions into a fresh result log named
//! `<source>.<passNumber>`; the result becomes the next pass's source.
//! `end_migration` promotes the final result over the original data file
//! name and deletes every intermediate. The source of a pass is opened
//! read-only, so a failed pass leaves nothing but a discarded result file.
//!
//! The controller never touches a universe that is serving live traffic;
//! migration runs before the application opens its universe.

use crate::atom::Expansion;
use crate::consts::{BACKUP_DIR_NAME, DATA_FILE_NAME};
use crate::datafile::AtomDataFile;
use crate::errors::{Result, UniverseError};
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Write side of a running pass, handed to the pass sink. Only exists while
/// the pass runs, so expansions cannot be saved outside one.
pub struct PassOutput<'a> {
    file: &'a mut AtomDataFile,
}

impl PassOutput<'_> {
    pub fn save_expansion(&mut self, info: &Expansion) -> Result<()> {
        self.file.write_expansion(info)
    }
}

pub struct MigrationController {
    started: bool,
    data_file_name: PathBuf,
    pass_source_name: PathBuf,
    pass_count: u32,
    temp_files: Vec<PathBuf>,
    backup_dir: Option<PathBuf>,
}

impl MigrationController {
    pub fn new() -> MigrationController {
        MigrationController {
            started: false,
            data_file_name: PathBuf::new(),
            pass_source_name: PathBuf::new(),
            pass_count: 0,
            temp_files: Vec::new(),
            backup_dir: None,
        }
    }

    /// Backs up the database directory, then arms the controller. Backup
    /// failure aborts before any source file is touched.
    pub fn start_migration(&mut self, db_dir: impl AsRef<Path>) -> Result<()> {
        if self.started {
            return Err(UniverseError::MigrationState("already started"));
        }
        let db_dir = db_dir.as_ref().to_path_buf();
        let backup_dir = backup(&db_dir)?;
        debug!(backup = %backup_dir.display(), "migration backup complete");
        self.backup_dir = Some(backup_dir);
        self.data_file_name = db_dir.join(DATA_FILE_NAME);
        self.pass_source_name = self.data_file_name.clone();
        self.pass_count = 0;
        self.temp_files.clear();
        self.started = true;
        Ok(())
    }

    /// Runs one pass: replays the current source through `sink`, which
    /// writes transformed expansions via the supplied `PassOutput`.
    /// Returning `Ok(false)` stops the replay early; an error aborts the
    /// pass, leaving the read-only source untouched.
    pub fn make_pass<F>(&mut self, mut sink: F) -> Result<()>
    where
        F: FnMut(&Expansion, &mut PassOutput<'_>) -> Result<bool>,
    {
        if !self.started {
            return Err(UniverseError::MigrationState("migration has not been started"));
        }
        self.pass_count += 1;
        let result_name = pass_result_file_name(&self.pass_source_name, self.pass_count);
        if result_name.exists() {
            // leftover of an earlier failed attempt
            fs::remove_file(&result_name)?;
        }

        let mut source = AtomDataFile::open_read_only(&self.pass_source_name).map_err(|e| {
            UniverseError::Migration(format!(
                "cannot open source file {}: {e}",
                self.pass_source_name.display()
            ))
        })?;
        let mut result_file = AtomDataFile::create(&result_name).map_err(|e| {
            UniverseError::Migration(format!(
                "cannot create pass file {}: {e}",
                result_name.display()
            ))
        })?;
        self.temp_files.push(result_name.clone());

        let mut sink_error: Option<UniverseError> = None;
        let replay = source.read_all(&mut |info: &Expansion| {
            let mut output = PassOutput { file: &mut result_file };
            match sink(info, &mut output) {
                Ok(proceed) => proceed,
                Err(e) => {
                    sink_error = Some(e);
                    false
                }
            }
        });
        if let Some(e) = sink_error {
            return Err(e);
        }
        replay.map_err(|e| {
            UniverseError::Migration(format!(
                "cannot read source file {}: {e}",
                self.pass_source_name.display()
            ))
        })?;

        debug!(pass = self.pass_count, result = %result_name.display(), "migration pass complete");
        self.pass_source_name = result_name;
        Ok(())
    }

    /// Promotes the final pass result over the data file name and deletes
    /// all intermediates. With zero passes taken this is a no-op. The backup
    /// is never deleted.
    pub fn end_migration(&mut self) -> Result<()> {
        if !self.started {
            return Err(UniverseError::MigrationState("migration is not started"));
        }
        self.started = false;
        if self.pass_source_name == self.data_file_name {
            // no pass was taken
            return Ok(());
        }
        fs::copy(&self.pass_source_name, &self.data_file_name).map_err(|e| {
            UniverseError::Migration(format!("cannot write to database file: {e}"))
        })?;
        for file in self.temp_files.drain(..) {
            if let Err(e) = fs::remove_file(&file) {
                warn!(file = %file.display(), error = %e, "cannot delete pass file");
            }
        }
        Ok(())
    }

    /// Where this migration's backup was written, once started.
    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    pub fn pass_count(&self) -> u32 {
        self.pass_count
    }
}

impl Default for MigrationController {
    fn default() -> Self {
        MigrationController::new()
    }
}

fn pass_result_file_name(source: &Path, pass_count: u32) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DATA_FILE_NAME.to_string());
    source.with_file_name(format!("{name}.{pass_count}"))
}

/// Copies every regular file of the database directory into a fresh
/// timestamped directory under `<db_dir>/backup/`.
fn backup(db_dir: &Path) -> Result<PathBuf> {
    let stamp_format =
        format_description!("[year repr:last_two][month][day]-[hour][minute][second]-[subsecond digits:3]");
    let stamp = OffsetDateTime::now_utc()
        .format(&stamp_format)
        .map_err(|e| UniverseError::Migration(format!("cannot format backup timestamp: {e}")))?;
    let backup_dir = db_dir.join(BACKUP_DIR_NAME).join(stamp);
    fs::create_dir_all(&backup_dir)
        .map_err(|e| UniverseError::Migration(format!("cannot create backup dir: {e}")))?;
    if !db_dir.is_dir() {
        return Ok(backup_dir);
    }
    let entries = fs::read_dir(db_dir)
        .map_err(|e| UniverseError::Migration(format!("backup failed: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| UniverseError::Migration(format!("backup failed: {e}")))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let target = backup_dir.join(entry.file_name());
        fs::copy(&path, &target)
            .map_err(|e| UniverseError::Migration(format!("backup failed: {e}")))?;
    }
    Ok(backup_dir)
}
