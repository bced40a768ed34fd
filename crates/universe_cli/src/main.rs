use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use universe_core::{
    atom::{Atom, AtomBuilder, Expansion},
    consts::DATA_FILE_NAME,
    datafile::AtomDataFile,
    migration::MigrationController,
    particle::Particle,
};

#[derive(Parser)]
#[command(name = "universe", about = "Universe-DB CLI — offline data file ops")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print file identity, version and contents summary
    Info {
        #[arg(long)]
        dir: PathBuf,
    },

    /// Print every expansion with its atoms and junctions
    Dump {
        #[arg(long)]
        dir: PathBuf,
        /// Stop after this many expansions
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Replay the whole file, checking framing and CRCs
    Verify {
        #[arg(long)]
        dir: PathBuf,
    },

    /// Upgrade string marshalling: rewrite every iso-string particle as
    /// utf-8. Backs up the database directory first.
    Migrate {
        #[arg(long)]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Info { dir } => info_cmd(dir),
        Cmd::Dump { dir, limit } => dump_cmd(dir, limit),
        Cmd::Verify { dir } => verify_cmd(dir),
        Cmd::Migrate { dir } => migrate_cmd(dir),
    }
}

fn open_data_file(dir: &Path) -> Result<AtomDataFile> {
    let path = dir.join(DATA_FILE_NAME);
    AtomDataFile::open_read_only(&path)
        .with_context(|| format!("cannot open {}", path.display()))
}

fn info_cmd(dir: PathBuf) -> Result<()> {
    let mut file = open_data_file(&dir)?;
    println!("uid      : {}", file.uid());
    println!("version  : {}", file.version());
    for (key, value) in file.custom_properties() {
        println!("property : {key} = {value}");
    }
    let mut expansions = 0usize;
    let mut atoms = 0usize;
    let mut last_ucn = 0u64;
    file.read_all(&mut |info: &Expansion| {
        expansions += 1;
        atoms += info.atoms.len();
        last_ucn = info.ucn;
        true
    })?;
    println!("expansions: {expansions}");
    println!("atoms     : {atoms}");
    println!("last ucn  : {last_ucn}");
    Ok(())
}

fn dump_cmd(dir: PathBuf, limit: Option<usize>) -> Result<()> {
    let mut file = open_data_file(&dir)?;
    let limit = limit.unwrap_or(usize::MAX);
    let mut seen = 0usize;
    file.read_all(&mut |info: &Expansion| {
        println!("expansion ucn={}", info.ucn);
        for atom in &info.atoms {
            println!("  atom {}", atom.id());
            for (key, particle) in atom.junctions() {
                println!("    {key} = {particle}");
            }
        }
        seen += 1;
        seen < limit
    })?;
    Ok(())
}

fn verify_cmd(dir: PathBuf) -> Result<()> {
    let mut file = open_data_file(&dir)?;
    let mut expansions = 0usize;
    let result = file.read_all(&mut |_: &Expansion| {
        expansions += 1;
        true
    });
    match result {
        Ok(()) => {
            println!("ok: {expansions} expansions verified");
            Ok(())
        }
        Err(e) => {
            bail!("verification failed after {expansions} expansions: {e}");
        }
    }
}

fn migrate_cmd(dir: PathBuf) -> Result<()> {
    let mut controller = MigrationController::new();
    controller.start_migration(&dir)?;
    info!(backup = %controller.backup_dir().map(|p| p.display().to_string()).unwrap_or_default(),
        "backup complete");
    controller.make_pass(|info, output| {
        let atoms: Vec<Atom> = info
            .atoms
            .iter()
            .map(|atom| {
                let mut builder = AtomBuilder::new(atom.id(), atom.junction_count());
                for (key, particle) in atom.junctions() {
                    let rewritten = match particle {
                        Particle::IsoString(s) => Particle::utf8(s.clone()),
                        other => other.clone(),
                    };
                    builder.junction(key, rewritten);
                }
                builder.finish(info.ucn)
            })
            .collect();
        output.save_expansion(&Expansion::new(info.ucn, atoms))?;
        Ok(true)
    })?;
    controller.end_migration()?;
    println!(
        "migrated {} in {} pass(es); backup at {}",
        dir.join(DATA_FILE_NAME).display(),
        controller.pass_count(),
        controller
            .backup_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );
    Ok(())
}
