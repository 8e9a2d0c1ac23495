//! vibelite - inspect and check vibelite database files

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vibelite::btree::{BTree, BTreeCursor, TreeKind};
use vibelite::record::decode_record;
use vibelite::{Database, DatabaseConfig, KeyInfo, PageNo, Pager, VfsRegistry};

/// vibelite - inspect and check vibelite database files
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Milliseconds to wait for a locked database
    #[arg(long, global = true, default_value = "5000")]
    busy_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the file header
    Info {
        db: PathBuf,
    },
    /// Check one tree for structural problems
    Check {
        db: PathBuf,
        /// Root page of the tree
        #[arg(short, long, default_value = "2")]
        root: PageNo,
        /// Tree kind; read from the root page when omitted
        #[arg(short, long, value_enum)]
        kind: Option<Kind>,
    },
    /// Print every entry of one tree
    Dump {
        db: PathBuf,
        #[arg(short, long, default_value = "2")]
        root: PageNo,
        #[arg(short, long, value_enum)]
        kind: Option<Kind>,
    },
    /// Open the file read-write, rolling back an interrupted transaction
    Recover {
        db: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Table,
    Index,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let busy_timeout = Duration::from_millis(args.busy_timeout);
    match args.command {
        Command::Info { db } => info(&open(&db, true, busy_timeout)?),
        Command::Check { db, root, kind } => check(&open(&db, true, busy_timeout)?, root, kind),
        Command::Dump { db, root, kind } => dump(&open(&db, true, busy_timeout)?, root, kind),
        Command::Recover { db } => recover(&db, busy_timeout),
    }
}

fn open(path: &Path, read_only: bool, busy_timeout: Duration) -> Result<Database> {
    if !path.exists() {
        bail!("Database file does not exist at {:?}", path);
    }
    let config = DatabaseConfig {
        read_only,
        create: false,
        busy_timeout: Some(busy_timeout),
        ..Default::default()
    };
    Database::open_with(&VfsRegistry::default(), Some(path), &config)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn info(db: &Database) -> Result<()> {
    let (header, free) = db
        .read(|pager| Ok((pager.header()?, pager.freelist_pages()?.len())))
        .context("Failed to read the header")?;
    println!("page size:        {}", header.page_size);
    println!("page count:       {}", header.page_count);
    println!("change counter:   {}", header.change_counter);
    println!("freelist pages:   {} (header says {})", free, header.freelist_count);
    println!("largest root:     {}", header.largest_root);
    println!("text encoding:    {:?}", header.text_encoding);
    println!("schema cookie:    {}", header.schema_cookie);
    println!("user version:     {}", header.user_version);
    println!("application id:   {}", header.application_id);
    Ok(())
}

fn open_tree(pager: &mut Pager, root: PageNo, kind: Option<Kind>) -> vibelite::Result<BTree> {
    let tree = BTree::open(pager, root)?;
    Ok(match kind {
        None => tree,
        Some(Kind::Table) => BTree::table(root),
        Some(Kind::Index) => BTree::index(root, KeyInfo::default()),
    })
}

fn check(db: &Database, root: PageNo, kind: Option<Kind>) -> Result<()> {
    let problems = db
        .read(|pager| open_tree(pager, root, kind)?.check_integrity(pager))
        .with_context(|| format!("Failed to check tree {root}"))?;
    if problems.is_empty() {
        println!("ok");
        return Ok(());
    }
    for problem in &problems {
        println!("{problem}");
    }
    bail!("{} problems found in tree {}", problems.len(), root)
}

fn dump(db: &Database, root: PageNo, kind: Option<Kind>) -> Result<()> {
    let lines = db
        .read(|pager| {
            let tree = open_tree(pager, root, kind)?;
            let mut cursor = tree.cursor();
            let lines = entries(pager, &tree, &mut cursor);
            cursor.close(pager);
            lines
        })
        .with_context(|| format!("Failed to dump tree {root}"))?;
    for line in &lines {
        println!("{line}");
    }
    println!("({} entries)", lines.len());
    Ok(())
}

fn entries(pager: &mut Pager, tree: &BTree, cursor: &mut BTreeCursor) -> vibelite::Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut more = cursor.first(pager)?;
    while more {
        let line = match tree.kind() {
            TreeKind::Table => {
                let rowid = cursor.rowid(pager)?;
                format!("{rowid}: {}", describe(&cursor.data(pager)?))
            }
            TreeKind::Index => describe(&cursor.key(pager)?),
        };
        lines.push(line);
        more = cursor.next(pager)?;
    }
    Ok(lines)
}

/// A record as a parenthesized value list, or a byte count when the
/// payload is not a record.
fn describe(payload: &[u8]) -> String {
    match decode_record(payload) {
        Ok(values) => {
            let fields: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            format!("({})", fields.join(", "))
        }
        Err(_) => format!("<{} bytes>", payload.len()),
    }
}

fn recover(path: &Path, busy_timeout: Duration) -> Result<()> {
    let db = open(path, false, busy_timeout)?;
    let pages = db.run(|pager| Ok(pager.page_count()))?;
    db.close().context("Failed to close the database")?;
    println!("✅ {} is consistent ({} pages)", path.display(), pages);
    Ok(())
}
