use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use git_odb::ObjectDatabase;
use git_pack::index_pack::{self, IndexOptions, IndexPackOutcome, ProgressSink};
use git_utils::progress::Progress;

use crate::Cli;

#[derive(Args)]
pub struct IndexPackArgs {
    /// Be verbose about what is happening
    #[arg(short, long)]
    verbose: bool,

    /// Write the generated index into the specified file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Don't discard the pack after indexing; write a .keep file, optionally
    /// recording a message in it
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    keep: Option<String>,

    /// Die if the pack contains broken objects
    #[arg(long)]
    strict: bool,

    /// Run the structural object checker over each indexed object
    #[arg(long)]
    fsck_objects: bool,

    /// Read the pack from stdin rather than from a file
    #[arg(long)]
    stdin: bool,

    /// Complete a thin pack by fetching missing bases from the object store
    #[arg(long)]
    fix_thin: bool,

    /// Index format version to write (<= 0 picks the narrowest that fits)
    #[arg(long, default_value_t = 0)]
    index_version: i32,

    /// Pack file to index; omit with --stdin
    pack_file: Option<PathBuf>,
}

/// Adapts the crate's [`ProgressSink`] to `git-utils`'s stderr meter, matching
/// how the rest of `git-cli` reports progress.
struct CliProgress {
    verbose: bool,
    count: u64,
    current: Option<Progress>,
}

impl ProgressSink for CliProgress {
    fn begin_task(&mut self, label: &str, total: Option<u64>) {
        self.count = 0;
        if self.verbose {
            self.current = Some(Progress::new(label, total));
        }
    }

    fn update(&mut self, n: u64) {
        self.count += n;
        if let Some(p) = &mut self.current {
            p.update(self.count);
        }
    }

    fn end_task(&mut self) {
        if let Some(p) = self.current.take() {
            p.finish();
        }
    }
}

/// Locate the repository's object directory, honoring `--git-dir` and the
/// `GIT_DIR` environment variable, falling back to `./.git/objects`.
fn discover_objects_dir(cli: &Cli) -> Option<PathBuf> {
    let git_dir = cli
        .git_dir
        .clone()
        .or_else(|| std::env::var_os("GIT_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".git"));
    let objects = git_dir.join("objects");
    objects.is_dir().then_some(objects)
}

pub fn run(args: &IndexPackArgs, cli: &Cli) -> Result<i32> {
    let stderr = io::stderr();
    let mut err = stderr.lock();

    let input: Box<dyn Read> = if args.stdin {
        Box::new(io::stdin())
    } else if let Some(path) = &args.pack_file {
        Box::new(File::open(path).with_context(|| format!("unable to open {}", path.display()))?)
    } else {
        bail!("need a pack file argument or --stdin");
    };

    let (work_dir, dest_dir) = if args.stdin {
        let objects_dir = discover_objects_dir(cli)
            .context("--stdin requires a repository (no .git/objects found)")?;
        let pack_dir = objects_dir.join("pack");
        (pack_dir.clone(), pack_dir)
    } else {
        let dest = args
            .pack_file
            .as_ref()
            .and_then(|p| p.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        (dest.clone(), dest)
    };

    let odb = discover_objects_dir(cli).and_then(|d| ObjectDatabase::open(&d).ok());
    let store: Option<&dyn index_pack::ObjectSource> =
        odb.as_ref().map(|o| o as &dyn index_pack::ObjectSource);

    if args.fix_thin && store.is_none() {
        bail!("--fix-thin requires a repository to fetch missing bases from");
    }

    let opts = IndexOptions {
        fix_thin: args.fix_thin,
        keep_empty: args.keep.is_some(),
        index_version: args.index_version,
        object_check: args.fsck_objects || args.strict,
        lock_message: None,
    };

    let mut progress = CliProgress {
        verbose: args.verbose,
        count: 0,
        current: None,
    };

    let outcome = index_pack::run(input, &work_dir, &dest_dir, &opts, store, &mut progress)
        .context("fatal: index-pack failed")?;

    match outcome {
        IndexPackOutcome::Published {
            pack_path,
            index_path,
            pack_checksum,
            ..
        } => {
            if let Some(msg) = &args.keep {
                let mut keep_path = pack_path.clone();
                keep_path.set_extension("keep");
                std::fs::write(&keep_path, msg)?;
            }
            if let Some(output) = &args.output {
                std::fs::copy(&index_path, output)?;
            }
            if args.verbose {
                writeln!(err, "pack\t{}", pack_checksum.to_hex())?;
                writeln!(err, "index\t{}", index_path.display())?;
            }
            println!("{}", pack_checksum.to_hex());
            Ok(0)
        }
        IndexPackOutcome::AlreadyExists { pack_path, .. } => {
            if args.verbose {
                writeln!(err, "{} already exists", pack_path.display())?;
            }
            Ok(0)
        }
        IndexPackOutcome::EmptyDiscarded => {
            if args.verbose {
                writeln!(err, "pack has no objects, discarding")?;
            }
            Ok(0)
        }
    }
}
