// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CLI tool for creating and inspecting layered block files

use clap::{Parser, Subcommand};
use lsmt::{
    header::{read_block as read_header_block, HeaderTrailer},
    zfile, CommitArgs, CreateArgs, RandomAccessFile, RoFile, RwFile,
};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};
use uuid::Uuid;

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};

    ($msg:literal) => {{
        eprintln!($msg);
        std::process::exit(1);
    }};
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[derive(Parser)]
#[command(name = "lsmt", about = "Create, commit and inspect layered block files")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty writable layer (a data + index file pair)
    Create {
        /// Data file path
        data: PathBuf,
        /// Index file path
        index: PathBuf,
        /// Virtual device size in bytes
        #[arg(long)]
        size: u64,
        /// Parent layer UUID
        #[arg(long)]
        parent_uuid: Option<Uuid>,
        /// Free-form tag stored in the header (max 256 bytes)
        #[arg(long)]
        user_tag: Option<String>,
    },

    /// Commit a writable layer into a new sealed layer file
    Commit {
        /// Data file path
        data: PathBuf,
        /// Index file path
        index: PathBuf,
        /// Destination sealed layer
        output: PathBuf,
        /// Commit message stored in the new layer (max 256 bytes)
        #[arg(short = 'm', long)]
        user_tag: Option<String>,
        /// Parent UUID override
        #[arg(long)]
        parent_uuid: Option<Uuid>,
        /// Overwrite the destination if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Print header, trailer and index facts of a layer file
    Info {
        /// Layer file (data, index or compressed)
        file: PathBuf,
    },

    /// Compress a file into a block-compressed layer, or extract one
    Zfile {
        /// Source file
        src: PathBuf,
        /// Destination file
        dst: PathBuf,
        /// Extract instead of compress
        #[arg(short = 'x', long)]
        extract: bool,
        /// Logical block size in bytes
        #[arg(long, default_value_t = zfile::DEFAULT_BLOCK_SIZE)]
        block_size: u32,
        /// Skip per-block checksums
        #[arg(long)]
        no_verify: bool,
        /// Overwrite the destination if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Validate sealed layers and their parent chain (bottom-most first)
    Check {
        /// Layer files, bottom-most first
        files: Vec<PathBuf>,
    },
}

fn open_ro_file(path: &Path) -> Arc<File> {
    match File::open(path) {
        Ok(f) => Arc::new(f),
        Err(e) => die!("cannot open {}: {e}", path.display()),
    }
}

fn create_new_file(path: &Path) -> Arc<File> {
    let result = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path);
    match result {
        Ok(f) => Arc::new(f),
        Err(e) => die!("cannot create {}: {e}", path.display()),
    }
}

fn open_rw_pair(data: &Path, index: &Path) -> RwFile {
    let data = match OpenOptions::new().read(true).write(true).open(data) {
        Ok(f) => Arc::new(f),
        Err(e) => die!("cannot open data file: {e}"),
    };
    let index = match OpenOptions::new().read(true).write(true).open(index) {
        Ok(f) => Arc::new(f),
        Err(e) => die!("cannot open index file: {e}"),
    };
    match RwFile::open(data, index) {
        Ok(f) => f,
        Err(e) => die!("cannot open writable layer: {e}"),
    }
}

/// Writes `output` through a temp file in the same directory, so a failed
/// run leaves nothing behind.
fn with_scratch_output(
    output: &Path,
    force: bool,
    fill: impl FnOnce(&File) -> lsmt::Result<()>,
) {
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let scratch = match tempfile::NamedTempFile::new_in(dir) {
        Ok(s) => s,
        Err(e) => die!("cannot create scratch file: {e}"),
    };

    if let Err(e) = fill(scratch.as_file()) {
        die!("operation failed: {e}");
    }

    let persisted = if force {
        scratch.persist(output).map_err(|e| e.error)
    } else {
        scratch.persist_noclobber(output).map_err(|e| e.error)
    };
    if let Err(e) = persisted {
        die!("cannot persist {}: {e}", output.display());
    }
}

fn print_header(which: &str, ht: &HeaderTrailer) {
    println!("{which}:");
    println!(
        "  role:          {}",
        if ht.is_header() { "header" } else { "trailer" }
    );
    println!(
        "  file kind:     {}",
        if ht.is_data_file() { "data" } else { "index" }
    );
    println!("  sealed:        {}", ht.is_sealed());
    println!("  version:       {}.{}", ht.version, ht.sub_version);
    println!(
        "  uuid:          {}",
        ht.uuid().map_or_else(|| "(null)".into(), |u| u.to_string())
    );
    println!(
        "  parent uuid:   {}",
        ht.parent_uuid()
            .map_or_else(|| "(null)".into(), |u| u.to_string())
    );
    println!("  virtual size:  {}", ht.virtual_size);
    println!("  index offset:  {}", ht.index_offset);
    println!("  index size:    {}", ht.index_size);
    if !ht.user_tag().is_empty() {
        println!(
            "  user tag:      {}",
            String::from_utf8_lossy(ht.user_tag())
        );
    }
}

fn cmd_info(path: &Path) {
    let file = open_ro_file(path);

    match zfile::is_zfile(&*file) {
        Ok(true) => {
            let z = match zfile::ZFile::open_ro(file, false) {
                Ok(z) => z,
                Err(e) => die!("cannot open compressed layer: {e}"),
            };
            println!("compressed layer:");
            println!("  raw size:      {}", z.raw_size());
            println!("  block size:    {}", z.block_size());
            return;
        }
        Ok(false) => {}
        Err(e) => die!("cannot inspect {}: {e}", path.display()),
    }

    let header = match read_header_block(&*file, 0) {
        Ok(ht) => ht,
        Err(e) => die!("not a layer file: {e}"),
    };
    print_header("header", &header);

    if header.is_data_file() {
        let size = file.file_size().unwrap_or(0);
        if size >= 2 * HeaderTrailer::SPACE as u64 {
            if let Ok(trailer) = read_header_block(&*file, size - HeaderTrailer::SPACE as u64)
            {
                if trailer.is_trailer() {
                    print_header("trailer", &trailer);
                }
            }
        }
    }
}

fn cmd_check(paths: &[PathBuf]) {
    if paths.is_empty() {
        die!("no layer files given");
    }

    let files: Vec<Arc<dyn RandomAccessFile>> = paths
        .iter()
        .map(|p| open_ro_file(p) as Arc<dyn RandomAccessFile>)
        .collect();

    match RoFile::open_stack(files) {
        Ok(stack) => {
            println!(
                "ok: {} layers, virtual size {}, {} mappings",
                stack.layer_count(),
                stack.virtual_size(),
                stack.index().len(),
            );
        }
        Err(e) => die!("check failed: {e}"),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Command::Create {
            data,
            index,
            size,
            parent_uuid,
            user_tag,
        } => {
            let mut args = CreateArgs::new(size);
            if let Some(parent) = parent_uuid {
                args = args.with_parent_uuid(parent);
            }
            if let Some(tag) = user_tag {
                args = args.with_user_tag(tag.into_bytes());
            }

            let data_file = create_new_file(&data);
            let index_file = create_new_file(&index);
            match RwFile::create(data_file, index_file, &args) {
                Ok(_) => println!("created layer {}", args.uuid),
                Err(e) => die!("create failed: {e}"),
            }
        }

        Command::Commit {
            data,
            index,
            output,
            user_tag,
            parent_uuid,
            force,
        } => {
            let layer = open_rw_pair(&data, &index);

            let mut args = CommitArgs::default();
            if let Some(tag) = user_tag {
                args = args.with_user_tag(tag.into_bytes());
            }
            if let Some(parent) = parent_uuid {
                args = args.with_parent_uuid(parent);
            }

            with_scratch_output(&output, force, |dst| layer.commit(dst, &args));
            println!("committed into {}", output.display());
        }

        Command::Info { file } => cmd_info(&file),

        Command::Zfile {
            src,
            dst,
            extract,
            block_size,
            no_verify,
            force,
        } => {
            let src_file = open_ro_file(&src);

            if extract {
                with_scratch_output(&dst, force, |out| {
                    zfile::decompress(src_file.clone() as Arc<dyn RandomAccessFile>, out)
                });
                println!("extracted into {}", dst.display());
            } else {
                let opt = zfile::CompressOptions {
                    block_size,
                    verify: !no_verify,
                    ..Default::default()
                };
                with_scratch_output(&dst, force, |out| zfile::compress(&*src_file, out, &opt));
                println!("compressed into {}", dst.display());
            }
        }

        Command::Check { files } => cmd_check(&files),
    }
}
