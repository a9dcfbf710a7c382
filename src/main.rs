//! repack CLI - fold bundle changes back into an OCI image

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use repack::ops::{self, parse_image_arg, snapshot_bundle, HistoryOverrides, RepackOptions};
use repack::{CancelToken, Config, DirEngine, Engine, Error, KeywordSet, LayerCompression};

#[derive(Parser)]
#[command(name = "repack")]
#[command(about = "fold filesystem changes from an unpacked bundle back into an OCI image")]
#[command(version)]
struct Cli {
    /// increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML file with history and layer defaults
    #[arg(long, env = "REPACK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// create a new image layer from a modified bundle
    Repack {
        /// image store and tag to update, as path[:tag]
        #[arg(long)]
        image: String,

        /// bundle directory
        bundle: PathBuf,

        /// author of the new history entry
        #[arg(long = "history.author")]
        history_author: Option<String>,

        /// comment of the new history entry
        #[arg(long = "history.comment")]
        history_comment: Option<String>,

        /// creation time of the new history entry (RFC 3339)
        #[arg(long = "history.created")]
        history_created: Option<String>,

        /// created_by of the new history entry
        #[arg(long = "history.created_by")]
        history_created_by: Option<String>,

        /// layer compression: gzip, none
        #[arg(long)]
        compression: Option<LayerCompression>,
    },

    /// record the baseline snapshot of a bundle
    Snapshot {
        /// bundle directory
        bundle: PathBuf,
    },

    /// create an empty image store
    Init {
        /// path to create the store at
        path: PathBuf,
    },

    /// show the descriptor a tag points at
    ShowRef {
        /// image store and tag, as path[:tag]
        #[arg(long)]
        image: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("repack={}", level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> repack::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Repack {
            image,
            bundle,
            history_author,
            history_comment,
            history_created,
            history_created_by,
            compression,
        } => {
            let (image, tag) = parse_image_arg(&image)?;

            let mut opts = RepackOptions::new(image, tag, bundle);
            opts.history = HistoryOverrides {
                author: history_author,
                comment: history_comment,
                created: history_created,
                created_by: history_created_by,
            };
            let mut opts = opts.with_config(&config);
            if let Some(compression) = compression {
                opts.compression = compression;
            }

            let outcome = ops::repack(&opts, &CancelToken::new())?;
            println!("{}", outcome.manifest.digest);
        }

        Commands::Snapshot { bundle } => {
            let path = snapshot_bundle(&bundle, &KeywordSet::all(), &CancelToken::new())?;
            println!("{}", path.display());
        }

        Commands::Init { path } => {
            DirEngine::create(&path)?.close();
            println!("initialized image store at {}", path.display());
        }

        Commands::ShowRef { image } => {
            let (image, tag) = parse_image_arg(&image)?;
            let engine = DirEngine::open(&image)?;
            let descriptor = engine
                .get_reference(&tag)?
                .ok_or_else(|| Error::InvalidRef(format!("tag not found: {}", tag)))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
    }

    Ok(())
}
