use camino::Utf8PathBuf;
use clap::builder::{styling::AnsiColor, Styles};
use clap::ColorChoice;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use commands::{
    combine_chapters, evict_cache, hash_files, run_all, run_dump, CombineArgs, DumpArgs,
    EvictCacheArgs, HashFilesArgs,
};
use miette::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod errors;
mod utils;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The path to the combiner config file
    #[arg(short, long, global = true, default_value = "combiner.toml")]
    config: Utf8PathBuf,

    /// Also write daily rotated log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract the vanilla and mod binaries of every chapter into asset trees
    Dump,
    /// Merge the dumped trees of each chapter into the merged slot
    Combine {
        /// Only combine this chapter
        #[arg(long)]
        chapter: Option<String>,
    },
    /// Dump, then combine every chapter
    Run,
    /// Manage the export cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Print the digest of one or more files
    Hash {
        /// The files to hash
        #[arg(required = true)]
        files: Vec<Utf8PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Evict the least recently used entries until the cache fits its size cap
    Evict,
}

fn parse_args() -> Args {
    // Configure colored/styled help output
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Blue.on_default());

    let matches = Args::command()
        .styles(styles)
        .color(ColorChoice::Auto)
        .get_matches();

    match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    }
}

fn init_logging(log_dir: Option<&Utf8PathBuf>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "xdelta_combiner=info,xdc_core=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer();

    let (file_guard, file_layer) = match log_dir {
        Some(log_dir) => {
            let appender = std::fs::create_dir_all(log_dir)
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    rolling::RollingFileAppender::builder()
                        .rotation(rolling::Rotation::DAILY)
                        .filename_prefix("xdelta-combiner")
                        .filename_suffix("log")
                        .build(log_dir)
                        .map_err(|e| e.to_string())
                });
            match appender {
                Ok(appender) => {
                    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                    let layer = tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false);
                    (Some(guard), Some(layer))
                }
                Err(e) => {
                    eprintln!("Failed to set up log files in {}: {}", log_dir, e);
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);
    if let Some(layer) = file_layer {
        registry.with(layer).init();
    } else {
        registry.init();
    }

    file_guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    let _guard = init_logging(args.log_dir.as_ref());

    match args.command {
        Commands::Dump => run_dump(DumpArgs {
            config_path: args.config,
        })
        .await
        .map(|_| ()),
        Commands::Combine { chapter } => combine_chapters(CombineArgs {
            config_path: args.config,
            chapter,
        }),
        Commands::Run => run_all(DumpArgs {
            config_path: args.config,
        })
        .await,
        Commands::Cache {
            command: CacheCommands::Evict,
        } => evict_cache(EvictCacheArgs {
            config_path: args.config,
        }),
        Commands::Hash { files } => hash_files(HashFilesArgs { files }),
    }
}
