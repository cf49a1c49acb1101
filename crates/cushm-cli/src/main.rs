//! cushm CLI - publish directories of arrays to shared memory and manage projects.

mod commands;
mod npy;
mod progress;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cushm_core::{Registry, StoreConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// cushm - share nested trees of arrays between processes through shared memory.
#[derive(Parser)]
#[command(name = "cushm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory holding project records (overrides CUSHM_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish every .npy file under a directory as a project
    Transfer {
        /// Project name
        project: String,

        /// Directory to load; sub-directories become groups
        dir: PathBuf,

        /// Replace an existing project with the same name
        #[arg(short, long)]
        overwrite: bool,

        /// Do not draw a progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Remove a project's shared memory and its record
    Unlink {
        /// Project name
        project: String,
    },

    /// List published projects
    List {
        /// One line per project instead of per-array tables
        #[arg(short, long)]
        short: bool,
    },
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // RUST_LOG wins over -v when set
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .context("Failed to initialize tracing subscriber")
}

/// Exit status after Ctrl-C, as shells report it
#[cfg(unix)]
const INTERRUPTED: i32 = 130;

#[cfg(unix)]
extern "C" fn on_interrupt(_: nix::libc::c_int) {
    let _ = nix::unistd::write(std::io::stderr(), b"\nInterrupted\n");
    unsafe { nix::libc::_exit(INTERRUPTED) }
}

/// Exit on Ctrl-C without unwinding.
///
/// Segments of an unfinished transfer are removed by the core cleanup
/// agent once this process is gone, so there is nothing to undo here.
#[cfg(unix)]
fn setup_interrupt() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};

    unsafe { signal(Signal::SIGINT, SigHandler::Handler(on_interrupt)) }
        .context("Failed to install the interrupt handler")?;
    Ok(())
}

#[cfg(not(unix))]
fn setup_interrupt() -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;
    setup_interrupt()?;

    let mut config = StoreConfig::from_env();
    if let Some(root) = cli.root {
        config = config.with_root(root);
    }
    tracing::debug!(root = %config.root.display(), prefix = %config.prefix, "store configured");
    let registry = Registry::new(config).context("Invalid store configuration")?;

    match cli.command {
        Commands::Transfer {
            project,
            dir,
            overwrite,
            no_progress,
        } => commands::transfer::run(&registry, &project, &dir, overwrite, !no_progress),
        Commands::Unlink { project } => commands::unlink::run(&registry, &project),
        Commands::List { short } => commands::list::run(&registry, short),
    }
}
