//! # mailbind CLI
//!
//! The `mailbind` binary runs the upload server or converts mail containers
//! from disk.
//!
//! ## Usage
//!
//! ```bash
//! mailbind --config ./config/mailbind.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mailbind serve` | Start the HTTP upload server |
//! | `mailbind convert <PATH>... --output <DIR>` | Convert `.msg` files or directories |
//!
//! ## Examples
//!
//! ```bash
//! # Serve on the address from [server].bind
//! mailbind serve --config ./config/mailbind.toml
//!
//! # Convert a directory of threads, one PDF per thread
//! mailbind convert ./inbox --output ./out --split
//!
//! # Stop at the first container that fails
//! mailbind convert a.msg b.msg --output ./out --on-error abort
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mailbind::config::{self, FailurePolicy};
use mailbind::{convert_cmd, server};

/// mailbind turns Outlook reply threads into PDFs named after the case
/// reference they mention.
#[derive(Parser)]
#[command(
    name = "mailbind",
    about = "mailbind: render the latest message of .msg reply threads to PDF, with PDF attachments appended",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/mailbind.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/mailbind.toml")]
    config: PathBuf,

    /// More log output (`-v` debug, `-vv` trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP upload server.
    Serve,

    /// Convert mail containers from disk.
    ///
    /// Writes a single PDF for one converted container, or an archive for
    /// several (unless `--split`).
    Convert {
        /// Files or directories (searched recursively for containers).
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory, created if missing.
        #[arg(long, short)]
        output: PathBuf,

        /// Write every document separately instead of an archive.
        #[arg(long)]
        split: bool,

        /// Override `[batch].on_error`: `skip` or `abort`.
        #[arg(long)]
        on_error: Option<FailurePolicy>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Convert {
            inputs,
            output,
            split,
            on_error,
        } => {
            convert_cmd::run_convert(&cfg, &inputs, &output, split, on_error).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout is kept for command output.
fn setup_logging(verbose: u8) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = match verbose {
        0 => "warn,mailbind=info,tower_http=info",
        1 => "info,mailbind=debug,tower_http=debug",
        _ => "debug,mailbind=trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
