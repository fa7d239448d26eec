use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use clap::{Parser, Subcommand};
use rook_vfs::UnixVfs;
use rookery::{format, BookieConfig, Cx, ExitCode};

#[derive(Parser)]
#[command(name = "rookery", about = "Rookery bookie maintenance tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wipe journal, ledger, and index data for a bookie.
    Format {
        /// Journal directory.
        #[arg(long)]
        journal_dir: PathBuf,
        /// Ledger directories (repeatable).
        #[arg(long = "ledger-dir", required = true)]
        ledger_dirs: Vec<PathBuf>,
        /// Wipe without prompting.
        #[arg(long)]
        force: bool,
        /// Never prompt (refuses non-empty dirs unless --force).
        #[arg(long)]
        non_interactive: bool,
    },
}

fn main() -> ProcessExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Format {
            journal_dir,
            ledger_dirs,
            force,
            non_interactive,
        } => {
            let cfg = BookieConfig {
                journal_dir,
                ledger_dirs,
                ..BookieConfig::default()
            };
            let ok = format(&UnixVfs::new(), &Cx::new(), &cfg, !non_interactive, force);
            if ok {
                ProcessExitCode::from(u8::try_from(ExitCode::Ok as i32).unwrap_or(0))
            } else {
                ProcessExitCode::from(
                    u8::try_from(ExitCode::BookieException as i32).unwrap_or(2),
                )
            }
        }
    }
}
