//! Orus CLI
//!
//! Compile and run .orus programs, type-check them, dump disassembly, or
//! start an interactive session.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use orus_cli::{execute, repl, Mode};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "orus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Orus language interpreter", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a .orus program
    Run {
        /// Input .orus source file
        input: PathBuf,

        /// Dump the disassembly before running and trace dispatch
        #[arg(long)]
        trace: bool,
    },

    /// Type-check a program without running it
    Check {
        /// Input .orus source file
        input: PathBuf,
    },

    /// Print the compiled bytecode listing
    Disasm {
        /// Input .orus source file
        input: PathBuf,
    },

    /// Start an interactive session
    Repl,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ORUS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Some(Commands::Run { input, trace }) => {
            let mut stdout = io::stdout();
            execute(&input, &mut stdout, Mode::Run, trace)
        }
        Some(Commands::Check { input }) => {
            let mut stdout = io::stdout();
            execute(&input, &mut stdout, Mode::Check, false)
        }
        Some(Commands::Disasm { input }) => {
            let mut stdout = io::stdout();
            execute(&input, &mut stdout, Mode::Disasm, false)
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "orus", &mut io::stdout());
            0
        }
        Some(Commands::Repl) | None => repl::run_repl(),
    };
    process::exit(code);
}
