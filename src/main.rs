// File: src/main.rs
//
// Command-line entry point: run a script file or launch the interactive REPL.

mod builtins;
mod bytecode;
mod compiler;
mod context;
mod errors;
mod heap;
mod lexer;
mod regex;
mod repl;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use context::{Context, EvalError};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(ClapParser)]
#[command(name = "sandbox-script", about = "A sandboxed scripting engine", version = env!("CARGO_PKG_VERSION"), long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a script file
    Run {
        /// Path to the script file
        file: PathBuf,

        /// Abort with an uncatchable time-limit error after this many milliseconds
        #[arg(long)]
        time_limit_ms: Option<u64>,

        /// Abort once the heap exceeds this many bytes
        #[arg(long)]
        memory_limit: Option<usize>,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, time_limit_ms, memory_limit } => run_file(file, time_limit_ms, memory_limit),
        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {}", e);
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                std::process::exit(1);
            }
        },
    }
}

fn run_file(file: PathBuf, time_limit_ms: Option<u64>, memory_limit: Option<usize>) {
    let source = match fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: could not read {}: {}", file.display(), e);
            std::process::exit(1);
        }
    };

    let opts = context::ContextOptions {
        memory_limit,
        time_limit: time_limit_ms.map(Duration::from_millis),
    };
    let mut ctx = Context::with_options(opts);
    ctx.set_print_sink(|line| println!("{}", line));

    if let Err(err) = ctx.eval(&source) {
        match err {
            EvalError::Syntax(e) | EvalError::MemoryLimit(e) | EvalError::TimeLimit(e) => eprintln!("{}", e),
            EvalError::Runtime { message, location, .. } => match location {
                Some(loc) => eprintln!("Uncaught {} at {}", message, loc),
                None => eprintln!("Uncaught {}", message),
            },
        }
        std::process::exit(1);
    }
}
