//! duosh - a scripting-language shell with subprocess pipelines
//!
//! Usage:
//!   duosh              Start interactive REPL
//!   duosh -c "cmd"     Execute a single command
//!   duosh script.dsh   Execute a script file

mod cli;
mod rcfile;
mod repl;
mod terminal;

use std::env;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_new(duosh::config::log_filter())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let cli = match cli::parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("duosh: {}", e);
            eprintln!("Try 'duosh --help' for more information.");
            return ExitCode::from(2);
        }
    };

    if cli.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }

    if cli.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    if let Some(cmd) = &cli.command {
        return cli::execute_command(cmd, &cli);
    }

    if let Some(script) = &cli.script {
        return cli::execute_script(script, &cli);
    }

    match repl::run_repl(cli.no_rc) {
        Ok(code) => cli::exit_code(code),
        Err(e) => {
            eprintln!("REPL error: {}", e);
            ExitCode::FAILURE
        }
    }
}
