use crate::terminal::run_unit;
use duosh::procs::status::shell_exit_code;
use duosh::signals::setup_signal_handlers;
use duosh::{Evaluator, Session, Value};
use std::fs;
use std::process::ExitCode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parsed command-line arguments
#[derive(Debug, Default, PartialEq)]
pub(crate) struct CliArgs {
    pub(crate) command: Option<String>,
    pub(crate) script: Option<String>,
    /// Arguments after the script or command, bound to `args`
    pub(crate) script_args: Vec<String>,
    pub(crate) no_rc: bool,
    pub(crate) help: bool,
    pub(crate) version: bool,
}

/// Parse command-line arguments
pub(crate) fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();

    let mut i = 1; // Skip program name
    while i < args.len() {
        match args[i].as_str() {
            "-c" => {
                let cmd = args.get(i + 1).ok_or("-c requires an argument")?;
                cli.command = Some(cmd.clone());
                cli.script_args = args[i + 2..].to_vec();
                break;
            }
            "--no-rc" => cli.no_rc = true,
            "--help" | "-h" => cli.help = true,
            "--version" | "-V" => cli.version = true,
            "--" => {
                if let Some(script) = args.get(i + 1) {
                    cli.script = Some(script.clone());
                    cli.script_args = args[i + 2..].to_vec();
                }
                break;
            }
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("unknown option: {}", flag));
            }
            path => {
                cli.script = Some(path.to_string());
                cli.script_args = args[i + 1..].to_vec();
                break;
            }
        }
        i += 1;
    }

    Ok(cli)
}

pub(crate) fn print_help() {
    println!(
        r#"duosh {} - a scripting-language shell with subprocess pipelines

USAGE:
    duosh                   Start interactive REPL
    duosh -c <command>      Execute a single command
    duosh <script> [args]   Execute a script file
    duosh --no-rc           Skip ~/.duoshrc
    duosh --help            Show this help message
    duosh --version         Show version

STARTUP:
    ~/.duoshrc              Executed on REPL startup (if exists)
    ~/.duosh_history        REPL history

SUBPROCESS OPERATORS:
    cmd args                Run a command (when `cmd` is not a bound name)
    $[cmd]                  Stream to the terminal, value None
    $(cmd)                  Capture stdout as a string
    !(cmd)                  Capture a pipeline handle
    ![cmd]                  Run, discard the value
    @(expr)                 Splice a host value into a command
    a | b, a && b, a || b   Pipes and short-circuit chains
    > >> < 2> e> a> 2>&1    Redirections
    cmd &                   Run in the background

JOB CONTROL:
    jobs [--json]           List jobs
    fg [%N]                 Bring a job to the foreground
    bg [%N]                 Continue a stopped job in the background
    disown [%N]             Forget a job

ENVIRONMENT:
    DUOSH_RAISE_SUBPROC_ERROR   Raise on nonzero exit
    DUOSH_THREAD_SUBPROCS       0 runs every command unthreaded
    DUOSH_STORE_STDOUT          Keep output of uncaptured commands
    DUOSH_POLL_INTERVAL_MS      Pipeline polling interval
    DUOSH_GLOB_NO_MATCH         literal | drop
    DUOSH_MAX_RECURSION         Host call depth limit (default 64)
    DUOSH_LOG                   Log filter (e.g. debug, duosh=trace)"#,
        VERSION
    );
}

pub(crate) fn print_version() {
    println!("duosh {}", VERSION);
}

/// Process exit status for a pipeline return code.
pub(crate) fn exit_code(code: i32) -> ExitCode {
    ExitCode::from((shell_exit_code(code) & 0xff) as u8)
}

fn batch_evaluator(cli: &CliArgs) -> Evaluator {
    let session = Session::new(false);
    setup_signal_handlers(session.interrupt().clone(), false);
    let mut eval = Evaluator::new(session);
    let args = cli.script_args.iter().cloned().map(Value::Str).collect();
    eval.set_var("args", Value::List(args));
    eval
}

/// Execute a single command string
pub(crate) fn execute_command(cmd: &str, cli: &CliArgs) -> ExitCode {
    let mut eval = batch_evaluator(cli);
    let code = run_unit(&mut eval, cmd);
    eval.session().jobs().hangup_all();
    exit_code(code)
}

/// Execute a script file
pub(crate) fn execute_script(path: &str, cli: &CliArgs) -> ExitCode {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("duosh: {}: {}", path, e);
            return ExitCode::from(127);
        }
    };
    let mut eval = batch_evaluator(cli);
    // A leading shebang line is not host code
    let body = match content.strip_prefix("#!") {
        Some(rest) => rest.split_once('\n').map(|(_, body)| body).unwrap_or(""),
        None => &content,
    };
    let code = run_unit(&mut eval, body);
    eval.session().jobs().hangup_all();
    exit_code(code)
}
