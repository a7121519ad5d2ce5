//! Starting individual pipeline stages.
//!
//! External commands run as child processes whose fds are either connected
//! directly to their endpoints or, when output has to be observed, to a pipe
//! drained by a tee worker. Callable aliases run on worker threads. Nested
//! aliases and main-thread callables run inline on the calling thread and
//! hand their output to the next stage through a feeder.

use crate::aliases::{AliasCall, AliasError, AliasFn, CallableAlias, NestedAlias};
use crate::procs::pipe::{os_pipe, spawn_feeder, spawn_tee, BufferWriter, StreamBuffer, TeeHandle};
use crate::procs::status::ExitOutcome;
use crate::procs::ProcError;
use crate::session::Session;
use crate::signals::{self, InterruptFlag};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default stdio of the code evaluating a pipeline.
///
/// At top level both are `None`, meaning the terminal. While a nested alias
/// runs, the interpreter writes into a buffer and may read from the stage
/// before it.
#[derive(Debug, Default)]
pub struct HostIo {
    pub stdin: Option<File>,
    pub stdout: Option<Arc<StreamBuffer>>,
}

impl HostIo {
    pub fn terminal() -> Self {
        Self::default()
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(HostIo {
            stdin: self.stdin.as_ref().map(File::try_clone).transpose()?,
            stdout: self.stdout.clone(),
        })
    }
}

/// Runs aliases that need the interpreter.
pub trait NestedRunner {
    /// Run `alias` with `argv` bound as its arguments and return its status.
    fn run_nested(&mut self, alias: &NestedAlias, argv: &[String], io: HostIo) -> Result<i32, ProcError>;

    /// Names of the functions currently executing, innermost last.
    fn call_stack(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Stand-in for contexts without an interpreter.
#[derive(Debug, Default)]
pub struct NoNested;

impl NestedRunner for NoNested {
    fn run_nested(&mut self, _alias: &NestedAlias, argv: &[String], _io: HostIo) -> Result<i32, ProcError> {
        Err(ProcError::SpecBuild(format!(
            "{}: alias needs an interpreter",
            argv.first().map(String::as_str).unwrap_or("")
        )))
    }
}

pub(crate) enum Input {
    Inherit,
    Null,
    File(File),
}

/// Where one output stream of a stage ends up.
pub(crate) enum Endpoint {
    /// One of the shell's own fds (1 or 2)
    Terminal(RawFd),
    Null,
    File(File),
    /// Captured; `live` echoes to the terminal, `close` ends the buffer at EOF
    Buffer {
        buf: Arc<StreamBuffer>,
        live: bool,
        close: bool,
    },
}

pub(crate) enum Wire {
    To(Endpoint),
    /// Follow the other output stream
    Merge,
}

pub(crate) struct StageIo {
    pub stdin: Input,
    pub stdout: Wire,
    pub stderr: Wire,
}

fn dup_fd(fd: RawFd) -> io::Result<File> {
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(new) })
}

fn dev_null(write: bool) -> io::Result<File> {
    OpenOptions::new().read(!write).write(write).open("/dev/null")
}

fn live_stdout() -> Box<dyn Write + Send> {
    Box::new(io::stdout())
}

impl Input {
    fn into_stdio(self) -> Stdio {
        match self {
            Input::Inherit => Stdio::inherit(),
            Input::Null => Stdio::null(),
            Input::File(f) => Stdio::from(f),
        }
    }

    fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Input::Inherit => Box::new(io::stdin()),
            Input::Null => Box::new(io::empty()),
            Input::File(f) => Box::new(f),
        }
    }

    fn into_file(self) -> io::Result<Option<File>> {
        match self {
            Input::Inherit => Ok(None),
            Input::Null => dev_null(false).map(Some),
            Input::File(f) => Ok(Some(f)),
        }
    }
}

impl Endpoint {
    fn try_clone(&self) -> io::Result<Endpoint> {
        Ok(match self {
            Endpoint::Terminal(fd) => Endpoint::Terminal(*fd),
            Endpoint::Null => Endpoint::Null,
            Endpoint::File(f) => Endpoint::File(f.try_clone()?),
            Endpoint::Buffer { buf, live, .. } => Endpoint::Buffer {
                buf: Arc::clone(buf),
                live: *live,
                close: false,
            },
        })
    }

    fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            Endpoint::Terminal(libc::STDOUT_FILENO) => Box::new(io::stdout()),
            Endpoint::Terminal(_) => Box::new(io::stderr()),
            Endpoint::Null => Box::new(io::sink()),
            Endpoint::File(f) => Box::new(f),
            Endpoint::Buffer { buf, live, close } => {
                Box::new(BufferWriter::new(buf, live.then(live_stdout), close))
            }
        }
    }

    /// Route file output through a buffer that is fed to the file later.
    fn deferred(self, feeds: &mut Vec<(Arc<StreamBuffer>, File)>) -> Endpoint {
        match self {
            Endpoint::File(f) => {
                let buf = StreamBuffer::new();
                feeds.push((Arc::clone(&buf), f));
                Endpoint::Buffer {
                    buf,
                    live: false,
                    close: true,
                }
            }
            other => other,
        }
    }
}

/// An output endpoint turned into something a child process can inherit.
enum ChildFd {
    Inherit,
    File(File),
}

impl ChildFd {
    fn realize(ep: Endpoint, natural: RawFd, label: &str, tees: &mut Vec<TeeHandle>) -> io::Result<Self> {
        Ok(match ep {
            Endpoint::Terminal(fd) if fd == natural => ChildFd::Inherit,
            Endpoint::Terminal(fd) => ChildFd::File(dup_fd(fd)?),
            Endpoint::Null => ChildFd::File(dev_null(true)?),
            Endpoint::File(f) => ChildFd::File(f),
            Endpoint::Buffer { buf, live, close } => {
                let (reader, writer) = os_pipe()?;
                tees.push(spawn_tee(label, reader, live.then(live_stdout), buf, close)?);
                ChildFd::File(writer)
            }
        })
    }

    fn try_clone(&self, natural: RawFd) -> io::Result<File> {
        match self {
            ChildFd::Inherit => dup_fd(natural),
            ChildFd::File(f) => f.try_clone(),
        }
    }

    fn into_stdio(self) -> Stdio {
        match self {
            ChildFd::Inherit => Stdio::inherit(),
            ChildFd::File(f) => Stdio::from(f),
        }
    }
}

enum Handle {
    Process(i32),
    Worker(Option<JoinHandle<ExitOutcome>>),
    Inline,
}

/// One running or finished stage of a pipeline.
pub(crate) struct Stage {
    pub argv: Vec<String>,
    pub alias: Option<String>,
    handle: Handle,
    outcome: Option<ExitOutcome>,
    stopped: bool,
}

impl Stage {
    fn new(argv: Vec<String>, alias: Option<String>, handle: Handle) -> Self {
        Stage {
            argv,
            alias,
            handle,
            outcome: None,
            stopped: false,
        }
    }

    fn finished(argv: Vec<String>, alias: Option<String>, outcome: ExitOutcome) -> Self {
        let mut stage = Stage::new(argv, alias, Handle::Inline);
        stage.outcome = Some(outcome);
        stage
    }

    pub fn pid(&self) -> Option<i32> {
        match self.handle {
            Handle::Process(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.handle, Handle::Worker(_))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped && self.outcome.is_none()
    }

    pub fn mark_running(&mut self) {
        self.stopped = false;
    }

    fn finish(&mut self, outcome: ExitOutcome) {
        tracing::debug!(cmd = %self.argv[0], ?outcome, "stage finished");
        self.outcome = Some(outcome);
        self.stopped = false;
    }

    /// Non-blocking status check. Returns true once the stage has ended.
    pub fn poll(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match &mut self.handle {
            Handle::Process(pid) => {
                let pid = *pid;
                let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED;
                match waitpid(Pid::from_raw(pid), Some(flags)) {
                    Ok(WaitStatus::Stopped(..)) => {
                        if !self.stopped {
                            tracing::debug!(pid, "stage stopped");
                        }
                        self.stopped = true;
                        false
                    }
                    Ok(WaitStatus::Continued(_)) => {
                        self.stopped = false;
                        false
                    }
                    Ok(status) => match ExitOutcome::from_wait(status) {
                        Some(outcome) => {
                            self.finish(outcome);
                            true
                        }
                        None => false,
                    },
                    Err(Errno::EINTR) => false,
                    Err(e) => {
                        tracing::warn!(pid, "waitpid failed: {}", e);
                        self.finish(ExitOutcome::Exited(0));
                        true
                    }
                }
            }
            Handle::Worker(slot) => {
                if !slot.as_ref().map_or(true, JoinHandle::is_finished) {
                    return false;
                }
                let outcome = match slot.take().map(JoinHandle::join) {
                    Some(Ok(outcome)) => outcome,
                    Some(Err(_)) => {
                        tracing::warn!(cmd = %self.argv[0], "callable alias panicked");
                        ExitOutcome::Exited(1)
                    }
                    None => ExitOutcome::Exited(0),
                };
                self.finish(outcome);
                true
            }
            Handle::Inline => true,
        }
    }
}

fn child_start(cmd: &str) -> impl FnOnce(io::Error) -> ProcError + '_ {
    move |source| ProcError::ChildStart {
        cmd: cmd.to_string(),
        source,
    }
}

/// Spawn an external command. `group` is the process group to join
/// (0 creates a new one).
pub(crate) fn start_external(
    path: &Path,
    argv: Vec<String>,
    alias: Option<String>,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    io: StageIo,
    group: Option<i32>,
    tees: &mut Vec<TeeHandle>,
) -> Result<Stage, ProcError> {
    let label = argv[0].clone();
    let (stdout, stderr) = wire_child(io.stdout, io.stderr, &label, tees).map_err(child_start(&label))?;

    let mut cmd = Command::new(path);
    cmd.arg0(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(io.stdin.into_stdio())
        .stdout(stdout.into_stdio())
        .stderr(stderr.into_stdio());
    if let Some(pgid) = group {
        cmd.process_group(pgid);
    }
    unsafe {
        cmd.pre_exec(|| {
            signals::reset_child_signals();
            Ok(())
        });
    }
    let child = cmd.spawn().map_err(child_start(&label))?;
    let pid = child.id() as i32;
    tracing::debug!(pid, cmd = %label, path = %path.display(), ?group, "spawned");
    Ok(Stage::new(argv, alias, Handle::Process(pid)))
}

fn wire_child(
    stdout: Wire,
    stderr: Wire,
    label: &str,
    tees: &mut Vec<TeeHandle>,
) -> io::Result<(ChildFd, ChildFd)> {
    const OUT: RawFd = libc::STDOUT_FILENO;
    const ERR: RawFd = libc::STDERR_FILENO;
    Ok(match (stdout, stderr) {
        (Wire::To(out), Wire::To(err)) => (
            ChildFd::realize(out, OUT, label, tees)?,
            ChildFd::realize(err, ERR, label, tees)?,
        ),
        (Wire::To(out), Wire::Merge) => {
            let out = ChildFd::realize(out, OUT, label, tees)?;
            let err = ChildFd::File(out.try_clone(OUT)?);
            (out, err)
        }
        (Wire::Merge, Wire::To(err)) => {
            let err = ChildFd::realize(err, ERR, label, tees)?;
            let out = ChildFd::File(err.try_clone(ERR)?);
            (out, err)
        }
        (Wire::Merge, Wire::Merge) => (ChildFd::File(dup_fd(ERR)?), ChildFd::Inherit),
    })
}

fn wire_writers(stdout: Wire, stderr: Wire) -> io::Result<(Endpoint, Endpoint)> {
    Ok(match (stdout, stderr) {
        (Wire::To(out), Wire::To(err)) => (out, err),
        (Wire::To(out), Wire::Merge) => {
            let err = out.try_clone()?;
            (out, err)
        }
        (Wire::Merge, Wire::To(err)) => {
            let out = err.try_clone()?;
            (out, err)
        }
        (Wire::Merge, Wire::Merge) => (
            Endpoint::Terminal(libc::STDERR_FILENO),
            Endpoint::Terminal(libc::STDERR_FILENO),
        ),
    })
}

/// Everything a callable stage needs besides its stdio.
pub(crate) struct CallableContext<'a> {
    pub session: &'a Session,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stack: Option<Vec<String>>,
}

fn make_call(
    argv: &[String],
    stdin: Input,
    stdout: Endpoint,
    stderr: Endpoint,
    ctx: CallableContext<'_>,
    interrupt: InterruptFlag,
) -> AliasCall {
    AliasCall {
        name: argv[0].clone(),
        args: argv[1..].to_vec(),
        stdin: stdin.into_reader(),
        stdout: stdout.into_writer(),
        stderr: stderr.into_writer(),
        cwd: ctx.cwd,
        env: ctx.env,
        session: ctx.session.clone(),
        stack: ctx.stack,
        interrupt,
    }
}

fn invoke(func: &AliasFn, call: &mut AliasCall) -> ExitOutcome {
    let result = func(call);
    let _ = call.stdout.flush();
    match result {
        Ok(value) => ExitOutcome::Exited(value.exit_code()),
        Err(AliasError::Interrupted) => ExitOutcome::Signaled {
            signo: libc::SIGINT,
            core: false,
        },
        Err(e) => {
            let _ = writeln!(call.stderr, "{}: {}", call.name, e);
            ExitOutcome::Exited(1)
        }
    }
}

/// Run a callable alias on a worker thread.
pub(crate) fn start_callable(
    callable: &CallableAlias,
    argv: Vec<String>,
    alias: Option<String>,
    io: StageIo,
    ctx: CallableContext<'_>,
    cancel: &InterruptFlag,
) -> Result<Stage, ProcError> {
    let (stdout, stderr) = wire_writers(io.stdout, io.stderr).map_err(child_start(&argv[0]))?;
    let mut call = make_call(&argv, io.stdin, stdout, stderr, ctx, cancel.clone());
    let func = Arc::clone(&callable.func);
    let handle = thread::Builder::new()
        .name(format!("alias-{}", callable.name))
        .spawn(move || invoke(&*func, &mut call))
        .map_err(child_start(&argv[0]))?;
    tracing::debug!(alias = %callable.name, "callable started on worker");
    Ok(Stage::new(argv, alias, Handle::Worker(Some(handle))))
}

fn deliver(feeds: Vec<(Arc<StreamBuffer>, File)>, feeders: &mut Vec<JoinHandle<()>>) -> io::Result<()> {
    for (buf, sink) in feeds {
        feeders.push(spawn_feeder(buf.contents(), sink)?);
    }
    Ok(())
}

/// Run a main-thread callable inline.
pub(crate) fn run_inline_callable(
    callable: &CallableAlias,
    argv: Vec<String>,
    alias: Option<String>,
    io: StageIo,
    ctx: CallableContext<'_>,
    feeders: &mut Vec<JoinHandle<()>>,
) -> Result<Stage, ProcError> {
    let interrupt = ctx.session.interrupt().clone();
    let (stdout, stderr) = wire_writers(io.stdout, io.stderr).map_err(child_start(&argv[0]))?;
    let mut feeds = Vec::new();
    let stdout = stdout.deferred(&mut feeds);
    let stderr = stderr.deferred(&mut feeds);
    let mut call = make_call(&argv, io.stdin, stdout, stderr, ctx, interrupt.clone());
    let outcome = invoke(&*callable.func, &mut call);
    drop(call);
    deliver(feeds, feeders).map_err(child_start(&argv[0]))?;
    if let ExitOutcome::Signaled { signo: libc::SIGINT, .. } = outcome {
        interrupt.take();
        return Err(ProcError::Interrupted);
    }
    Ok(Stage::finished(argv, alias, outcome))
}

/// Run a nested alias through the interpreter on the calling thread.
///
/// Its stderr is the terminal; stdout follows the stage's wiring, with pipe
/// and file targets written by a feeder once the alias returns.
pub(crate) fn run_nested_stage(
    nested_alias: &NestedAlias,
    argv: Vec<String>,
    alias: Option<String>,
    io: StageIo,
    runner: &mut dyn NestedRunner,
    feeders: &mut Vec<JoinHandle<()>>,
) -> Result<Stage, ProcError> {
    let stdin = io.stdin.into_file().map_err(child_start(&argv[0]))?;
    if let Wire::To(Endpoint::Buffer { buf, close: true, .. }) = &io.stderr {
        buf.close();
    }
    let endpoint = match io.stdout {
        Wire::To(ep) => ep,
        Wire::Merge => Endpoint::Terminal(libc::STDERR_FILENO),
    };
    let mut feeds = Vec::new();
    let mut close_after = None;
    let stdout = match endpoint.deferred(&mut feeds) {
        Endpoint::Terminal(_) => None,
        Endpoint::Null => Some(StreamBuffer::with_retention(false)),
        Endpoint::Buffer { buf, close, .. } => {
            if close {
                close_after = Some(Arc::clone(&buf));
            }
            Some(buf)
        }
        Endpoint::File(_) => None,
    };
    let result = runner.run_nested(nested_alias, &argv, HostIo { stdin, stdout });
    if let Some(buf) = close_after {
        buf.close();
    }
    let code = result?;
    deliver(feeds, feeders).map_err(child_start(&argv[0]))?;
    Ok(Stage::finished(argv, alias, ExitOutcome::Exited(code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_file_becomes_buffer() {
        let (_r, w) = os_pipe().unwrap();
        let mut feeds = Vec::new();
        let ep = Endpoint::File(w).deferred(&mut feeds);
        assert!(matches!(ep, Endpoint::Buffer { close: true, .. }));
        assert_eq!(feeds.len(), 1);
    }

    #[test]
    fn test_buffer_clone_does_not_close() {
        let ep = Endpoint::Buffer {
            buf: StreamBuffer::new(),
            live: false,
            close: true,
        };
        assert!(matches!(ep.try_clone().unwrap(), Endpoint::Buffer { close: false, .. }));
    }

    #[test]
    fn test_external_stage_exit_status() {
        let session = Session::new(false);
        let io = StageIo {
            stdin: Input::Null,
            stdout: Wire::To(Endpoint::Null),
            stderr: Wire::To(Endpoint::Null),
        };
        let mut tees = Vec::new();
        let mut stage = start_external(
            Path::new("/bin/sh"),
            vec!["sh".into(), "-c".into(), "exit 3".into()],
            None,
            &session.cwd(),
            &session.env_snapshot(),
            io,
            None,
            &mut tees,
        )
        .unwrap();
        while !stage.poll() {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(stage.outcome(), Some(ExitOutcome::Exited(3)));
    }

    #[test]
    fn test_missing_executable_is_child_start_error() {
        let session = Session::new(false);
        let io = StageIo {
            stdin: Input::Null,
            stdout: Wire::To(Endpoint::Null),
            stderr: Wire::To(Endpoint::Null),
        };
        let err = start_external(
            Path::new("/nonexistent/duosh-test-binary"),
            vec!["duosh-test-binary".into()],
            None,
            &session.cwd(),
            &session.env_snapshot(),
            io,
            None,
            &mut Vec::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProcError::ChildStart { .. }));
        assert_eq!(err.exit_code(), 127);
    }
}
