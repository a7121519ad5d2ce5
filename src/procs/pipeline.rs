//! Pipeline assembly and the [`CommandPipeline`] handle.

use crate::ast::Capture;
use crate::config::Settings;
use crate::procs::pipe::{os_pipe, StreamBuffer, TeeHandle};
use crate::procs::runner::{
    run_inline_callable, run_nested_stage, start_callable, start_external, CallableContext, Endpoint,
    HostIo, Input, NestedRunner, Stage, StageIo, Wire,
};
use crate::procs::spec::{StreamTarget, SubprocSpec};
use crate::procs::status::{signal_message, ExitOutcome};
use crate::procs::ProcError;
use crate::resolver::ResolvedCommand;
use crate::session::Session;
use crate::signals::{self, signal_name, InterruptFlag};
use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How a foreground wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished(i32),
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct Finished {
    returncode: i32,
    /// Stage whose status became the pipeline's
    deciding: usize,
}

struct Runtime {
    stages: Vec<Stage>,
    tees: Vec<TeeHandle>,
    feeders: Vec<JoinHandle<()>>,
    finished: Option<Finished>,
    endtime: Option<DateTime<Local>>,
}

/// Buffer the last stage writes to, with its size when the stage started.
struct Observed {
    buf: Arc<StreamBuffer>,
    base: usize,
}

impl Observed {
    fn new(buf: &Arc<StreamBuffer>) -> Self {
        Observed {
            buf: Arc::clone(buf),
            base: buf.total(),
        }
    }

    fn silent(&self) -> bool {
        self.buf.total() == self.base
    }
}

/// A started pipeline.
///
/// Stages run concurrently; the handle polls them, exposes captured output
/// and settles the return code once every stage has ended.
pub struct CommandPipeline {
    args: Vec<Vec<String>>,
    aliases: Vec<Option<String>>,
    captured: Capture,
    background: bool,
    pgid: Option<i32>,
    out: Option<Arc<StreamBuffer>>,
    err: Option<Arc<StreamBuffer>>,
    /// Buffer behind the last stage's stdout, if any
    observed: Option<Observed>,
    cancel: InterruptFlag,
    session_interrupt: InterruptFlag,
    interrupt_pending: AtomicBool,
    poll_interval: Duration,
    raise_on_error: bool,
    starttime: DateTime<Local>,
    runtime: Mutex<Runtime>,
    output_cache: OnceLock<String>,
}

/// Start every stage of one pipe-chain, left to right.
///
/// On a start failure the stages already running are terminated and the
/// error is returned.
pub fn assemble(
    specs: Vec<SubprocSpec>,
    settings: &Settings,
    session: &Session,
    host: &HostIo,
    nested: &mut dyn NestedRunner,
) -> Result<Arc<CommandPipeline>, ProcError> {
    let Some(last_spec) = specs.last() else {
        return Err(ProcError::SpecBuild("empty pipeline".to_string()));
    };
    let last = specs.len() - 1;
    let captured = last_spec.captured;
    let background = last_spec.background;
    let job_control = session.jobs().enabled();
    let use_groups = job_control || background;
    let starttime = Local::now();

    let cancel = InterruptFlag::new();
    let out = captured.captures_stdout().then(StreamBuffer::new);
    let err = (captured == Capture::Object).then(StreamBuffer::new);
    let mut out_attached = false;
    let mut err_attached = false;
    let mut observed = None;

    let mut args = Vec::with_capacity(specs.len());
    let mut aliases = Vec::with_capacity(specs.len());
    let mut stages: Vec<Stage> = Vec::with_capacity(specs.len());
    let mut tees = Vec::new();
    let mut feeders = Vec::new();
    let mut pgid: Option<i32> = None;
    let mut piped: Option<Input> = None;

    for (index, spec) in specs.into_iter().enumerate() {
        let is_last = index == last;
        let SubprocSpec {
            argv,
            command,
            alias,
            stdin,
            stdout,
            stderr,
            cwd,
            env,
            threadable,
            ..
        } = spec;
        args.push(argv.clone());
        aliases.push(alias.clone());

        let from_prev = piped.take();
        let stdin = match (stdin, from_prev) {
            (Some(file), _) => Input::File(file),
            (None, Some(input)) => input,
            (None, None) if background && !job_control => Input::Null,
            (None, None) => match &host.stdin {
                Some(file) => file
                    .try_clone()
                    .map(Input::File)
                    .map_err(|e| ProcError::ChildStart {
                        cmd: argv[0].clone(),
                        source: e,
                    })?,
                None => Input::Inherit,
            },
        };

        let stdout = match stdout {
            StreamTarget::File(file) => {
                if !is_last {
                    piped = Some(Input::Null);
                }
                Wire::To(Endpoint::File(file))
            }
            StreamTarget::Merge => {
                if !is_last {
                    piped = Some(Input::Null);
                }
                Wire::Merge
            }
            StreamTarget::Default if !is_last => {
                let (reader, writer) = match os_pipe() {
                    Ok(ends) => ends,
                    Err(e) => {
                        abort(&mut stages, pgid);
                        return Err(ProcError::ChildStart {
                            cmd: argv[0].clone(),
                            source: e,
                        });
                    }
                };
                piped = Some(Input::File(reader));
                Wire::To(Endpoint::File(writer))
            }
            StreamTarget::Default => Wire::To(if let Some(buf) = &out {
                out_attached = true;
                observed = Some(Observed::new(buf));
                Endpoint::Buffer {
                    buf: Arc::clone(buf),
                    live: false,
                    close: true,
                }
            } else if let Some(buf) = &host.stdout {
                observed = Some(Observed::new(buf));
                Endpoint::Buffer {
                    buf: Arc::clone(buf),
                    live: false,
                    close: false,
                }
            } else if captured == Capture::Hidden && threadable && !background {
                let buf = StreamBuffer::with_retention(settings.store_stdout);
                observed = Some(Observed::new(&buf));
                Endpoint::Buffer {
                    buf,
                    live: true,
                    close: true,
                }
            } else {
                Endpoint::Terminal(libc::STDOUT_FILENO)
            }),
        };

        let stderr = match stderr {
            StreamTarget::File(file) => Wire::To(Endpoint::File(file)),
            StreamTarget::Merge => Wire::Merge,
            StreamTarget::Default => match (&err, is_last) {
                (Some(buf), true) => {
                    err_attached = true;
                    Wire::To(Endpoint::Buffer {
                        buf: Arc::clone(buf),
                        live: false,
                        close: true,
                    })
                }
                _ => Wire::To(Endpoint::Terminal(libc::STDERR_FILENO)),
            },
        };

        let io = StageIo { stdin, stdout, stderr };
        let started = match command {
            ResolvedCommand::External(path) => {
                let group = use_groups.then(|| pgid.unwrap_or(0));
                start_external(&path, argv, alias, &cwd, &env, io, group, &mut tees)
            }
            ResolvedCommand::Callable(callable) => {
                let ctx = CallableContext {
                    session,
                    cwd,
                    env,
                    stack: callable.wants_stack.then(|| nested.call_stack()),
                };
                if callable.main_thread {
                    run_inline_callable(&callable, argv, alias, io, ctx, &mut feeders)
                } else {
                    start_callable(&callable, argv, alias, io, ctx, &cancel)
                }
            }
            ResolvedCommand::Nested(nested_alias) => {
                run_nested_stage(&nested_alias, argv, alias, io, nested, &mut feeders)
            }
        };

        match started {
            Ok(stage) => {
                if let (Some(pid), true, None) = (stage.pid(), use_groups, pgid) {
                    pgid = Some(pid);
                    if job_control && !background {
                        session.jobs().give_terminal_to(pid);
                    }
                }
                stages.push(stage);
            }
            Err(e) => {
                tracing::debug!("pipeline aborted: {}", e);
                cancel.raise();
                abort(&mut stages, pgid);
                for buf in out.iter().chain(err.iter()) {
                    buf.close();
                }
                if job_control {
                    session.jobs().reclaim_terminal();
                }
                return Err(e);
            }
        }
    }

    for (buf, attached) in [(&out, out_attached), (&err, err_attached)] {
        if let (Some(buf), false) = (buf, attached) {
            buf.close();
        }
    }

    let pipeline = CommandPipeline {
        args,
        aliases,
        captured,
        background,
        pgid,
        out,
        err,
        observed,
        cancel,
        session_interrupt: session.interrupt().clone(),
        interrupt_pending: AtomicBool::new(false),
        poll_interval: settings.poll_interval,
        raise_on_error: settings.raise_subproc_error && captured == Capture::Object,
        starttime,
        runtime: Mutex::new(Runtime {
            stages,
            tees,
            feeders,
            finished: None,
            endtime: None,
        }),
        output_cache: OnceLock::new(),
    };
    tracing::debug!(cmd = %pipeline.executed_cmd(), ?pgid, background, "pipeline started");
    Ok(Arc::new(pipeline))
}

/// Terminate the stages of a half-built pipeline and reap them.
fn abort(stages: &mut [Stage], pgid: Option<i32>) {
    send(stages, pgid, Signal::SIGTERM);
    send(stages, pgid, Signal::SIGCONT);
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if stages.iter_mut().fold(true, |done, s| s.poll() && done) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    tracing::warn!("stages still running after abort");
}

fn send(stages: &[Stage], pgid: Option<i32>, sig: Signal) {
    let result = match pgid {
        Some(pgid) => signals::signal_group(pgid, sig),
        None => stages
            .iter()
            .filter(|s| s.outcome().is_none())
            .filter_map(Stage::pid)
            .map(|pid| signals::signal_process(pid, sig))
            .collect(),
    };
    if let Err(e) = result {
        tracing::debug!("{}", e);
    }
}

fn decide(stages: &[Stage], observed: Option<&Observed>) -> Finished {
    let last = stages.len() - 1;
    let code = |i: usize| stages[i].outcome().map_or(0, |o| o.returncode());
    // Unobserved output (terminal, file) counts as silent on a clean exit
    let silent = observed.map_or(code(last) == 0, Observed::silent);
    if silent {
        let signaled = stages[..last].iter().position(|s| {
            matches!(s.outcome(), Some(ExitOutcome::Signaled { signo, .. }) if signo != libc::SIGPIPE)
        });
        if let Some(i) = signaled {
            return Finished {
                returncode: code(i),
                deciding: i,
            };
        }
    }
    Finished {
        returncode: code(last),
        deciding: last,
    }
}

impl CommandPipeline {
    fn lock(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check every stage without blocking. Returns true once the pipeline
    /// has ended and its return code is settled.
    pub fn poll(&self) -> bool {
        let mut rt = self.lock();
        if rt.finished.is_some() {
            return true;
        }
        let mut all_done = true;
        for stage in rt.stages.iter_mut() {
            let was_running = stage.outcome().is_none();
            let done = stage.poll();
            if done && was_running && stage.is_worker() {
                if let Some(ExitOutcome::Signaled { signo: libc::SIGINT, .. }) = stage.outcome() {
                    self.interrupt_pending.store(true, Ordering::SeqCst);
                }
            }
            all_done &= done;
        }
        if !all_done || !rt.tees.iter().all(TeeHandle::is_finished) {
            return false;
        }

        for tee in rt.tees.drain(..) {
            tee.join();
        }
        // Feeders blocked on a reader that never drains are left behind
        rt.feeders.retain(|f| !f.is_finished());
        let finished = decide(&rt.stages, self.observed.as_ref());
        rt.finished = Some(finished);
        rt.endtime = Some(Local::now());
        if let Some(ExitOutcome::Signaled { signo, core }) = rt.stages[finished.deciding].outcome() {
            if let Some(message) = signal_message(signo, core) {
                eprintln!("{}", message);
            }
        }
        tracing::debug!(cmd = %self.executed_cmd(), returncode = finished.returncode, "pipeline ended");
        true
    }

    pub fn is_done(&self) -> bool {
        self.lock().finished.is_some()
    }

    /// Whether any process stage is stopped.
    pub fn is_stopped(&self) -> bool {
        self.lock().stages.iter().any(Stage::is_stopped)
    }

    fn wait_inner(&self, foreground: bool) -> Result<WaitOutcome, ProcError> {
        loop {
            if self.poll() {
                break;
            }
            if foreground {
                if self.is_stopped() {
                    return Ok(WaitOutcome::Stopped);
                }
                if signals::check_sigtstp() && self.has_processes() {
                    self.suspend();
                }
            }
            if self.session_interrupt.take() {
                tracing::debug!(cmd = %self.executed_cmd(), "interrupting pipeline");
                self.interrupt();
                self.interrupt_pending.store(true, Ordering::SeqCst);
            }
            thread::sleep(self.poll_interval);
        }
        if self.interrupt_pending.swap(false, Ordering::SeqCst) {
            return Err(ProcError::Interrupted);
        }
        Ok(WaitOutcome::Finished(self.returncode_now().unwrap_or(0)))
    }

    /// Wait as the foreground job: returns early if the pipeline stops.
    pub fn wait_foreground(&self) -> Result<WaitOutcome, ProcError> {
        self.wait_inner(true)
    }

    /// Wait for the pipeline to end and return its code.
    pub fn wait(&self) -> Result<i32, ProcError> {
        loop {
            if let WaitOutcome::Finished(code) = self.wait_inner(false)? {
                return Ok(code);
            }
        }
    }

    /// Return code if the pipeline has ended.
    pub fn returncode_now(&self) -> Option<i32> {
        self.lock().finished.map(|f| f.returncode)
    }

    /// Wait and return the code, raising when configured to.
    pub fn returncode(&self) -> Result<i32, ProcError> {
        let code = self.wait()?;
        if self.raise_on_error {
            self.check()?;
        }
        Ok(code)
    }

    pub fn succeeded(&self) -> bool {
        self.wait().map(|code| code == 0).unwrap_or(false)
    }

    /// Error for a failed pipeline: `Signaled` when the deciding stage was
    /// killed, `CalledProcess` otherwise.
    pub fn check(&self) -> Result<(), ProcError> {
        let rt = self.lock();
        let Some(finished) = rt.finished else {
            return Ok(());
        };
        if finished.returncode == 0 {
            return Ok(());
        }
        let cmd = self.executed_cmd();
        match rt.stages[finished.deciding].outcome() {
            Some(ExitOutcome::Signaled { signo, .. }) => Err(ProcError::Signaled {
                cmd,
                signal: signal_name(signo),
                signo,
            }),
            _ => Err(ProcError::CalledProcess {
                cmd,
                code: finished.returncode,
            }),
        }
    }

    /// Captured stdout, waiting for the pipeline to end. Cached after the
    /// first complete read.
    pub fn output(&self) -> Result<String, ProcError> {
        self.wait()?;
        if self.raise_on_error {
            self.check()?;
        }
        let text = self.output_cache.get_or_init(|| {
            self.out
                .as_ref()
                .map(|buf| String::from_utf8_lossy(&buf.contents()).into_owned())
                .unwrap_or_default()
        });
        Ok(text.clone())
    }

    /// Captured stderr (object captures only).
    pub fn errors(&self) -> Result<String, ProcError> {
        self.wait()?;
        Ok(self
            .err
            .as_ref()
            .map(|buf| String::from_utf8_lossy(&buf.contents()).into_owned())
            .unwrap_or_default())
    }

    /// Stream captured stdout line by line as it arrives.
    pub fn lines(&self) -> Lines<'_> {
        Lines {
            pipeline: self,
            pos: 0,
            pending: Vec::new(),
            done: false,
        }
    }

    pub fn args(&self) -> &[Vec<String>] {
        &self.args
    }

    /// Alias the last stage was invoked through, if any.
    pub fn alias(&self) -> Option<&str> {
        self.aliases.last().and_then(|a| a.as_deref())
    }

    pub fn executed_cmd(&self) -> String {
        self.args
            .iter()
            .map(|argv| argv.join(" "))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Text shown in job listings.
    pub fn display_text(&self) -> String {
        if self.background {
            format!("{} &", self.executed_cmd())
        } else {
            self.executed_cmd()
        }
    }

    pub fn captured(&self) -> Capture {
        self.captured
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    pub fn pids(&self) -> Vec<i32> {
        self.lock().stages.iter().filter_map(Stage::pid).collect()
    }

    /// Pid of the last process stage.
    pub fn pid(&self) -> Option<i32> {
        self.pids().last().copied()
    }

    pub fn has_processes(&self) -> bool {
        self.lock().stages.iter().any(|s| s.pid().is_some())
    }

    /// Signal name and core-dump flag of the deciding stage.
    pub fn signal(&self) -> Option<(String, bool)> {
        let rt = self.lock();
        let finished = rt.finished?;
        rt.stages[finished.deciding].outcome()?.signal()
    }

    pub fn starttime(&self) -> DateTime<Local> {
        self.starttime
    }

    pub fn endtime(&self) -> Option<DateTime<Local>> {
        self.lock().endtime
    }

    fn signal_all(&self, sig: Signal) {
        let rt = self.lock();
        send(&rt.stages, self.pgid, sig);
    }

    /// Deliver SIGINT to the process stages and cancel callable stages.
    pub fn interrupt(&self) {
        self.cancel.raise();
        if self.has_processes() {
            self.signal_all(Signal::SIGINT);
        }
    }

    /// SIGTERM then SIGCONT, so stopped stages see the termination.
    pub fn terminate(&self) {
        self.cancel.raise();
        if self.has_processes() && !self.is_done() {
            self.signal_all(Signal::SIGTERM);
            self.signal_all(Signal::SIGCONT);
        }
    }

    pub fn suspend(&self) {
        self.signal_all(Signal::SIGTSTP);
    }

    pub fn resume(&self) {
        self.signal_all(Signal::SIGCONT);
        for stage in self.lock().stages.iter_mut() {
            stage.mark_running();
        }
    }
}

impl fmt::Debug for CommandPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("args", &self.args)
            .field("captured", &self.captured)
            .field("background", &self.background)
            .field("pgid", &self.pgid)
            .field("returncode", &self.returncode_now())
            .finish()
    }
}

/// Line iterator over a pipeline's captured stdout.
///
/// Reads through its own cursor, so it neither consumes nor fills the
/// output cache.
pub struct Lines<'a> {
    pipeline: &'a CommandPipeline,
    pos: usize,
    pending: Vec<u8>,
    done: bool,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(i) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=i).collect();
                return Some(String::from_utf8_lossy(&line[..i]).into_owned());
            }
            if self.done {
                if self.pending.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.pending);
                return Some(String::from_utf8_lossy(&rest).into_owned());
            }
            let Some(buf) = self.pipeline.out.as_ref() else {
                if let Err(ProcError::Interrupted) = self.pipeline.wait() {
                    // Leave it for the caller's next wait
                    self.pipeline.interrupt_pending.store(true, Ordering::SeqCst);
                }
                self.done = true;
                continue;
            };
            let (bytes, closed) = buf.read_from(self.pos, self.pipeline.poll_interval);
            self.pos += bytes.len();
            self.pending.extend_from_slice(&bytes);
            self.pipeline.poll();
            self.done = closed;
        }
    }
}
