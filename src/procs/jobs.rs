//! Job control: the job table, terminal ownership and fg/bg/disown.

use crate::procs::pipeline::{CommandPipeline, WaitOutcome};
use crate::procs::ProcError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Foreground, owns the terminal
    Running,
    Stopped,
    Background,
    Done(i32),
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Stopped => "stopped",
            JobState::Background => "background",
            JobState::Done(_) => "done",
        }
    }

    /// Word used in listings; background jobs show as running.
    fn display(&self) -> &'static str {
        match self {
            JobState::Background => "running",
            other => other.name(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub pipeline: Arc<CommandPipeline>,
    pub pgid: Option<i32>,
    pub text: String,
    pub state: JobState,
}

/// Serializable view of a job, as listed by `jobs`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobInfo {
    pub id: usize,
    pub state: String,
    pub text: String,
    pub pids: Vec<i32>,
    pub pgid: Option<i32>,
    /// `+` for the current job, `-` for the previous one
    pub marker: char,
    pub returncode: Option<i32>,
    pub starttime: String,
}

impl JobInfo {
    /// `[1]+ running: sleep 100 & (4242)`
    pub fn posix(&self) -> String {
        let pid = self.pids.last().map(|p| format!(" ({})", p)).unwrap_or_default();
        format!("[{}]{} {}: {}{}", self.id, self.marker, self.state, self.text, pid)
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("{0}: no such job")]
    NoSuchJob(String),
    #[error("no current job")]
    NoCurrentJob,
    #[error("job {0} has already finished")]
    Finished(usize),
    #[error(transparent)]
    Proc(#[from] ProcError),
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: BTreeMap<usize, Job>,
    /// Ids in order of last use; the current job is last
    order: Vec<usize>,
}

impl JobTable {
    fn touch(&mut self, id: usize) {
        self.order.retain(|i| *i != id);
        self.order.push(id);
    }

    fn remove(&mut self, id: usize) -> Option<Job> {
        self.order.retain(|i| *i != id);
        self.jobs.remove(&id)
    }

    fn next_id(&self) -> usize {
        (1..).find(|id| !self.jobs.contains_key(id)).unwrap_or(1)
    }

    fn marker(&self, id: usize) -> char {
        match self.order.iter().rev().position(|i| *i == id) {
            Some(0) => '+',
            Some(1) => '-',
            _ => ' ',
        }
    }

    fn info(&self, job: &Job) -> JobInfo {
        let returncode = match job.state {
            JobState::Done(code) => Some(code),
            _ => None,
        };
        JobInfo {
            id: job.id,
            state: job.state.display().to_string(),
            text: job.text.clone(),
            pids: job.pipeline.pids(),
            pgid: job.pgid,
            marker: self.marker(job.id),
            returncode,
            starttime: job.pipeline.starttime().to_rfc3339(),
        }
    }
}

/// Tracks background and stopped pipelines for one session.
#[derive(Debug)]
pub struct JobControl {
    /// Process groups and terminal hand-off are in use
    enabled: bool,
    shell_pgid: i32,
    table: Mutex<JobTable>,
}

impl JobControl {
    pub fn new(enabled: bool) -> Self {
        JobControl {
            enabled,
            shell_pgid: unsafe { libc::getpgrp() },
            table: Mutex::new(JobTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Make `pgid` the terminal's foreground process group.
    pub fn give_terminal_to(&self, pgid: i32) -> bool {
        if !self.enabled {
            return false;
        }
        let ok = unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, pgid) } == 0;
        if !ok {
            tracing::debug!(pgid, "tcsetpgrp failed: {}", std::io::Error::last_os_error());
        }
        ok
    }

    pub fn reclaim_terminal(&self) {
        self.give_terminal_to(self.shell_pgid);
    }

    fn add(&self, pipeline: Arc<CommandPipeline>, state: JobState) -> usize {
        let mut table = self.lock();
        let id = table.next_id();
        let job = Job {
            id,
            pgid: pipeline.pgid(),
            text: pipeline.display_text(),
            pipeline,
            state,
        };
        tracing::info!(id, text = %job.text, state = job.state.name(), "job added");
        table.jobs.insert(id, job);
        table.touch(id);
        id
    }

    /// Register a background pipeline. Pipelines without processes are
    /// not tracked.
    pub fn add_background(&self, pipeline: Arc<CommandPipeline>) -> Option<usize> {
        if !pipeline.has_processes() {
            return None;
        }
        Some(self.add(pipeline, JobState::Background))
    }

    /// Wait for a foreground pipeline. A pipeline that stops becomes a
    /// stopped job and reports status 128+SIGTSTP.
    pub fn wait_foreground(&self, pipeline: &Arc<CommandPipeline>) -> Result<i32, ProcError> {
        self.wait_as(pipeline, None)
    }

    fn wait_as(&self, pipeline: &Arc<CommandPipeline>, id: Option<usize>) -> Result<i32, ProcError> {
        if let Some(pgid) = pipeline.pgid() {
            self.give_terminal_to(pgid);
        }
        let outcome = pipeline.wait_foreground();
        if pipeline.pgid().is_some() {
            self.reclaim_terminal();
        }
        match outcome? {
            WaitOutcome::Finished(code) => Ok(code),
            WaitOutcome::Stopped => {
                let id = match id {
                    Some(id) => {
                        let mut table = self.lock();
                        table.jobs.insert(
                            id,
                            Job {
                                id,
                                pgid: pipeline.pgid(),
                                text: pipeline.display_text(),
                                pipeline: Arc::clone(pipeline),
                                state: JobState::Stopped,
                            },
                        );
                        table.touch(id);
                        id
                    }
                    None => self.add(Arc::clone(pipeline), JobState::Stopped),
                };
                eprintln!("\n[{}]+ stopped: {}", id, pipeline.display_text());
                Ok(128 + libc::SIGTSTP)
            }
        }
    }

    fn pick(&self, table: &JobTable, spec: Option<&str>) -> Result<usize, JobError> {
        match spec {
            None => table.order.last().copied().ok_or(JobError::NoCurrentJob),
            Some(text) => {
                let trimmed = text.trim_start_matches('%');
                let id = match trimmed {
                    "+" | "%" | "" => table.order.last().copied(),
                    "-" => table.order.iter().rev().nth(1).copied(),
                    digits => digits.parse().ok(),
                };
                id.filter(|id| table.jobs.contains_key(id))
                    .ok_or_else(|| JobError::NoSuchJob(text.to_string()))
            }
        }
    }

    /// Bring a job to the foreground and wait for it.
    pub fn fg(&self, spec: Option<&str>) -> Result<i32, JobError> {
        let job = {
            let mut table = self.lock();
            let id = self.pick(&table, spec)?;
            table.remove(id).ok_or(JobError::NoCurrentJob)?
        };
        eprintln!("{}", job.text);
        tracing::info!(id = job.id, "job to foreground");
        job.pipeline.resume();
        Ok(self.wait_as(&job.pipeline, Some(job.id))?)
    }

    /// Continue a stopped job in the background.
    pub fn bg(&self, spec: Option<&str>) -> Result<usize, JobError> {
        self.refresh();
        let mut table = self.lock();
        let id = self.pick(&table, spec)?;
        let job = table.jobs.get_mut(&id).ok_or(JobError::NoCurrentJob)?;
        if matches!(job.state, JobState::Done(_)) {
            return Err(JobError::Finished(id));
        }
        if job.state == JobState::Stopped {
            job.pipeline.resume();
        }
        job.state = JobState::Background;
        eprintln!("[{}]+ {} &", id, job.pipeline.executed_cmd());
        table.touch(id);
        Ok(id)
    }

    /// Stop tracking a job. A stopped job is continued so it does not hang.
    pub fn disown(&self, spec: Option<&str>) -> Result<usize, JobError> {
        let mut table = self.lock();
        let id = self.pick(&table, spec)?;
        if let Some(job) = table.remove(id) {
            if job.state == JobState::Stopped {
                job.pipeline.resume();
            }
            tracing::info!(id, "job disowned");
        }
        Ok(id)
    }

    /// Poll every job; finished ones are marked done.
    pub fn refresh(&self) {
        let mut table = self.lock();
        for job in table.jobs.values_mut() {
            if matches!(job.state, JobState::Done(_)) {
                continue;
            }
            if job.pipeline.poll() {
                job.state = JobState::Done(job.pipeline.returncode_now().unwrap_or(0));
                tracing::info!(id = job.id, state = ?job.state, "job finished");
            } else if job.pipeline.is_stopped() {
                job.state = JobState::Stopped;
            }
        }
    }

    /// Refresh, then remove finished jobs and return their listings.
    pub fn reap(&self) -> Vec<JobInfo> {
        self.refresh();
        let mut table = self.lock();
        let done: Vec<usize> = table
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Done(_)))
            .map(|j| j.id)
            .collect();
        let infos = done
            .iter()
            .filter_map(|id| table.jobs.get(id).map(|j| table.info(j)))
            .collect();
        for id in done {
            table.remove(id);
        }
        infos
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.refresh();
        let table = self.lock();
        table.jobs.values().map(|j| table.info(j)).collect()
    }

    /// Listings of jobs that have not finished yet.
    pub fn unfinished(&self) -> Vec<JobInfo> {
        self.refresh();
        let table = self.lock();
        table
            .jobs
            .values()
            .filter(|j| !matches!(j.state, JobState::Done(_)))
            .map(|j| table.info(j))
            .collect()
    }

    pub fn get(&self, id: usize) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every unfinished job (SIGTERM then SIGCONT).
    pub fn hangup_all(&self) {
        let table = self.lock();
        for job in table.jobs.values() {
            if !matches!(job.state, JobState::Done(_)) {
                tracing::info!(id = job.id, "terminating job on exit");
                job.pipeline.terminate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_listing_format() {
        let info = JobInfo {
            id: 1,
            state: "running".to_string(),
            text: "sleep 100 &".to_string(),
            pids: vec![4242],
            pgid: Some(4242),
            marker: '+',
            returncode: None,
            starttime: String::new(),
        };
        assert_eq!(info.posix(), "[1]+ running: sleep 100 & (4242)");
    }

    #[test]
    fn test_json_listing() {
        let info = JobInfo {
            id: 2,
            state: "stopped".to_string(),
            text: "vim".to_string(),
            pids: vec![7],
            pgid: None,
            marker: '-',
            returncode: None,
            starttime: String::new(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], 2);
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["pids"][0], 7);
    }

    #[test]
    fn test_ids_reuse_lowest_free_slot() {
        let mut table = JobTable::default();
        assert_eq!(table.next_id(), 1);
        table.order = vec![1];
        assert_eq!(table.marker(1), '+');
    }

    #[test]
    fn test_fg_without_jobs() {
        let jobs = JobControl::new(false);
        assert!(matches!(jobs.fg(None), Err(JobError::NoCurrentJob)));
        assert!(matches!(jobs.bg(Some("%3")), Err(JobError::NoSuchJob(_))));
    }
}
