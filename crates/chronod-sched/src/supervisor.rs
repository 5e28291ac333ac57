//! Child process management.
//!
//! The supervisor owns every running job: spawning, pipe draining, output
//! coalescing, file logging, and termination. Pipe readers run as tokio
//! tasks and feed raw chunks back through the event channel; all bookkeeping
//! happens on the dispatcher thread, so nothing here needs a lock.

use chronod_core::{ChronodError, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;

use crate::events::{Event, OutputStream};
use crate::registry::ScheduleKey;
use crate::schedule::ScheduleDef;

/// A partial line on one stream is flushed anyway past this size, so a
/// process that never prints a newline cannot pin the buffer.
pub const LINE_FLUSH_LIMIT: usize = 32 * 1024;
/// The in-memory tail is trimmed back to roughly this size...
pub const TAIL_KEEP: usize = 32 * 1024;
/// ...once it grows past this.
pub const TAIL_CAP: usize = 64 * 1024;

/// Why a job was terminated early, reported in the result payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermReason {
    /// `term_after` elapsed.
    Runtime,
    /// `term_output` bytes exceeded.
    Output,
    /// Daemon shutdown or explicit kill.
    Requested,
}

impl TermReason {
    pub fn code(self) -> &'static str {
        match self {
            TermReason::Runtime => "process_term_alert",
            TermReason::Output => "process_term_output",
            TermReason::Requested => "process_term_requested",
        }
    }
}

/// Per-stream line assembly state.
#[derive(Debug, Default)]
struct StreamBuf {
    pending: Vec<u8>,
    closed: bool,
}

impl StreamBuf {
    /// Absorb a chunk and return every line it completed. A partial line
    /// past `LINE_FLUSH_LIMIT` is flushed without its newline.
    fn absorb(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            out.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        if self.pending.len() > LINE_FLUSH_LIMIT {
            let line = std::mem::take(&mut self.pending);
            out.push(String::from_utf8_lossy(&line).into_owned());
        }
        out
    }

    /// Flush whatever is left at end of stream.
    fn drain_rest(&mut self) -> Option<String> {
        self.closed = true;
        if self.pending.is_empty() {
            None
        } else {
            let line = std::mem::take(&mut self.pending);
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}

/// A running (or finishing) job.
pub struct Job {
    pub id: u64,
    pub key: ScheduleKey,
    /// Index into the definition's command list.
    pub cmd_index: usize,
    pub cmds: Vec<String>,
    pub child: Option<Child>,
    pub pid: Option<u32>,
    /// The occurrence this run satisfies.
    pub trigger_ts: i64,
    pub started_at: i64,
    /// True for ad-hoc runs requested over the wire.
    pub triggered: bool,
    pub data: Option<String>,
    stdout: StreamBuf,
    stderr: StreamBuf,
    /// Last complete stdout line, candidate for structured result adoption.
    pub last_line: Option<String>,
    pub bytes_read: u64,
    pub stderr_seen: bool,
    /// Recent output kept for streaming clients and error reports.
    pub tail: Vec<u8>,
    pub out_file: Option<u64>,
    /// Clients streaming this job's output live.
    pub monitors: Vec<u64>,
    pub alerted: bool,
    pub term_reason: Option<TermReason>,
}

impl Job {
    pub fn pipes_closed(&self) -> bool {
        self.stdout.closed && self.stderr.closed
    }

    pub fn runtime(&self, now: i64) -> i64 {
        (now - self.started_at).max(0)
    }

    fn push_tail(&mut self, line: &str) {
        self.tail.extend_from_slice(line.as_bytes());
        self.tail.push(b'\n');
        if self.tail.len() > TAIL_CAP {
            let cut = self.tail.len() - TAIL_KEEP;
            // Trim forward to a line boundary so the tail starts clean.
            let cut = self.tail[cut..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| cut + p + 1)
                .unwrap_or(cut);
            self.tail.drain(..cut);
        }
    }
}

/// Reference-counted open output files, shared across a job's commands and
/// across queued runs of the same schedule.
#[derive(Default)]
pub struct FileTable {
    next_id: u64,
    files: BTreeMap<u64, (PathBuf, std::fs::File, u32)>,
}

impl FileTable {
    /// Hand back a table id for `path`. An already-open path is reused with
    /// its refcount bumped, so overlapping runs append to one handle instead
    /// of truncating each other; a fresh path is opened truncated.
    pub fn open(&mut self, path: &Path) -> Result<u64> {
        if let Some((&id, entry)) = self.files.iter_mut().find(|(_, (p, _, _))| p == path) {
            entry.2 += 1;
            return Ok(id);
        }
        let file = std::fs::File::create(path)?;
        self.next_id += 1;
        self.files.insert(self.next_id, (path.to_path_buf(), file, 1));
        Ok(self.next_id)
    }

    /// Drop one reference; the file closes when the last one goes.
    pub fn release(&mut self, id: u64) {
        let gone = match self.files.get_mut(&id) {
            Some(entry) => {
                entry.2 -= 1;
                entry.2 == 0
            }
            None => false,
        };
        if gone {
            self.files.remove(&id);
        }
    }

    pub fn write_line(&mut self, id: u64, line: &str) -> Result<()> {
        if let Some((path, file, _)) = self.files.get_mut(&id) {
            if let Err(e) = writeln!(file, "{line}") {
                return Err(ChronodError::Execution(format!(
                    "write to {} failed: {e}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn path(&self, id: u64) -> Option<&Path> {
        self.files.get(&id).map(|(p, _, _)| p.as_path())
    }

    #[cfg(test)]
    fn refcount(&self, id: u64) -> Option<u32> {
        self.files.get(&id).map(|e| e.2)
    }
}

/// Values exported into a job's environment.
pub struct StartContext {
    pub last_result: Option<String>,
    pub last_ts: i64,
    pub curr_ts: i64,
    pub data: Option<String>,
}

/// Owns all running jobs and their pipe reader tasks.
pub struct ProcessSupervisor {
    next_job_id: u64,
    jobs: BTreeMap<u64, Job>,
    pub files: FileTable,
    events: UnboundedSender<Event>,
}

impl ProcessSupervisor {
    pub fn new(events: UnboundedSender<Event>) -> Self {
        Self {
            next_job_id: 0,
            jobs: BTreeMap::new(),
            files: FileTable::default(),
            events,
        }
    }

    pub fn job(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: u64) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    pub fn running_count(&self, key: &ScheduleKey) -> u32 {
        self.jobs.values().filter(|j| &j.key == key).count() as u32
    }

    pub fn total_running(&self) -> u32 {
        self.jobs.len() as u32
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<u64> {
        self.jobs
            .values()
            .find(|j| j.pid == Some(pid))
            .map(|j| j.id)
    }

    pub fn find_by_key(&self, key: &ScheduleKey) -> Option<u64> {
        self.jobs.values().find(|j| &j.key == key).map(|j| j.id)
    }

    /// Launch the first command of a run.
    pub fn start_job(
        &mut self,
        key: ScheduleKey,
        def: &ScheduleDef,
        trigger_ts: i64,
        triggered: bool,
        ctx: StartContext,
    ) -> Result<u64> {
        if def.cmds.is_empty() {
            return Err(ChronodError::Start("schedule has no commands".into()));
        }
        self.next_job_id += 1;
        let id = self.next_job_id;

        // Ad-hoc runs never touch the schedule's output file.
        let out_file = match (&def.output_file, triggered) {
            (Some(path), false) => Some(self.files.open(path)?),
            _ => None,
        };

        let mut job = Job {
            id,
            key,
            cmd_index: 0,
            cmds: def.cmds.clone(),
            child: None,
            pid: None,
            trigger_ts,
            started_at: chrono::Utc::now().timestamp(),
            triggered,
            data: ctx.data.clone(),
            stdout: StreamBuf::default(),
            stderr: StreamBuf::default(),
            last_line: None,
            bytes_read: 0,
            stderr_seen: false,
            tail: Vec::new(),
            out_file,
            monitors: Vec::new(),
            alerted: false,
            term_reason: None,
        };
        if let Err(e) = self.spawn_command(&mut job, def, &ctx) {
            if let Some(fid) = job.out_file {
                self.files.release(fid);
            }
            return Err(e);
        }
        self.jobs.insert(id, job);
        Ok(id)
    }

    /// Move a finished command's job on to the next command in its list.
    /// Tail, monitors, and byte counters carry across.
    pub fn start_next_command(&mut self, id: u64, def: &ScheduleDef, ctx: &StartContext) -> Result<bool> {
        let mut job = self
            .jobs
            .remove(&id)
            .ok_or_else(|| ChronodError::Execution(format!("no such job {id}")))?;
        if job.cmd_index + 1 >= job.cmds.len() {
            self.jobs.insert(id, job);
            return Ok(false);
        }
        job.cmd_index += 1;
        job.stdout = StreamBuf::default();
        job.stderr = StreamBuf::default();
        job.child = None;
        job.pid = None;
        let spawned = self.spawn_command(&mut job, def, ctx);
        self.jobs.insert(id, job);
        spawned?;
        Ok(true)
    }

    fn spawn_command(&mut self, job: &mut Job, def: &ScheduleDef, ctx: &StartContext) -> Result<()> {
        let cmdline = &job.cmds[job.cmd_index];
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(cmdline)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &def.dir {
            command.current_dir(dir);
        }
        for (k, v) in &def.env {
            command.env(k, v);
        }
        if let Some(last) = &ctx.last_result {
            command.env("CHRONOD_LAST_RESULT", last);
        }
        command.env("CHRONOD_LAST_TS", ctx.last_ts.to_string());
        command.env("CHRONOD_CURR_TS", ctx.curr_ts.to_string());
        if let Some(data) = &ctx.data {
            command.env("CHRONOD_DATA", data);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ChronodError::Start(format!("spawn '{cmdline}' failed: {e}")))?;
        job.pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(job.id, OutputStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(job.id, OutputStream::Stderr, stderr);
        }
        job.child = Some(child);
        tracing::debug!(job = job.id, pid = ?job.pid, "started: {cmdline}");
        Ok(())
    }

    fn spawn_reader<R>(&self, job: u64, stream: OutputStream, mut pipe: R)
    where
        R: AsyncReadExt + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if events
                            .send(Event::JobOutput {
                                job,
                                stream,
                                data: buf[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let _ = events.send(Event::JobPipeClosed { job, stream });
        });
    }

    /// Absorb a pipe chunk. Returns the complete lines it produced, already
    /// written to the job's output file and tail.
    pub fn handle_output(&mut self, id: u64, stream: OutputStream, data: &[u8]) -> Vec<String> {
        let Some(job) = self.jobs.get_mut(&id) else {
            return Vec::new();
        };
        job.bytes_read += data.len() as u64;
        let lines = match stream {
            OutputStream::Stdout => job.stdout.absorb(data),
            OutputStream::Stderr => {
                job.stderr_seen = true;
                job.stderr.absorb(data)
            }
        };
        // A terminated job's trailing output is not a trustworthy result.
        if stream == OutputStream::Stdout && job.term_reason.is_none() {
            if let Some(last) = lines.last() {
                job.last_line = Some(last.clone());
            }
        }
        for line in &lines {
            job.push_tail(line);
        }
        let out_file = job.out_file;
        if let Some(fid) = out_file {
            for line in &lines {
                if let Err(e) = self.files.write_line(fid, line) {
                    tracing::warn!(job = id, "{e}");
                    break;
                }
            }
        }
        lines
    }

    /// Note end of file on one pipe; flush any dangling partial line.
    pub fn handle_pipe_closed(&mut self, id: u64, stream: OutputStream) -> Option<String> {
        let job = self.jobs.get_mut(&id)?;
        let rest = match stream {
            OutputStream::Stdout => job.stdout.drain_rest(),
            OutputStream::Stderr => job.stderr.drain_rest(),
        };
        let mut out_file = None;
        if let Some(line) = &rest {
            if stream == OutputStream::Stdout && job.term_reason.is_none() {
                job.last_line = Some(line.clone());
            }
            job.push_tail(line);
            out_file = job.out_file;
        }
        if let (Some(fid), Some(line)) = (out_file, &rest) {
            if let Err(e) = self.files.write_line(fid, line) {
                tracing::warn!(job = id, "{e}");
            }
        }
        rest
    }

    /// Exit statuses of any children that finished, without blocking.
    pub fn poll_exits(&mut self) -> Vec<(u64, std::process::ExitStatus)> {
        let mut done = Vec::new();
        for job in self.jobs.values_mut() {
            if let Some(child) = job.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    job.child = None;
                    done.push((job.id, status));
                }
            }
        }
        done
    }

    /// Ask a job to die. Its pending last line is no longer trustworthy.
    pub fn kill(&mut self, id: u64, reason: TermReason) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.term_reason = Some(reason);
            job.last_line = None;
            if let Some(child) = job.child.as_mut() {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job = id, "kill failed: {e}");
                }
            }
        }
    }

    /// Remove a finished job, releasing its output file reference.
    pub fn finish_job(&mut self, id: u64) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        if let Some(fid) = job.out_file {
            self.files.release(fid);
        }
        Some(job)
    }

    /// Install a job record with no child process attached.
    #[cfg(test)]
    pub(crate) fn insert_stub_job(&mut self, id: u64, key: ScheduleKey, started_at: i64) {
        self.next_job_id = self.next_job_id.max(id);
        let mut job = stub_job(id, key);
        job.started_at = started_at;
        self.jobs.insert(id, job);
    }
}

#[cfg(test)]
pub(crate) fn stub_job(id: u64, key: ScheduleKey) -> Job {
    Job {
        id,
        key,
        cmd_index: 0,
        cmds: vec!["true".into()],
        child: None,
        pid: None,
        trigger_ts: 0,
        started_at: 0,
        triggered: false,
        data: None,
        stdout: StreamBuf::default(),
        stderr: StreamBuf::default(),
        last_line: None,
        bytes_read: 0,
        stderr_seen: false,
        tail: Vec::new(),
        out_file: None,
        monitors: Vec::new(),
        alerted: false,
        term_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_splits_complete_lines() {
        let mut buf = StreamBuf::default();
        assert!(buf.absorb(b"hel").is_empty());
        assert_eq!(buf.absorb(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(buf.absorb(b"ld\nrest\n"), vec!["world".to_string(), "rest".to_string()]);
        assert!(buf.drain_rest().is_none());
    }

    #[test]
    fn test_absorb_force_flushes_oversized_partial() {
        let mut buf = StreamBuf::default();
        let chunk = vec![b'x'; LINE_FLUSH_LIMIT + 10];
        let lines = buf.absorb(&chunk);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), LINE_FLUSH_LIMIT + 10);
        assert!(buf.pending.is_empty());
    }

    #[test]
    fn test_drain_rest_returns_partial() {
        let mut buf = StreamBuf::default();
        buf.absorb(b"no newline");
        assert_eq!(buf.drain_rest().as_deref(), Some("no newline"));
        assert!(buf.closed);
    }

    #[test]
    fn test_tail_trims_at_line_boundary() {
        let mut job = stub_job(1, ScheduleKey::new("u", "s"));
        let line = "y".repeat(1000);
        for _ in 0..100 {
            job.push_tail(&line);
        }
        assert!(job.tail.len() <= TAIL_CAP);
        // Trimmed tail still starts at a line boundary.
        assert_eq!(job.tail[1000], b'\n');
    }

    #[test]
    fn test_file_table_reuses_open_path() {
        let mut table = FileTable::default();
        let path = std::env::temp_dir().join(format!(
            "chronod-filetable-{}-{}.log",
            std::process::id(),
            rand::random::<u32>()
        ));
        let first = table.open(&path).unwrap();
        table.write_line(first, "from the first run").unwrap();

        // A second opener of the same path shares the handle rather than
        // truncating what the first run already wrote.
        let second = table.open(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.refcount(first), Some(2));
        table.write_line(second, "from the second run").unwrap();

        table.release(first);
        assert_eq!(table.refcount(first), Some(1));
        table.release(second);
        assert!(table.refcount(first).is_none());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("from the first run"));
        assert!(contents.contains("from the second run"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_killed_job_keeps_no_result_line() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sup = ProcessSupervisor::new(tx);
        sup.insert_stub_job(1, ScheduleKey::new("u", "s"), 0);
        sup.handle_output(1, OutputStream::Stdout, b"{\"success\":true}\n");
        assert!(sup.job(1).unwrap().last_line.is_some());

        sup.kill(1, TermReason::Output);
        assert!(sup.job(1).unwrap().last_line.is_none());

        // Output still queued in the pipe when the kill landed must not be
        // adopted as a result, complete or partial.
        sup.handle_output(1, OutputStream::Stdout, b"{\"schedule\":false}\n{\"succ");
        sup.handle_pipe_closed(1, OutputStream::Stdout);
        assert!(sup.job(1).unwrap().last_line.is_none());
    }

    #[test]
    fn test_term_reason_codes() {
        assert_eq!(TermReason::Runtime.code(), "process_term_alert");
        assert_eq!(TermReason::Output.code(), "process_term_output");
    }
}
