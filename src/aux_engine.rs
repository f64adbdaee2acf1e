//! Helper engine actor.
//!
//! Each helper is an external UCI engine owned by exactly one auxiliary
//! worker. The worker talks to it through an [`EngineHandle`]: output lines
//! arrive on a channel fed by a reader thread, input goes through the shared
//! [`EngineControl`], which is also what the search controller uses to send
//! a cancelling `stop`. The control tracks whether a query is running so that
//! `stop` reaches a helper at most once per query.
//!
//! ## Protocol
//!
//! - startup: `setoption name K value V` for each configured option, then
//!   `uci` ... `uciok`; `SyzygyPath` is forwarded when the helper offers it
//! - query: `position fen <FEN>`, `go movetime <ms>` or `go infinite`, then
//!   `info ... depth d ... nodes n ... pv m1 m2 ...` lines until `bestmove`
//! - `bestmove info ...` is a known corruption of the helper's output; it is
//!   answered with `stop` and reading continues

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, trace, warn};

use crate::constants::{CANCEL_POLL, QUIT_GRACE, STOP_DRAIN_TIMEOUT};
use crate::error::EngineError;
use crate::locks::{EngineIoLock, LockAfter, LockLevel, LockToken, OrderedMutex};

// =============================================================================
// Info lines
// =============================================================================

/// The fields of an `info` line the helper pool cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoLine {
    pub depth: u32,
    pub nodes: u64,
    pub pv: Vec<String>,
}

impl InfoLine {
    /// Parse an `info` line. Returns `None` for other lines and `info string`.
    pub fn parse(line: &str) -> Option<InfoLine> {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("info") {
            return None;
        }
        let mut info = InfoLine::default();
        while let Some(token) = tokens.next() {
            match token {
                "string" => return None,
                "depth" => info.depth = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0),
                "nodes" => info.nodes = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0),
                "pv" => {
                    info.pv = tokens.by_ref().map(str::to_string).collect();
                }
                _ => {}
            }
        }
        Some(info)
    }

    pub fn has_pv(&self) -> bool {
        !self.pv.is_empty()
    }
}

// =============================================================================
// Input side
// =============================================================================

/// `Write` adapter that forwards complete lines to a channel.
pub struct LineSender {
    tx: Sender<String>,
    pending: Vec<u8>,
}

impl LineSender {
    pub fn new(tx: Sender<String>) -> Self {
        Self { tx, pending: Vec::new() }
    }
}

impl Write for LineSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending).trim_end_matches('\r').to_string();
                self.pending.clear();
                self.tx
                    .send(line)
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "line receiver gone"))?;
            } else {
                self.pending.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct EngineInput {
    writer: Box<dyn Write + Send>,
    /// True while no query runs or once `stop` was sent for the current one.
    stopped: bool,
}

/// Input stream of one helper plus its stop bookkeeping.
pub struct EngineControl {
    index: usize,
    input: OrderedMutex<EngineIoLock, EngineInput>,
}

impl EngineControl {
    fn new(index: usize, writer: Box<dyn Write + Send>) -> Self {
        Self {
            index,
            input: OrderedMutex::new(EngineInput { writer, stopped: true }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn write_line(input: &mut EngineInput, index: usize, line: &str) -> Result<(), EngineError> {
        trace!("aux[{index}] <- {line}");
        writeln!(input.writer, "{line}")?;
        input.writer.flush()?;
        Ok(())
    }

    /// Send one line.
    pub fn send<H: LockLevel>(&self, token: &mut LockToken<H>, line: &str) -> Result<(), EngineError>
    where
        EngineIoLock: LockAfter<H>,
    {
        let mut input = self.input.lock(token);
        Self::write_line(&mut input, self.index, line)
    }

    /// Send the query lines and mark the helper busy.
    fn begin_query<H: LockLevel>(&self, token: &mut LockToken<H>, lines: &[String]) -> Result<(), EngineError>
    where
        EngineIoLock: LockAfter<H>,
    {
        let mut input = self.input.lock(token);
        for line in lines {
            Self::write_line(&mut input, self.index, line)?;
        }
        input.stopped = false;
        Ok(())
    }

    fn end_query<H: LockLevel>(&self, token: &mut LockToken<H>)
    where
        EngineIoLock: LockAfter<H>,
    {
        self.input.lock(token).stopped = true;
    }

    /// Send `stop` unless no query runs or it was already sent.
    ///
    /// Returns true if this call sent it.
    pub fn stop_once<H: LockLevel>(&self, token: &mut LockToken<H>) -> Result<bool, EngineError>
    where
        EngineIoLock: LockAfter<H>,
    {
        let mut input = self.input.lock(token);
        if input.stopped {
            return Ok(false);
        }
        input.stopped = true;
        Self::write_line(&mut input, self.index, "stop")?;
        Ok(true)
    }

    /// True while a query runs and `stop` has not been sent.
    pub fn is_busy<H: LockLevel>(&self, token: &mut LockToken<H>) -> bool
    where
        EngineIoLock: LockAfter<H>,
    {
        !self.input.lock(token).stopped
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Time limit of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoLimit {
    MoveTime(Duration),
    Infinite,
}

impl GoLimit {
    fn command(self) -> String {
        match self {
            GoLimit::MoveTime(time) => format!("go movetime {}", time.as_millis().max(1)),
            GoLimit::Infinite => "go infinite".to_string(),
        }
    }
}

/// How a query ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Finished normally; the last `info` line that carried a PV.
    Completed(String),
    /// Finished without any PV.
    Empty,
    /// Cancelled; output was drained and the result discarded.
    Cancelled,
}

enum Process {
    Child(Child),
    Thread(JoinHandle<()>),
}

/// A running helper engine, owned by one auxiliary worker.
pub struct EngineHandle {
    index: usize,
    control: Arc<EngineControl>,
    lines: Receiver<String>,
    process: Option<Process>,
}

impl EngineHandle {
    /// Start `path` as a child process with piped stdin/stdout.
    pub fn spawn(index: usize, path: &Path, args: &[String]) -> Result<Self, EngineError> {
        let spawn_error = |source: io::Error| EngineError::Spawn {
            path: path.to_path_buf(),
            source,
        };
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(&spawn_error)?;
        let missing = |what: &str| spawn_error(io::Error::new(io::ErrorKind::BrokenPipe, format!("no {what}")));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name(format!("aux-reader-{index}"))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(EngineError::Io)?;

        debug!("aux[{index}] spawned {}", path.display());
        Ok(Self {
            index,
            control: Arc::new(EngineControl::new(index, Box::new(io::BufWriter::new(stdin)))),
            lines: rx,
            process: Some(Process::Child(child)),
        })
    }

    /// Run an engine on a thread of this process, talking over channels.
    ///
    /// `engine` receives the lines written to the helper and a writer for its
    /// output. Used by tests and by embedders with in-process helpers.
    pub fn in_process<F>(index: usize, engine: F) -> Result<Self, EngineError>
    where
        F: FnOnce(Receiver<String>, LineSender) + Send + 'static,
    {
        let (to_engine, engine_input) = unbounded();
        let (engine_output, from_engine) = unbounded();
        let thread = thread::Builder::new()
            .name(format!("aux-inproc-{index}"))
            .spawn(move || engine(engine_input, LineSender::new(engine_output)))
            .map_err(EngineError::Io)?;
        Ok(Self {
            index,
            control: Arc::new(EngineControl::new(index, Box::new(LineSender::new(to_engine)))),
            lines: from_engine,
            process: Some(Process::Thread(thread)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Shared input side, for sending `stop` from other threads.
    pub fn control(&self) -> Arc<EngineControl> {
        Arc::clone(&self.control)
    }

    pub fn is_running(&mut self) -> bool {
        match &mut self.process {
            Some(Process::Child(child)) => matches!(child.try_wait(), Ok(None)),
            Some(Process::Thread(thread)) => !thread.is_finished(),
            None => false,
        }
    }

    fn recv_until(&self, deadline: Instant) -> Result<Option<String>, EngineError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.lines.recv_timeout(remaining.min(CANCEL_POLL)) {
            Ok(line) => {
                trace!("aux[{}] -> {line}", self.index);
                Ok(Some(line))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Died { index: self.index }),
        }
    }

    /// Configure the helper and complete the `uci` handshake.
    pub fn start<H: LockLevel>(
        &mut self,
        token: &mut LockToken<H>,
        options: &[(String, String)],
        syzygy_path: Option<&str>,
        timeout: Duration,
    ) -> Result<(), EngineError>
    where
        EngineIoLock: LockAfter<H>,
    {
        for (name, value) in options {
            self.control.send(token, &format!("setoption name {name} value {value}"))?;
        }
        self.control.send(token, "uci")?;
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::HandshakeTimeout { index: self.index });
            }
            let Some(line) = self.recv_until(deadline)? else {
                continue;
            };
            let line = line.trim();
            if line == "uciok" {
                debug!("aux[{}] ready", self.index);
                return Ok(());
            }
            if line.starts_with("option name SyzygyPath") {
                if let Some(path) = syzygy_path {
                    self.control.send(token, &format!("setoption name SyzygyPath value {path}"))?;
                }
            }
        }
    }

    /// Analyze `fen` until the helper answers `bestmove`.
    ///
    /// `cancel` is polled while waiting; once it is set, `stop` is sent (at
    /// most once) and output is drained up to `bestmove` before returning
    /// [`QueryOutcome::Cancelled`]. Lines carrying a PV are passed to
    /// `on_info` as they arrive, until cancellation; no lock is held during
    /// the callback.
    pub fn query<H: LockLevel>(
        &mut self,
        token: &mut LockToken<H>,
        fen: &str,
        limit: GoLimit,
        cancel: &AtomicBool,
        on_info: &mut dyn FnMut(&mut LockToken<H>, &str, &InfoLine),
    ) -> Result<QueryOutcome, EngineError>
    where
        EngineIoLock: LockAfter<H>,
    {
        self.control
            .begin_query(token, &[format!("position fen {fen}"), limit.command()])?;
        let mut last_pv_line = None;
        let mut drain_deadline: Option<Instant> = None;
        loop {
            if drain_deadline.is_none() && cancel.load(Ordering::Acquire) {
                self.control.stop_once(token)?;
                drain_deadline = Some(Instant::now() + STOP_DRAIN_TIMEOUT);
            }
            let deadline = match drain_deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(EngineError::Unresponsive { index: self.index });
                }
                Some(deadline) => deadline,
                None => Instant::now() + CANCEL_POLL,
            };
            let Some(line) = self.recv_until(deadline)? else {
                continue;
            };
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("bestmove") => {
                    if tokens.next() == Some("info") {
                        warn!("aux[{}] sent a corrupted bestmove line, sending stop", self.index);
                        self.control.send(token, "stop")?;
                        continue;
                    }
                    break;
                }
                Some("info") => {
                    if let Some(info) = InfoLine::parse(&line).filter(InfoLine::has_pv) {
                        if drain_deadline.is_none() {
                            on_info(token, &line, &info);
                        }
                        last_pv_line = Some(line);
                    }
                }
                _ => {}
            }
        }
        self.control.end_query(token);

        if drain_deadline.is_some() {
            return Ok(QueryOutcome::Cancelled);
        }
        let Some(line) = last_pv_line else {
            return Ok(QueryOutcome::Empty);
        };
        if !self.is_running() {
            return Err(EngineError::Died { index: self.index });
        }
        Ok(QueryOutcome::Completed(line))
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        match LockToken::try_new() {
            Some(mut token) => {
                let _ = self.control.send(&mut token, "quit");
            }
            None => warn!("aux[{}] dropped while a lock is held, not sending quit", self.index),
        }
        match self.process.take() {
            Some(Process::Child(mut child)) => {
                let deadline = Instant::now() + QUIT_GRACE;
                while Instant::now() < deadline {
                    if !matches!(child.try_wait(), Ok(None)) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                debug!("aux[{}] ignored quit, killing it", self.index);
                let _ = child.kill();
                let _ = child.wait();
            }
            // The engine thread ends when its input channel closes.
            Some(Process::Thread(_)) | None => {}
        }
    }
}
