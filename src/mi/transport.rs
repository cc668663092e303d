use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace, warn};

use super::command::Command;
use super::record::{parse_record, AsyncKind, Record, ResultClass, StreamKind, Tuple};
use crate::error::{Error, Result};

/// Identifies a submitted command.
pub type Token = u64;

/// Tokens start here so they are easy to tell apart from other numbers in a trace.
pub const FIRST_TOKEN: Token = 1000;

/// Arguments every debugger process is started with.
pub const DEBUGGER_ARGS: [&str; 3] = ["--nx", "--quiet", "--interpreter=mi3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The reply to one command.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub token: Token,
    pub command: String,
    pub class: ResultClass,
    pub results: Tuple,
    /// Console stream output produced while the command was outstanding.
    pub console: Vec<String>,
}

impl ResultRecord {
    /// Turns an `^error` reply into an error.
    pub fn into_result(self) -> Result<ResultRecord> {
        if self.class == ResultClass::Error {
            let message = self.results.get_str("msg").unwrap_or("unknown error");
            return Err(Error::from_debugger(&self.command, message));
        }
        Ok(self)
    }

    pub fn console_text(&self) -> String {
        self.console.concat()
    }

    /// Fetches a field that must be present.
    pub fn field(&self, name: &str) -> Result<&str> {
        self.results.get_str(name).ok_or_else(|| {
            Error::Protocol(format!(
                "reply to `{}` has no `{}`: {}",
                self.command, name, self.results
            ))
        })
    }
}

/// An out-of-band record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: AsyncKind,
    pub class: String,
    pub results: Tuple,
}

impl Event {
    pub fn is_stopped(&self) -> bool {
        self.kind == AsyncKind::Exec && self.class == "stopped"
    }

    pub fn is_running(&self) -> bool {
        self.kind == AsyncKind::Exec && self.class == "running"
    }

    pub fn reason(&self) -> Option<&str> {
        self.results.get_str("reason")
    }

    pub fn is_breakpoint_hit(&self) -> bool {
        self.is_stopped() && self.reason() == Some("breakpoint-hit")
    }

    pub fn breakpoint_number(&self) -> Option<u32> {
        self.results.get_u64("bkptno").map(|n| n as u32)
    }

    /// Address of the frame the target stopped in.
    pub fn frame_address(&self) -> Option<u32> {
        self.results
            .get_tuple("frame")
            .and_then(|frame| frame.get_u64("addr"))
            .map(|addr| addr as u32)
    }

    pub fn function(&self) -> Option<&str> {
        self.results
            .get_tuple("frame")
            .and_then(|frame| frame.get_str("func"))
    }

    /// A short description for log messages.
    pub fn describe(&self) -> String {
        match (self.reason(), self.frame_address()) {
            (Some(reason), Some(addr)) => format!("{} {} at {:#010x}", self.class, reason, addr),
            (Some(reason), None) => format!("{} {}", self.class, reason),
            _ => self.class.clone(),
        }
    }
}

/// An event together with the listeners it matched, most recently registered first.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Event,
    pub listeners: Vec<ListenerId>,
}

pub enum Polled {
    Result(ResultRecord),
    Event(Delivery),
}

/// A point in time a wait gives up at.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

enum ReaderMessage {
    Record(Record),
    Malformed(String, Error),
    Closed(String),
}

struct Listener {
    id: ListenerId,
    predicate: Box<dyn Fn(&Event) -> bool>,
}

struct Pending {
    token: Token,
    command: String,
    console: Vec<String>,
}

/// The connection to one debugger process.
///
/// A reader thread parses the debugger's output and forwards every record over a channel. The
/// records are demultiplexed on the caller's thread whenever it waits for something: results are
/// matched to their command by token, events are routed to the listeners whose predicate matches.
pub struct Transport {
    writer: Box<dyn Write + Send>,
    receiver: Receiver<ReaderMessage>,
    reader: Option<JoinHandle<()>>,
    child: Option<Child>,
    next_token: Token,
    next_listener: u64,
    listeners: Vec<Listener>,
    pending: Vec<Pending>,
    completed: HashMap<Token, ResultRecord>,
    abandoned: HashSet<Token>,
    events: VecDeque<Delivery>,
    closed: Option<String>,
}

impl Transport {
    /// Starts a debugger process and connects to its machine interface.
    pub fn spawn(program: &str, extra_args: &[String]) -> Result<Transport> {
        let mut child = std::process::Command::new(program)
            .args(&DEBUGGER_ARGS)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        debug!("Started debugger `{}` with pid {}", program, child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::TransportFatal("debugger stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TransportFatal("debugger stdout not captured".to_string()))?;

        let mut transport = Transport::from_io(stdin, BufReader::new(stdout));
        transport.child = Some(child);
        Ok(transport)
    }

    /// Speaks the machine interface over any reader and writer pair.
    pub fn from_io<W, R>(writer: W, reader: R) -> Transport
    where
        W: Write + Send + 'static,
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let reader = thread::Builder::new()
            .name("mi-reader".to_string())
            .spawn(move || read_records(reader, sender))
            .ok();
        if reader.is_none() {
            error!("Could not start the debugger reader thread");
        }

        Transport {
            writer: Box::new(writer),
            receiver,
            reader,
            child: None,
            next_token: FIRST_TOKEN,
            next_listener: 0,
            listeners: vec![],
            pending: vec![],
            completed: HashMap::new(),
            abandoned: HashSet::new(),
            events: VecDeque::new(),
            closed: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Writes a command and returns the token its result will carry.
    pub fn submit(&mut self, command: &Command) -> Result<Token> {
        self.check_open()?;
        let token = self.next_token;
        self.next_token += 1;

        let text = command.to_mi();
        trace!("-> {}{}", token, text);
        let written = writeln!(self.writer, "{}{}", token, text).and_then(|_| self.writer.flush());
        if let Err(err) = written {
            return Err(self.close(format!("writing to the debugger failed: {}", err)));
        }

        self.pending.push(Pending {
            token,
            command: text,
            console: vec![],
        });
        Ok(token)
    }

    /// Waits for the result of `token`. Events read meanwhile stay queued for `poll`.
    pub fn await_result(&mut self, token: Token, timeout: Duration) -> Result<ResultRecord> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(record) = self.completed.remove(&token) {
                return Ok(record);
            }
            if let Err(err) = self.read_one(&deadline) {
                self.abandon(token, &err);
                return Err(err);
            }
        }
    }

    /// Submits a command, waits for its result and maps `^error` to an error.
    pub fn execute(&mut self, command: &Command, timeout: Duration) -> Result<ResultRecord> {
        let token = self.submit(command)?;
        self.await_result(token, timeout)?.into_result()
    }

    /// Returns the next queued event, or the result of `token` once it arrived.
    ///
    /// Events always come first, so a stop that arrived before a result is handled before the
    /// result is returned.
    pub fn poll(&mut self, token: Option<Token>, deadline: &Deadline) -> Result<Polled> {
        loop {
            if let Some(delivery) = self.events.pop_front() {
                return Ok(Polled::Event(delivery));
            }
            if let Some(token) = token {
                if let Some(record) = self.completed.remove(&token) {
                    return Ok(Polled::Result(record));
                }
            }
            if let Err(err) = self.read_one(deadline) {
                if let Some(token) = token {
                    self.abandon(token, &err);
                }
                return Err(err);
            }
        }
    }

    /// Registers interest in events. Later listeners see events first.
    pub fn subscribe<F>(&mut self, predicate: F) -> ListenerId
    where
        F: Fn(&Event) -> bool + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push(Listener {
            id,
            predicate: Box::new(predicate),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        for delivery in self.events.iter_mut() {
            delivery.listeners.retain(|l| *l != id);
        }
        before != self.listeners.len()
    }

    /// Asks the debugger to exit and reaps the process.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        if self.closed.is_none() {
            let token = self.submit(&Command::Exit)?;
            match self.await_result(token, timeout) {
                Ok(_) | Err(Error::TransportFatal(_)) => (),
                Err(err) => warn!("Debugger did not acknowledge exit: {}", err),
            }
            self.closed = Some("session shut down".to_string());
        }
        if let Some(mut child) = self.child.take() {
            let deadline = Deadline::after(timeout);
            loop {
                match child.try_wait()? {
                    Some(status) => {
                        debug!("Debugger exited with {}", status);
                        break;
                    }
                    None if deadline.remaining() == Duration::from_secs(0) => {
                        warn!("Debugger did not exit, killing it");
                        child.kill()?;
                        child.wait()?;
                        break;
                    }
                    None => thread::sleep(Duration::from_millis(10)),
                }
            }
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        match &self.closed {
            Some(reason) => Err(Error::TransportFatal(reason.clone())),
            None => Ok(()),
        }
    }

    fn close(&mut self, reason: String) -> Error {
        error!("Debugger connection lost: {}", reason);
        for pending in self.pending.drain(..) {
            debug!("Dropping `{}` ({})", pending.command, pending.token);
        }
        self.closed = Some(reason.clone());
        Error::TransportFatal(reason)
    }

    fn abandon(&mut self, token: Token, err: &Error) {
        if let Error::Timeout(_) = err {
            if let Some(index) = self.pending.iter().position(|p| p.token == token) {
                let pending = self.pending.remove(index);
                warn!("Gave up waiting for `{}` ({})", pending.command, token);
                self.abandoned.insert(token);
            }
        }
    }

    fn read_one(&mut self, deadline: &Deadline) -> Result<()> {
        self.check_open()?;
        match self.receiver.recv_timeout(deadline.remaining()) {
            Ok(ReaderMessage::Record(record)) => {
                self.handle_record(record);
                Ok(())
            }
            Ok(ReaderMessage::Malformed(line, err)) => {
                warn!("Skipping malformed record `{}`: {}", line.trim_end(), err);
                Ok(())
            }
            Ok(ReaderMessage::Closed(reason)) => Err(self.close(reason)),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(deadline.timeout())),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.close("debugger reader stopped".to_string()))
            }
        }
    }

    fn handle_record(&mut self, record: Record) {
        match record {
            Record::Result {
                token: Some(token),
                class,
                results,
            } => {
                if let Some(index) = self.pending.iter().position(|p| p.token == token) {
                    let pending = self.pending.remove(index);
                    self.completed.insert(
                        token,
                        ResultRecord {
                            token,
                            command: pending.command,
                            class,
                            results,
                            console: pending.console,
                        },
                    );
                } else if self.abandoned.remove(&token) {
                    warn!("Discarding late {:?} result for {}", class, token);
                } else {
                    warn!("Discarding result for unknown token {}", token);
                }
            }
            Record::Result {
                token: None,
                class,
                results,
            } => {
                warn!("Discarding untagged {:?} result {}", class, results);
            }
            Record::Async {
                kind,
                class,
                results,
                ..
            } => {
                let event = Event {
                    kind,
                    class,
                    results,
                };
                let listeners: Vec<ListenerId> = self
                    .listeners
                    .iter()
                    .rev()
                    .filter(|l| (l.predicate)(&event))
                    .map(|l| l.id)
                    .collect();
                if listeners.is_empty() {
                    if kind == AsyncKind::Exec {
                        warn!("No listener for {}, dropped", event.describe());
                    } else {
                        debug!("No listener for {}, dropped", event.describe());
                    }
                } else {
                    self.events.push_back(Delivery { event, listeners });
                }
            }
            Record::Stream { kind, text } => match kind {
                StreamKind::Console => match self.pending.last_mut() {
                    Some(pending) => pending.console.push(text),
                    None => debug!("console: {}", text.trim_end()),
                },
                StreamKind::Target => debug!("target: {}", text.trim_end()),
                StreamKind::Log => trace!("log: {}", text.trim_end()),
            },
            Record::Prompt => (),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        // The reader thread ends on its own once the debugger's output closes.
        drop(self.reader.take());
    }
}

fn read_records<R: BufRead>(mut reader: R, sender: Sender<ReaderMessage>) {
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let message = match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => {
                let _ = sender.send(ReaderMessage::Closed(
                    "debugger closed its output".to_string(),
                ));
                return;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer).into_owned();
                trace!("<- {}", line.trim_end());
                match parse_record(&line) {
                    Ok(Some(record)) => ReaderMessage::Record(record),
                    Ok(None) => continue,
                    Err(err) => ReaderMessage::Malformed(line, err),
                }
            }
            Err(err) => {
                let _ = sender.send(ReaderMessage::Closed(format!(
                    "reading from the debugger failed: {}",
                    err
                )));
                return;
            }
        };
        if sender.send(message).is_err() {
            return;
        }
    }
}
