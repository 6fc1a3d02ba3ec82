//! Per-fd I/O dispatchers for child pipes.
//!
//! Each pipe end the supervisor holds is serviced by exactly one
//! dispatcher. Output dispatchers drain child stdout/stderr, scan for
//! communication capture tokens and feed log sinks; the input
//! dispatcher flushes queued stdin bytes when the pipe is writable.
//! Dispatchers never own their fds; the owning [`ProcessPipes`] closes
//! them when the process is reaped.
//!
//! [`ProcessPipes`]: crate::pipes::ProcessPipes

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::path::PathBuf;

use tracing::{debug, error, trace};

use crate::config::LogConfig;
use crate::events::{Channel, Event, EventBus, CAPTURE_BEGIN_TOKEN, CAPTURE_END_TOKEN};
use crate::fds::{read_fd, write_fd};

/// Common surface of the input and output dispatchers.
pub trait FdDispatcher {
    fn fd(&self) -> RawFd;
    fn channel(&self) -> Channel;
    /// Wants readiness-to-read notifications.
    fn readable(&self) -> bool;
    /// Wants readiness-to-write notifications.
    fn writable(&self) -> bool;
    fn on_readable(&mut self) -> io::Result<()>;
    fn on_writable(&mut self) -> io::Result<()>;
    /// Stop servicing the fd. The fd itself stays open until its
    /// owning pipe set is dropped.
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

/// Append-mode log sink for one child output channel.
#[derive(Debug)]
pub struct ChildLog {
    path: PathBuf,
    file: Option<File>,
}

impl ChildLog {
    pub fn new(path: PathBuf) -> Self {
        ChildLog { path, file: None }
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    pub fn write(&mut self, data: &[u8]) {
        let path = self.path.clone();
        match self.open().and_then(|file| file.write_all(data)) {
            Ok(()) => {}
            Err(err) => error!("failed to write child log {}: {err}", path.display()),
        }
    }

    /// Close and lazily reopen, for log rotation via SIGUSR2.
    pub fn reopen(&mut self) {
        self.file.take();
    }

    /// Close and delete the log file.
    pub fn remove(&mut self) {
        self.file.take();
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                error!("failed to remove child log {}: {err}", self.path.display());
            }
        }
    }
}

/// Drains one child output pipe (stdout or stderr).
pub struct OutputDispatcher {
    process: String,
    group: String,
    pid: i32,
    channel: Channel,
    fd: RawFd,
    bus: EventBus,
    log: Option<ChildLog>,
    events_enabled: bool,
    capture_events: bool,
    strip_ansi: bool,
    /// Undispatched bytes, at most one partial capture token long when
    /// capture scanning is on.
    output_buffer: Vec<u8>,
    /// True between a begin and end token.
    capture_mode: bool,
    capture_buffer: Vec<u8>,
    closed: bool,
}

impl OutputDispatcher {
    pub fn new(
        process: &str,
        group: &str,
        pid: i32,
        channel: Channel,
        fd: RawFd,
        log_config: &LogConfig,
        strip_ansi: bool,
        bus: EventBus,
    ) -> Self {
        OutputDispatcher {
            process: process.to_string(),
            group: group.to_string(),
            pid,
            channel,
            fd,
            bus,
            log: log_config.file.clone().map(ChildLog::new),
            events_enabled: log_config.events_enabled,
            capture_events: log_config.capture_events,
            strip_ansi,
            output_buffer: Vec::new(),
            capture_mode: false,
            capture_buffer: Vec::new(),
            closed: false,
        }
    }

    /// Feed bytes read from the pipe through token scanning and on to
    /// the log sinks. An empty slice means the child closed its end.
    pub fn ingest(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.close();
            return;
        }
        self.output_buffer.extend_from_slice(data);
        self.record_output();
    }

    fn record_output(&mut self) {
        if !self.capture_events {
            let data = std::mem::take(&mut self.output_buffer);
            self.log_output(&data);
            return;
        }
        loop {
            let token: &[u8] = if self.capture_mode {
                CAPTURE_END_TOKEN
            } else {
                CAPTURE_BEGIN_TOKEN
            };
            match find_subsequence(&self.output_buffer, token) {
                Some(index) => {
                    let mut chunk: Vec<u8> =
                        self.output_buffer.drain(..index + token.len()).collect();
                    chunk.truncate(index);
                    self.emit_chunk(&chunk);
                    self.toggle_capture_mode();
                }
                None => {
                    // A token may be split across reads; keep the
                    // longest token prefix ending the buffer.
                    let keep = partial_token_at_end(&self.output_buffer, token);
                    let chunk: Vec<u8> =
                        self.output_buffer.drain(..self.output_buffer.len() - keep).collect();
                    self.emit_chunk(&chunk);
                    return;
                }
            }
        }
    }

    fn emit_chunk(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.capture_mode {
            self.capture_buffer.extend_from_slice(data);
        } else {
            self.log_output(data);
        }
    }

    fn toggle_capture_mode(&mut self) {
        if self.capture_mode {
            let data = std::mem::take(&mut self.capture_buffer);
            trace!(
                "{}:{} sent a communication event of {} bytes",
                self.process,
                self.channel,
                data.len()
            );
            self.bus.post(Event::ProcessCommunication {
                process: self.process.clone(),
                group: self.group.clone(),
                pid: self.pid,
                channel: self.channel,
                data,
            });
        }
        self.capture_mode = !self.capture_mode;
    }

    fn log_output(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let data: Vec<u8> = if self.strip_ansi {
            strip_escapes(data)
        } else {
            data.to_vec()
        };
        if let Some(log) = self.log.as_mut() {
            log.write(&data);
        }
        trace!(
            "{} {} output:\n{}",
            self.process,
            self.channel,
            String::from_utf8_lossy(&data)
        );
        if self.events_enabled {
            self.bus.post(Event::ProcessLog {
                process: self.process.clone(),
                group: self.group.clone(),
                pid: self.pid,
                channel: self.channel,
                data,
            });
        }
    }

    pub fn reopen_log(&mut self) {
        if let Some(log) = self.log.as_mut() {
            log.reopen();
        }
    }

    pub fn remove_log(&mut self) {
        if let Some(log) = self.log.as_mut() {
            log.remove();
        }
    }
}

impl FdDispatcher for OutputDispatcher {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn readable(&self) -> bool {
        !self.closed
    }

    fn writable(&self) -> bool {
        false
    }

    fn on_readable(&mut self) -> io::Result<()> {
        let data = read_fd(self.fd)?;
        self.ingest(&data);
        Ok(())
    }

    fn on_writable(&mut self) -> io::Result<()> {
        debug!("unexpected writable notification for {}:{}", self.process, self.channel);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            // Flush anything held back as a potential partial token.
            let data = std::mem::take(&mut self.output_buffer);
            self.emit_chunk(&data);
            self.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for OutputDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDispatcher")
            .field("process", &self.process)
            .field("channel", &self.channel)
            .field("fd", &self.fd)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Flushes queued bytes into the child's stdin pipe.
#[derive(Debug)]
pub struct InputDispatcher {
    process: String,
    fd: RawFd,
    input_buffer: Vec<u8>,
    closed: bool,
}

impl InputDispatcher {
    pub fn new(process: &str, fd: RawFd) -> Self {
        InputDispatcher {
            process: process.to_string(),
            fd,
            input_buffer: Vec::new(),
            closed: false,
        }
    }

    /// Queue bytes for delivery on the next writable notification.
    pub fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"));
        }
        self.input_buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let sent = write_fd(self.fd, &self.input_buffer)?;
        self.input_buffer.drain(..sent);
        Ok(())
    }
}

impl FdDispatcher for InputDispatcher {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn channel(&self) -> Channel {
        Channel::Stdin
    }

    fn readable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        !self.input_buffer.is_empty() && !self.closed
    }

    fn on_readable(&mut self) -> io::Result<()> {
        debug!("unexpected readable notification for {} stdin", self.process);
        Ok(())
    }

    fn on_writable(&mut self) -> io::Result<()> {
        match self.flush() {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(nix::libc::EPIPE) => {
                debug!("failed write to process {:?} stdin: broken pipe", self.process);
                self.input_buffer.clear();
                self.close();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A process's dispatchers, one per open pipe end.
#[derive(Debug)]
pub enum Dispatcher {
    Output(OutputDispatcher),
    Input(InputDispatcher),
}

impl Dispatcher {
    pub fn as_input_mut(&mut self) -> Option<&mut InputDispatcher> {
        match self {
            Dispatcher::Input(input) => Some(input),
            Dispatcher::Output(_) => None,
        }
    }

    pub fn reopen_log(&mut self) {
        if let Dispatcher::Output(output) = self {
            output.reopen_log();
        }
    }

    pub fn remove_log(&mut self) {
        if let Dispatcher::Output(output) = self {
            output.remove_log();
        }
    }
}

impl FdDispatcher for Dispatcher {
    fn fd(&self) -> RawFd {
        match self {
            Dispatcher::Output(d) => d.fd(),
            Dispatcher::Input(d) => d.fd(),
        }
    }

    fn channel(&self) -> Channel {
        match self {
            Dispatcher::Output(d) => d.channel(),
            Dispatcher::Input(d) => d.channel(),
        }
    }

    fn readable(&self) -> bool {
        match self {
            Dispatcher::Output(d) => d.readable(),
            Dispatcher::Input(d) => d.readable(),
        }
    }

    fn writable(&self) -> bool {
        match self {
            Dispatcher::Output(d) => d.writable(),
            Dispatcher::Input(d) => d.writable(),
        }
    }

    fn on_readable(&mut self) -> io::Result<()> {
        match self {
            Dispatcher::Output(d) => d.on_readable(),
            Dispatcher::Input(d) => d.on_readable(),
        }
    }

    fn on_writable(&mut self) -> io::Result<()> {
        match self {
            Dispatcher::Output(d) => d.on_writable(),
            Dispatcher::Input(d) => d.on_writable(),
        }
    }

    fn close(&mut self) {
        match self {
            Dispatcher::Output(d) => d.close(),
            Dispatcher::Input(d) => d.close(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Dispatcher::Output(d) => d.is_closed(),
            Dispatcher::Input(d) => d.is_closed(),
        }
    }
}

/// The dispatchers of one process, keyed by fd.
pub type DispatcherMap = HashMap<RawFd, Dispatcher>;

/// First occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Length of the longest proper prefix of `token` that ends `data`.
fn partial_token_at_end(data: &[u8], token: &[u8]) -> usize {
    let max = token.len().saturating_sub(1).min(data.len());
    for len in (1..=max).rev() {
        if data[data.len() - len..] == token[..len] {
            return len;
        }
    }
    0
}

/// Characters terminating an ANSI escape sequence.
const ANSI_TERMINATORS: &[u8] = b"HfABCDRsuJKhlpm";

/// Remove ANSI escape sequences from child output.
pub fn strip_escapes(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut show = true;
    for &byte in data {
        if show {
            if byte == 0x1b {
                show = false;
            } else {
                result.push(byte);
            }
        } else if ANSI_TERMINATORS.contains(&byte) {
            show = true;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn output_dispatcher(log_config: &LogConfig, bus: EventBus) -> OutputDispatcher {
        OutputDispatcher::new("cat", "default", 100, Channel::Stdout, -1, log_config, false, bus)
    }

    fn collect_events(bus: &EventBus) -> Rc<RefCell<Vec<Event>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    #[test]
    fn test_strip_escapes() {
        assert_eq!(strip_escapes(b"plain text"), b"plain text");
        assert_eq!(strip_escapes(b"\x1b[31mred\x1b[0m"), b"red");
        assert_eq!(strip_escapes(b"a\x1b[2Jb"), b"ab");
    }

    #[test]
    fn test_find_subsequence() {
        assert_eq!(find_subsequence(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subsequence(b"abcdef", b"xy"), None);
        assert_eq!(find_subsequence(b"ab", b"abc"), None);
    }

    #[test]
    fn test_partial_token_at_end() {
        assert_eq!(partial_token_at_end(b"data<!--XSUP", b"<!--XSUPERVISOR:BEGIN-->"), 8);
        assert_eq!(partial_token_at_end(b"data", b"<!--XSUPERVISOR:BEGIN-->"), 0);
    }

    #[test]
    fn test_capture_tokens_produce_communication_event() {
        let bus = EventBus::new();
        let events = collect_events(&bus);
        let log_config = LogConfig {
            capture_events: true,
            ..LogConfig::default()
        };
        let mut dispatcher = output_dispatcher(&log_config, bus);

        dispatcher.ingest(b"before<!--XSUPERVISOR:BEGIN-->payload<!--XSUPERVISOR:END-->after");

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ProcessCommunication { process, channel, data, .. } => {
                assert_eq!(process, "cat");
                assert_eq!(*channel, Channel::Stdout);
                assert_eq!(data, b"payload");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_capture_token_split_across_reads() {
        let bus = EventBus::new();
        let events = collect_events(&bus);
        let log_config = LogConfig {
            capture_events: true,
            ..LogConfig::default()
        };
        let mut dispatcher = output_dispatcher(&log_config, bus);

        dispatcher.ingest(b"<!--XSUPERVISOR");
        dispatcher.ingest(b":BEGIN-->hello<!--XSUPERV");
        dispatcher.ingest(b"ISOR:END-->");

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ProcessCommunication { data, .. } => assert_eq!(data, b"hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_output_events_posted_when_enabled() {
        let bus = EventBus::new();
        let events = collect_events(&bus);
        let log_config = LogConfig {
            events_enabled: true,
            ..LogConfig::default()
        };
        let mut dispatcher = output_dispatcher(&log_config, bus);

        dispatcher.ingest(b"one line of output\n");

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ProcessLog { data, channel, .. } => {
                assert_eq!(data, b"one line of output\n");
                assert_eq!(*channel, Channel::Stdout);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_empty_read_closes_and_flushes() {
        let bus = EventBus::new();
        let events = collect_events(&bus);
        let log_config = LogConfig {
            events_enabled: true,
            capture_events: true,
            ..LogConfig::default()
        };
        let mut dispatcher = output_dispatcher(&log_config, bus);

        // Tail held back as a potential partial token must still be
        // logged when the pipe hits EOF.
        dispatcher.ingest(b"tail<!--XSUP");
        dispatcher.ingest(b"");

        assert!(dispatcher.is_closed());
        let events = events.borrow();
        let logged: Vec<u8> = events
            .iter()
            .filter_map(|event| match event {
                Event::ProcessLog { data, .. } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(logged, b"tail<!--XSUP");
    }

    #[test]
    fn test_child_log_written_and_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat-stdout.log");
        let bus = EventBus::new();
        let log_config = LogConfig {
            file: Some(path.clone()),
            ..LogConfig::default()
        };
        let mut dispatcher = output_dispatcher(&log_config, bus);

        dispatcher.ingest(b"first\n");
        dispatcher.reopen_log();
        dispatcher.ingest(b"second\n");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_child_log_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat-stdout.log");
        let bus = EventBus::new();
        let log_config = LogConfig {
            file: Some(path.clone()),
            ..LogConfig::default()
        };
        let mut dispatcher = output_dispatcher(&log_config, bus);

        dispatcher.ingest(b"doomed\n");
        dispatcher.remove_log();
        assert!(!path.exists());
        // Removing a log that is already gone is quiet.
        dispatcher.remove_log();

        // The sink keeps working after removal.
        dispatcher.ingest(b"fresh\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn test_input_dispatcher_flushes_queue() {
        use std::os::fd::AsRawFd;

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut dispatcher = InputDispatcher::new("cat", write_end.as_raw_fd());

        assert!(!dispatcher.writable());
        dispatcher.queue(b"stdin data").unwrap();
        assert!(dispatcher.writable());

        dispatcher.on_writable().unwrap();
        assert!(!dispatcher.writable());
        let data = read_fd(read_end.as_raw_fd()).unwrap();
        assert_eq!(data, b"stdin data");
    }

    #[test]
    fn test_input_dispatcher_broken_pipe_closes() {
        use std::os::fd::AsRawFd;

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let raw = write_end.as_raw_fd();
        let mut dispatcher = InputDispatcher::new("cat", raw);
        drop(read_end);

        dispatcher.queue(b"lost").unwrap();
        dispatcher.on_writable().unwrap();
        assert!(dispatcher.is_closed());
        assert!(dispatcher.queue(b"more").is_err());
    }
}
