//! Device sessions
//!
//! The engine talks to devices only through [`DeviceSession`]. Two
//! implementations ship with the crate: [`ScriptedSession`], which replays
//! canned responses, and [`ShellSession`], which drives a local `sh`
//! process as if it were a device CLI.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command as ProcessCommand, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;

use crate::error::{RuntimeError, RuntimeErrorKind};

/// Errors reported by a device session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("invalid pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },
    #[error("connection refused: {0}")]
    Refused(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<SessionError> for RuntimeError {
    fn from(e: SessionError) -> Self {
        let kind = match e {
            SessionError::Pattern { .. } => RuntimeErrorKind::Usage,
            _ => RuntimeErrorKind::Session,
        };
        RuntimeError::new(kind, e.to_string())
    }
}

/// Outcome of an `expect` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectMatch {
    pub matched: bool,
    /// First capture group, or the whole match when the pattern has none
    pub captured: String,
}

impl ExpectMatch {
    pub fn miss() -> Self {
        Self::default()
    }
}

/// One live CLI connection to a device
pub trait DeviceSession: Send {
    fn connect(&mut self) -> Result<(), SessionError>;

    fn disconnect(&mut self) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;

    /// Send `command` to the device. Returns whatever output is available
    /// once the command has been sent.
    fn execute(&mut self, command: &str) -> Result<String, SessionError>;

    /// Wait up to `timeout` for `pattern` to appear in the output received
    /// so far. With `clear_on_match`, output up to the end of the match is
    /// discarded so later waits do not see it again.
    fn expect(
        &mut self,
        pattern: &str,
        timeout: Duration,
        clear_on_match: bool,
    ) -> Result<ExpectMatch, SessionError>;
}

/// Compile an expect pattern. `^` and `$` match at line boundaries.
pub fn compile_pattern(pattern: &str) -> Result<Regex, SessionError> {
    regex::RegexBuilder::new(&format!("(?m){}", pattern))
        .size_limit(1 << 20)
        .build()
        .map_err(|e| SessionError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

/// Accumulated device output
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
}

impl OutputBuffer {
    pub fn push(&mut self, output: &str) {
        self.text.push_str(output);
    }

    pub fn contents(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Look for `re`, optionally consuming output through the match.
    pub fn take_match(&mut self, re: &Regex, clear: bool) -> Option<ExpectMatch> {
        let (captured, end) = {
            let caps = re.captures(&self.text)?;
            let whole = caps.get(0)?;
            let captured = caps.get(1).unwrap_or(whole).as_str().to_string();
            (captured, whole.end())
        };
        if clear {
            self.text.drain(..end);
        }
        Some(ExpectMatch { matched: true, captured })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Calls observed by a [`ScriptedSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    Execute(String),
    Expect(String),
    Disconnect,
}

/// Shared view of the events a session recorded
pub type EventLog = Arc<Mutex<Vec<SessionEvent>>>;

/// A session that replays canned output.
///
/// Each command may have a queue of responses; they are handed out in
/// order and the last one repeats. Commands without a queue produce the
/// default response. `expect` never waits: the pattern either matches the
/// buffered output or the call reports a miss straight away.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    connected: bool,
    refuse: Option<String>,
    responses: HashMap<String, VecDeque<String>>,
    default_response: String,
    banner: String,
    buffer: OutputBuffer,
    events: EventLog,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `output` as the next response to `command`
    pub fn respond(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.responses.entry(command.into()).or_default().push_back(output.into());
        self
    }

    /// Output for commands with no queued response
    pub fn default_response(mut self, output: impl Into<String>) -> Self {
        self.default_response = output.into();
        self
    }

    /// Output placed in the buffer on connect, like a login prompt
    pub fn banner(mut self, output: impl Into<String>) -> Self {
        self.banner = output.into();
        self
    }

    /// Make `connect` fail with `reason`
    pub fn refuse_connect(mut self, reason: impl Into<String>) -> Self {
        self.refuse = Some(reason.into());
        self
    }

    /// Handle to the recorded events, usable after the session is moved
    /// into an engine run
    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    fn record(&self, event: SessionEvent) {
        lock(&self.events).push(event);
    }

    fn next_response(&mut self, command: &str) -> String {
        match self.responses.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => self.default_response.clone(),
        }
    }
}

impl DeviceSession for ScriptedSession {
    fn connect(&mut self) -> Result<(), SessionError> {
        self.record(SessionEvent::Connect);
        if let Some(ref reason) = self.refuse {
            return Err(SessionError::Refused(reason.clone()));
        }
        self.connected = true;
        self.buffer.push(&self.banner);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.record(SessionEvent::Disconnect);
        self.connected = false;
        self.buffer.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn execute(&mut self, command: &str) -> Result<String, SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.record(SessionEvent::Execute(command.to_string()));
        let mut output = self.next_response(command);
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        self.buffer.push(&output);
        Ok(output)
    }

    fn expect(
        &mut self,
        pattern: &str,
        _timeout: Duration,
        clear_on_match: bool,
    ) -> Result<ExpectMatch, SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.record(SessionEvent::Expect(pattern.to_string()));
        let re = compile_pattern(pattern)?;
        Ok(self.buffer.take_match(&re, clear_on_match).unwrap_or_else(ExpectMatch::miss))
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READER_GRACE: Duration = Duration::from_millis(500);

/// Drives a local shell as a device: commands are written to the shell's
/// stdin and its stdout and stderr are collected into one buffer.
pub struct ShellSession {
    shell: String,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    buffer: Arc<Mutex<OutputBuffer>>,
    readers: Vec<JoinHandle<()>>,
}

impl ShellSession {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            shell: "sh".to_string(),
            cwd: cwd.into(),
            env: Vec::new(),
            child: None,
            stdin: None,
            buffer: Arc::new(Mutex::new(OutputBuffer::default())),
            readers: Vec::new(),
        }
    }

    /// Use a different shell program
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set an environment variable for the shell
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn spawn_reader<R: Read + Send + 'static>(&mut self, mut source: R) {
        let buffer = self.buffer.clone();
        self.readers.push(std::thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => lock(&buffer).push(&String::from_utf8_lossy(&chunk[..n])),
                }
            }
        }));
    }
}

impl DeviceSession for ShellSession {
    fn connect(&mut self) -> Result<(), SessionError> {
        if self.child.is_some() {
            return Ok(());
        }
        let mut cmd = ProcessCommand::new(&self.shell);
        cmd.current_dir(&self.cwd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        self.stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr);
        }
        self.child = Some(child);
        log::debug!("shell session started in {}", self.cwd.display());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        // closing stdin lets the shell exit on its own
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + Duration::from_secs(2);
            while child.try_wait()?.is_none() {
                if Instant::now() >= deadline {
                    child.kill()?;
                    child.wait()?;
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        // background jobs can hold the pipes open past the shell's exit;
        // readers still running after the grace period are left detached
        let deadline = Instant::now() + READER_GRACE;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        for reader in self.readers.drain(..) {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        lock(&self.buffer).clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }

    fn execute(&mut self, command: &str) -> Result<String, SessionError> {
        let stdin = self.stdin.as_mut().ok_or(SessionError::NotConnected)?;
        stdin.write_all(command.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(String::new())
    }

    fn expect(
        &mut self,
        pattern: &str,
        timeout: Duration,
        clear_on_match: bool,
    ) -> Result<ExpectMatch, SessionError> {
        if self.child.is_none() {
            return Err(SessionError::NotConnected);
        }
        let re = compile_pattern(pattern)?;
        // a timeout past what Instant can hold waits until a match
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(m) = lock(&self.buffer).take_match(&re, clear_on_match) {
                return Ok(m);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(ExpectMatch::miss());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_queue_repeats_last() {
        let mut s = ScriptedSession::new()
            .respond("show", "first")
            .respond("show", "second")
            .default_response("?");
        s.connect().unwrap();
        assert_eq!(s.execute("show").unwrap(), "first\n");
        assert_eq!(s.execute("show").unwrap(), "second\n");
        assert_eq!(s.execute("show").unwrap(), "second\n");
        assert_eq!(s.execute("other").unwrap(), "?\n");
    }

    #[test]
    fn test_scripted_expect_clears_through_match() {
        let mut s = ScriptedSession::new().respond("get", "Version: v7.2\nSerial: FGT60");
        s.connect().unwrap();
        s.execute("get").unwrap();
        let m = s.expect(r"Version: (\S+)", Duration::from_secs(1), true).unwrap();
        assert_eq!(m, ExpectMatch { matched: true, captured: "v7.2".into() });
        // consumed
        assert!(!s.expect("Version", Duration::ZERO, true).unwrap().matched);
        // not consumed without clear
        assert!(s.expect("Serial", Duration::ZERO, false).unwrap().matched);
        assert!(s.expect("Serial", Duration::ZERO, false).unwrap().matched);
    }

    #[test]
    fn test_scripted_events_and_not_connected() {
        let mut s = ScriptedSession::new().banner("login: ");
        let events = s.events();
        assert!(matches!(s.execute("x"), Err(SessionError::NotConnected)));
        s.connect().unwrap();
        assert!(s.expect("login:", Duration::ZERO, true).unwrap().matched);
        s.execute("admin").unwrap();
        s.disconnect().unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                SessionEvent::Connect,
                SessionEvent::Expect("login:".into()),
                SessionEvent::Execute("admin".into()),
                SessionEvent::Disconnect,
            ]
        );
    }

    #[test]
    fn test_bad_pattern_is_usage_error() {
        let mut s = ScriptedSession::new();
        s.connect().unwrap();
        let err = s.expect("(", Duration::ZERO, true).unwrap_err();
        assert_eq!(RuntimeError::from(err).kind, RuntimeErrorKind::Usage);
    }

    #[test]
    fn test_refused_connect() {
        let mut s = ScriptedSession::new().refuse_connect("no route");
        let err = s.connect().unwrap_err();
        assert_eq!(RuntimeError::from(err).kind, RuntimeErrorKind::Session);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = ShellSession::new(dir.path()).env("GREETING", "hello");
        s.connect().unwrap();
        s.execute("echo \"$GREETING world\"").unwrap();
        let m = s.expect(r"(\w+) world", Duration::from_secs(5), true).unwrap();
        assert!(m.matched);
        assert_eq!(m.captured, "hello");
        let m = s.expect("never printed", Duration::from_millis(50), true).unwrap();
        assert!(!m.matched);
        s.disconnect().unwrap();
        assert!(!s.is_connected());
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_expect_with_unbounded_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = ShellSession::new(dir.path());
        s.connect().unwrap();
        s.execute("echo ready").unwrap();
        let m = s.expect("ready", Duration::from_secs(u64::MAX), true).unwrap();
        assert!(m.matched);
        s.disconnect().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_disconnect_with_background_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = ShellSession::new(dir.path());
        s.connect().unwrap();
        // the job inherits the shell's stdout and stderr
        s.execute("sleep 30 &").unwrap();
        s.execute("echo started").unwrap();
        assert!(s.expect("started", Duration::from_secs(5), true).unwrap().matched);
        let start = Instant::now();
        s.disconnect().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!s.is_connected());
    }
}
