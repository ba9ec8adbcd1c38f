//! Per-run execution state
//!
//! Everything one run mutates lives here: program counter, control-flow
//! frames, runtime variables, device sessions and the run transcript. An
//! [`crate::Engine`] is shared and immutable; a `State` belongs to exactly
//! one run and is never shared.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::session::DeviceSession;
use crate::sink::ResultSink;
use crate::vars::{substitute_config, substitute_runtime, ConfigSource};

/// Where a run stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// Stopped at a breakpoint; `Engine::resume` continues
    Suspended,
    Completed,
    Failed(RuntimeError),
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed(_))
    }
}

/// Which block opened a control-flow frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    If,
    While,
    Loop,
}

/// One entry of the runtime control-flow stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// False while the engine is looking for the branch to take
    pub active: bool,
}

/// Creates a session the first time a device is switched to
pub type SessionFactory = Arc<dyn Fn(&str) -> Option<Box<dyn DeviceSession>> + Send + Sync>;

/// Requests that a run stop at the next instruction boundary
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    passed: usize,
    failed: usize,
}

/// Mutable state for a single run
pub struct State {
    /// Index of the next instruction
    pub pc: usize,
    pub status: RunStatus,
    /// Active device name
    pub device: Option<String>,
    /// Test case used when an assertion names none
    pub test_case: String,
    /// Recoverable errors, in the order they happened
    pub errors: Vec<RuntimeError>,
    /// Run transcript
    pub log: String,
    /// Output returned by the most recent `execute`
    pub last_output: String,
    frames: Vec<Frame>,
    vars: HashMap<String, String>,
    sessions: HashMap<String, Box<dyn DeviceSession>>,
    factory: Option<SessionFactory>,
    config: Arc<dyn ConfigSource>,
    sink: Arc<dyn ResultSink>,
    tallies: HashMap<String, Tally>,
    abort: AbortHandle,
}

impl State {
    pub fn new(config: Arc<dyn ConfigSource>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            pc: 0,
            status: RunStatus::Running,
            device: None,
            test_case: String::new(),
            errors: Vec::new(),
            log: String::new(),
            last_output: String::new(),
            frames: Vec::new(),
            vars: HashMap::new(),
            sessions: HashMap::new(),
            factory: None,
            config,
            sink,
            tallies: HashMap::new(),
            abort: AbortHandle::default(),
        }
    }

    /// Bind `session` to the device `name`
    pub fn with_session(mut self, name: impl Into<String>, session: Box<dyn DeviceSession>) -> Self {
        self.bind_session(name, session);
        self
    }

    pub fn with_factory(mut self, factory: SessionFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_test_case(mut self, test_case: impl Into<String>) -> Self {
        self.test_case = test_case.into();
        self
    }

    pub fn bind_session(&mut self, name: impl Into<String>, session: Box<dyn DeviceSession>) {
        self.sessions.insert(name.into(), session);
    }

    /// Handle that aborts this run from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Append a line to the run transcript
    pub fn logf(&mut self, msg: &str) {
        self.log.push_str(msg);
        if !msg.ends_with('\n') {
            self.log.push('\n');
        }
    }

    // runtime variables

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Runtime variables, sorted by name
    pub fn vars(&self) -> Vec<(&str, &str)> {
        let mut vars: Vec<(&str, &str)> = self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        vars.sort();
        vars
    }

    /// Apply both substitution passes to one parameter: configuration
    /// `$NAME` for the active device first, then runtime `{$NAME}`.
    pub fn resolve(&self, param: &str) -> Result<String, RuntimeError> {
        let configured = substitute_config(param, self.config.as_ref(), self.device.as_deref());
        substitute_runtime(&configured, &|name| self.vars.get(name).cloned())
    }

    // control-flow stack

    pub(crate) fn push_frame(&mut self, kind: FrameKind, active: bool) {
        self.frames.push(Frame { kind, active });
    }

    pub(crate) fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub(crate) fn top_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Whether the innermost frame is skipping its region
    pub fn skipping(&self) -> bool {
        self.frames.last().map_or(false, |f| !f.active)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    // devices

    /// Make `name` the active device, connecting its session on first use.
    ///
    /// The device becomes active even when no session can be found for it,
    /// so the next device operation fails with `NoSession`.
    pub fn switch_device(&mut self, name: &str) -> Result<(), RuntimeError> {
        self.device = Some(name.to_string());

        if !self.sessions.contains_key(name) {
            let created = self.factory.as_ref().and_then(|factory| factory(name));
            match created {
                Some(session) => {
                    self.sessions.insert(name.to_string(), session);
                }
                None => {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::UnknownDevice,
                        format!("no session bound for device {}", name),
                    ))
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(name) {
            if !session.is_connected() {
                log::debug!("connecting {}", name);
                session.connect()?;
            }
        }
        Ok(())
    }

    /// The session bound to the active device
    pub fn session(&mut self) -> Result<&mut dyn DeviceSession, RuntimeError> {
        let name = self.device.as_deref().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::NoSession, "no device selected")
        })?;
        match self.sessions.get_mut(name) {
            Some(session) => Ok(session.as_mut()),
            None => Err(RuntimeError::new(
                RuntimeErrorKind::NoSession,
                format!("no session bound for device {}", name),
            )),
        }
    }

    /// Disconnect every connected session
    pub fn disconnect_all(&mut self) {
        let mut names: Vec<&String> = self.sessions.keys().collect();
        names.sort();
        let names: Vec<String> = names.into_iter().cloned().collect();
        for name in names {
            if let Some(session) = self.sessions.get_mut(&name) {
                if session.is_connected() {
                    if let Err(e) = session.disconnect() {
                        log::warn!("disconnecting {}: {}", name, e);
                    }
                }
            }
        }
    }

    // outcomes

    /// Test case id for an assertion: `explicit` when given, otherwise the
    /// run's default
    pub fn test_case_for(&self, explicit: &str) -> String {
        if explicit.is_empty() {
            self.test_case.clone()
        } else {
            explicit.to_string()
        }
    }

    /// Record an outcome in the sink and in this run's tallies
    pub fn record(&mut self, test_case: &str, passed: bool, diagnostic: &str) {
        let tally = self.tallies.entry(test_case.to_string()).or_default();
        if passed {
            tally.passed += 1;
        } else {
            tally.failed += 1;
        }
        self.logf(&format!(
            "[{}] {} {}",
            test_case,
            if passed { "PASS" } else { "FAIL" },
            diagnostic
        ));
        self.sink.record_outcome(test_case, passed, diagnostic);
    }

    /// Passed and failed outcome counts this run recorded for `test_case`
    pub fn tally(&self, test_case: &str) -> (usize, usize) {
        self.tallies
            .get(test_case)
            .map_or((0, 0), |t| (t.passed, t.failed))
    }

    pub fn finalize(&mut self, test_case: &str) {
        self.sink.finalize(test_case);
    }
}
