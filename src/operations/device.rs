//! switch_device / execute

use crate::engine::{OpResult, OpUsage, Operation};
use crate::error::RuntimeError;
use crate::state::State;

use super::param;

// ──────────────────────────────────────────────────────────
// switch_device: make a device active
// ──────────────────────────────────────────────────────────

pub(super) struct SwitchDeviceOp;

impl Operation for SwitchDeviceOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let name = param(params, 0);
        if name.is_empty() {
            return Err(RuntimeError::usage("switch_device", "name"));
        }
        state.logf(&format!("[device {}]", name));
        state.switch_device(name)?;
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Make a device the target of later commands".into(),
            args: "name".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// execute: send a raw command to the active device
// ──────────────────────────────────────────────────────────

pub(super) struct ExecuteOp;

impl Operation for ExecuteOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let command = param(params, 0);
        let output = state.session()?.execute(command)?;
        if !output.is_empty() {
            state.logf(&format!("[output]\n{}", output));
        }
        state.last_output = output;
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Send a command to the active device".into(),
            args: "command...".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;
    use crate::session::{ScriptedSession, SessionEvent};
    use crate::sink::MemorySink;
    use crate::vars::StaticConfig;
    use std::sync::Arc;

    fn params(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_execute_on_active_device() {
        let session = ScriptedSession::new().respond("get system status", "Version: v7.2");
        let events = session.events();
        let mut state = State::new(Arc::new(StaticConfig::new()), Arc::new(MemorySink::new()))
            .with_session("FGT_A", Box::new(session));

        SwitchDeviceOp.run(&mut state, &params(&["FGT_A"])).unwrap();
        ExecuteOp.run(&mut state, &params(&["get system status"])).unwrap();
        assert_eq!(state.last_output, "Version: v7.2\n");
        assert_eq!(
            *events.lock().unwrap(),
            vec![SessionEvent::Connect, SessionEvent::Execute("get system status".into())]
        );
    }

    #[test]
    fn test_execute_without_device() {
        let mut state = State::new(Arc::new(StaticConfig::new()), Arc::new(MemorySink::new()));
        let err = ExecuteOp.run(&mut state, &params(&["show"])).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::NoSession);
        assert!(err.is_fatal());
    }
}
