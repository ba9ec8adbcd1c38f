//! expect / setvar: wait for device output

use std::time::Duration;

use crate::engine::{OpResult, OpUsage, Operation};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::session::ExpectMatch;
use crate::state::State;

use super::{expects_match, int_param, param, yes_no};

fn timeout_param(op: &str, value: &str) -> Result<Duration, RuntimeError> {
    let secs = int_param(op, "-t", value)?;
    if secs < 0 {
        return Err(RuntimeError::new(
            RuntimeErrorKind::Usage,
            format!("{}: -t must not be negative, got {}", op, secs),
        ));
    }
    Ok(Duration::from_secs(secs as u64))
}

// ──────────────────────────────────────────────────────────
// expect: assert that a pattern shows up in device output
// ──────────────────────────────────────────────────────────

pub(super) struct ExpectOp;

impl Operation for ExpectOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let pattern = param(params, 0);
        let test_case = state.test_case_for(param(params, 1));
        let timeout = timeout_param("expect", param(params, 2))?;
        let want_match = expects_match("expect", param(params, 3))?;
        let retry_command = param(params, 4);
        let retry_cnt = int_param("expect", "-retry_cnt", param(params, 5))?.max(0);
        let clear = yes_no("expect", "-clear", param(params, 6))?;

        let mut found = state.session()?.expect(pattern, timeout, clear)?;
        let mut retries = 0;
        // retrying only makes sense while waiting for something to appear
        while want_match && !found.matched && !retry_command.is_empty() && retries < retry_cnt {
            retries += 1;
            state.logf(&format!("[retry {}/{}] {}", retries, retry_cnt, retry_command));
            let session = state.session()?;
            session.execute(retry_command)?;
            found = session.expect(pattern, timeout, clear)?;
        }

        let passed = found.matched == want_match;
        let diagnostic = match (found.matched, retries) {
            (true, _) => format!("expect {:?}: matched {:?}", pattern, found.captured),
            (false, 0) => format!("expect {:?}: not matched within {}s", pattern, timeout.as_secs()),
            (false, n) => format!(
                "expect {:?}: not matched within {}s after {} retries",
                pattern,
                timeout.as_secs(),
                n
            ),
        };
        state.record(&test_case, passed, &diagnostic);

        if passed {
            Ok(OpResult::Continue)
        } else {
            Err(RuntimeError::assertion(diagnostic))
        }
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Wait for a pattern in device output and record the result".into(),
            args: "-e pattern [-for testcase] [-t timeout] [-fail match|unmatch] [-retry_command cmd] [-retry_cnt n] [-clear yes|no]".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// setvar: capture device output into a runtime variable
// ──────────────────────────────────────────────────────────

pub(super) struct SetVarOp;

impl Operation for SetVarOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let pattern = param(params, 0);
        let name = param(params, 1);
        if name.is_empty() {
            return Err(RuntimeError::usage("setvar", "-e pattern -to name [-t timeout]"));
        }
        let timeout = timeout_param("setvar", param(params, 2))?;

        let ExpectMatch { matched, captured } = state.session()?.expect(pattern, timeout, true)?;
        if !matched {
            return Err(RuntimeError::assertion(format!(
                "setvar: {:?} not matched within {}s",
                pattern,
                timeout.as_secs()
            )));
        }
        state.logf(&format!("[{} = {:?}]", name, captured));
        state.set_var(name, captured);
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Store the first capture group of a pattern in a variable".into(),
            args: "-e pattern -to name [-t timeout]".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceSession, ScriptedSession, SessionEvent};
    use crate::sink::MemorySink;
    use crate::vars::StaticConfig;
    use std::sync::Arc;

    fn expect_params(pattern: &str, fail: &str, retry: &str, cnt: &str) -> Vec<String> {
        [pattern, "1001", "1", fail, retry, cnt, "yes"].iter().map(|s| s.to_string()).collect()
    }

    fn state(session: ScriptedSession) -> (State, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut state = State::new(Arc::new(StaticConfig::new()), sink.clone())
            .with_session("FGT_A", Box::new(session));
        state.switch_device("FGT_A").unwrap();
        (state, sink)
    }

    #[test]
    fn test_expect_records_pass() {
        let mut session = ScriptedSession::new().respond("get", "Version: v7.2");
        session.connect().unwrap();
        session.execute("get").unwrap();
        let (mut state, sink) = state(session);
        ExpectOp.run(&mut state, &expect_params("v7\\.2", "unmatch", "", "3")).unwrap();
        assert_eq!(sink.verdict("1001"), Some(true));
    }

    #[test]
    fn test_expect_retries_then_fails() {
        let session = ScriptedSession::new().respond("show", "nothing yet");
        let events = session.events();
        let (mut state, sink) = state(session);
        let err = ExpectOp
            .run(&mut state, &expect_params("ready", "unmatch", "show", "2"))
            .unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::AssertionFailed);
        assert!(err.message.contains("after 2 retries"), "{}", err.message);
        assert_eq!(sink.verdict("1001"), Some(false));
        let executes = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Execute(_)))
            .count();
        assert_eq!(executes, 2);
    }

    #[test]
    fn test_expect_retry_succeeds() {
        let session = ScriptedSession::new().respond("show", "booting").respond("show", "ready");
        let (mut state, sink) = state(session);
        ExpectOp.run(&mut state, &expect_params("ready", "unmatch", "show", "3")).unwrap();
        assert_eq!(sink.verdict("1001"), Some(true));
    }

    #[test]
    fn test_expect_fail_on_match() {
        let mut session = ScriptedSession::new().respond("diag", "Error: link down");
        session.connect().unwrap();
        session.execute("diag").unwrap();
        let (mut state, sink) = state(session);
        assert!(ExpectOp.run(&mut state, &expect_params("Error", "match", "", "3")).is_err());
        assert_eq!(sink.verdict("1001"), Some(false));
    }

    #[test]
    fn test_setvar_captures_group() {
        let mut session = ScriptedSession::new().respond("get", "Serial-Number: FGT60F0000001\n");
        session.connect().unwrap();
        session.execute("get").unwrap();
        let (mut state, _) = state(session);
        let params: Vec<String> = ["Serial-Number: (\\S+)", "serial", "1"].iter().map(|s| s.to_string()).collect();
        SetVarOp.run(&mut state, &params).unwrap();
        assert_eq!(state.var("serial"), Some("FGT60F0000001"));
    }

    #[test]
    fn test_setvar_no_match() {
        let (mut state, _) = state(ScriptedSession::new());
        let params: Vec<String> = ["x(\\d+)", "n", "0"].iter().map(|s| s.to_string()).collect();
        let err = SetVarOp.run(&mut state, &params).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::AssertionFailed);
        assert_eq!(state.var("n"), None);
    }
}
