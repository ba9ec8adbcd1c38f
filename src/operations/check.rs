//! compare / check_var / report: assertions and verdicts

use similar::TextDiff;

use crate::engine::{OpResult, OpUsage, Operation};
use crate::error::RuntimeError;
use crate::session::compile_pattern;
use crate::state::State;

use super::{expects_match, param};

/// Record a check and turn a failure into an assertion error
fn finish_check(
    state: &mut State,
    test_case: &str,
    matched: bool,
    want_match: bool,
    diagnostic: String,
) -> Result<OpResult, RuntimeError> {
    let passed = matched == want_match;
    state.record(test_case, passed, &diagnostic);
    if passed {
        Ok(OpResult::Continue)
    } else {
        Err(RuntimeError::assertion(diagnostic))
    }
}

/// Log a unified diff when either side spans several lines
fn log_diff(state: &mut State, left: &str, right: &str, left_name: &str, right_name: &str) {
    if !left.contains('\n') && !right.contains('\n') {
        return;
    }
    let diff = TextDiff::from_lines(left, right);
    let udiff = diff.unified_diff().header(left_name, right_name).to_string();
    state.logf(&udiff);
}

// ──────────────────────────────────────────────────────────
// compare: two values must be equal
// ──────────────────────────────────────────────────────────

pub(super) struct CompareOp;

impl Operation for CompareOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let (v1, v2) = (param(params, 0), param(params, 1));
        let test_case = state.test_case_for(param(params, 2));
        let want_match = expects_match("compare", param(params, 3))?;

        let equal = v1 == v2;
        if !equal {
            log_diff(state, v1, v2, "v1", "v2");
        }
        let diagnostic = if equal {
            format!("compare: {:?} equals {:?}", v1, v2)
        } else {
            format!("compare: {:?} differs from {:?}", v1, v2)
        };
        finish_check(state, &test_case, equal, want_match, diagnostic)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Compare two values and record the result".into(),
            args: "-v1 value -v2 value [-for testcase] [-fail match|unmatch]".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// check_var: a variable must equal a value or match a pattern
// ──────────────────────────────────────────────────────────

pub(super) struct CheckVarOp;

impl Operation for CheckVarOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let name = param(params, 0);
        let (expected, pattern) = (param(params, 1), param(params, 2));
        let test_case = state.test_case_for(param(params, 3));
        let want_match = expects_match("check_var", param(params, 4))?;

        let actual = state.var(name).ok_or_else(|| RuntimeError::unbound(name))?.to_string();
        let (matched, diagnostic) = if pattern.is_empty() {
            let matched = actual == expected;
            if !matched {
                log_diff(state, expected, &actual, "expected", name);
            }
            let verb = if matched { "equals" } else { "differs from" };
            (matched, format!("check_var: {} = {:?} {} {:?}", name, actual, verb, expected))
        } else {
            let re = compile_pattern(pattern)?;
            let matched = re.is_match(&actual);
            let verb = if matched { "matches" } else { "does not match" };
            (matched, format!("check_var: {} = {:?} {} {:?}", name, actual, verb, pattern))
        };
        finish_check(state, &test_case, matched, want_match, diagnostic)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Check a variable against a value or pattern and record the result".into(),
            args: "-name var [-value v] [-pattern re] [-for testcase] [-fail match|unmatch]".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// report: record a test case verdict and finalize it
// ──────────────────────────────────────────────────────────

pub(super) struct ReportOp;

impl Operation for ReportOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let test_case = param(params, 0);
        if test_case.is_empty() {
            return Err(RuntimeError::usage("report", "testcase"));
        }
        let (passed, failed) = state.tally(test_case);
        let diagnostic = if passed + failed == 0 {
            "report: no checks recorded".to_string()
        } else {
            format!("report: {} passed, {} failed", passed, failed)
        };
        state.record(test_case, failed == 0, &diagnostic);
        state.finalize(test_case);
        log::info!("test case {}: {}", test_case, if failed == 0 { "PASS" } else { "FAIL" });
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Record the verdict of a test case".into(),
            args: "testcase".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;
    use crate::sink::MemorySink;
    use crate::vars::StaticConfig;
    use std::sync::Arc;

    fn state() -> (State, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let state = State::new(Arc::new(StaticConfig::new()), sink.clone()).with_test_case("main");
        (state, sink)
    }

    fn run(op: &dyn Operation, state: &mut State, p: &[&str]) -> Result<OpResult, RuntimeError> {
        let params: Vec<String> = p.iter().map(|s| s.to_string()).collect();
        op.run(state, &params)
    }

    #[test]
    fn test_compare() {
        let (mut s, sink) = state();
        run(&CompareOp, &mut s, &["v7.2", "v7.2", "", "unmatch"]).unwrap();
        let err = run(&CompareOp, &mut s, &["v7.2", "v7.4", "1002", "unmatch"]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::AssertionFailed);
        run(&CompareOp, &mut s, &["a", "b", "1003", "match"]).unwrap();
        assert_eq!(sink.verdict("main"), Some(true));
        assert_eq!(sink.verdict("1002"), Some(false));
        assert_eq!(sink.verdict("1003"), Some(true));
    }

    #[test]
    fn test_compare_logs_diff() {
        let (mut s, _) = state();
        let _ = run(&CompareOp, &mut s, &["a\nb\n", "a\nc\n", "", "unmatch"]);
        assert!(s.log.contains("-b"), "{}", s.log);
        assert!(s.log.contains("+c"), "{}", s.log);
    }

    #[test]
    fn test_check_var() {
        let (mut s, sink) = state();
        s.set_var("serial", "FGT60F0000001");
        run(&CheckVarOp, &mut s, &["serial", "", "^FGT60F", "1001", "unmatch"]).unwrap();
        run(&CheckVarOp, &mut s, &["serial", "FGT60F0000001", "", "1001", "unmatch"]).unwrap();
        assert!(run(&CheckVarOp, &mut s, &["serial", "other", "", "1001", "unmatch"]).is_err());
        assert_eq!(sink.verdict("1001"), Some(false));
        assert_eq!(
            run(&CheckVarOp, &mut s, &["nope", "", "", "", "unmatch"]).unwrap_err().kind,
            RuntimeErrorKind::UnboundVariable
        );
        assert_eq!(
            run(&CheckVarOp, &mut s, &["serial", "", "(", "", "unmatch"]).unwrap_err().kind,
            RuntimeErrorKind::Usage
        );
    }

    #[test]
    fn test_report() {
        let (mut s, sink) = state();
        s.record("1001", true, "ok");
        s.record("1001", false, "bad");
        run(&ReportOp, &mut s, &["1001"]).unwrap();
        run(&ReportOp, &mut s, &["1002"]).unwrap();
        let outcomes = sink.outcomes();
        assert_eq!(outcomes[2].diagnostic, "report: 1 passed, 1 failed");
        assert!(!outcomes[2].passed);
        assert!(outcomes[3].passed);
        assert_eq!(sink.finalized(), vec!["1001".to_string(), "1002".to_string()]);
    }
}
