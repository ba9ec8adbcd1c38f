//! sleep / comment / breakpoint

use std::time::{Duration, Instant};

use crate::engine::{OpResult, OpUsage, Operation};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::state::State;

use super::{int_param, param};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ──────────────────────────────────────────────────────────
// sleep: pause for a number of seconds
// ──────────────────────────────────────────────────────────

pub(super) struct SleepOp;

impl Operation for SleepOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let secs = int_param("sleep", "seconds", param(params, 0))?;
        if secs < 0 {
            return Err(RuntimeError::new(
                RuntimeErrorKind::Usage,
                format!("sleep: seconds must not be negative, got {}", secs),
            ));
        }

        // sleep in slices so an abort lands at the next boundary promptly;
        // a deadline past what Instant can hold only ends on abort
        let deadline = Instant::now().checked_add(Duration::from_secs(secs as u64));
        loop {
            let now = Instant::now();
            if state.abort_requested() || deadline.map_or(false, |d| now >= d) {
                break;
            }
            let left = deadline.map_or(SLEEP_SLICE, |d| d - now);
            std::thread::sleep(left.min(SLEEP_SLICE));
        }
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Pause for a number of seconds".into(),
            args: "seconds".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// comment: write a note to the transcript
// ──────────────────────────────────────────────────────────

pub(super) struct CommentOp;

impl Operation for CommentOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let text = param(params, 0);
        log::info!("{}", text);
        state.logf(&format!("# {}", text));
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Write a note to the run log".into(),
            args: "[text...]".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// breakpoint: suspend the run
// ──────────────────────────────────────────────────────────

pub(super) struct BreakpointOp;

impl Operation for BreakpointOp {
    fn run(&self, _state: &mut State, _params: &[String]) -> Result<OpResult, RuntimeError> {
        Ok(OpResult::Suspend)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Suspend the run until it is resumed".into(),
            args: "".into(),
        }
    }
}
