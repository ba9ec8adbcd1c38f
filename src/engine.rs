//! Execution engine
//!
//! The Engine holds the operation registry and the strictness setting.
//! It is stateless config: one engine can run many instruction lists,
//! each against its own [`State`].

use std::collections::HashMap;

use crate::conditions;
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::program::{Instruction, InstructionList};
use crate::state::{FrameKind, RunStatus, State};

/// Result returned by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// Go on with the next instruction
    Continue,
    /// Stop the run until `Engine::resume`
    Suspend,
}

/// Usage information for an operation
pub struct OpUsage {
    /// One-line summary
    pub summary: String,
    /// Argument syntax
    pub args: String,
}

/// An operation that instructions dispatch to by name
pub trait Operation: Send + Sync {
    /// Run with fully substituted parameters
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError>;

    /// Return usage information
    fn usage(&self) -> OpUsage;
}

/// A boxed operation
pub type BoxedOp = Box<dyn Operation>;

/// The execution engine
pub struct Engine {
    /// Registered operations
    pub operations: HashMap<String, BoxedOp>,
    /// Whether to suppress instruction logging in the transcript
    pub quiet: bool,
    strict: bool,
}

impl Engine {
    /// A non-strict engine with the built-in operations
    pub fn new() -> Self {
        Self::with_strictness(false)
    }

    /// A strict engine: any runtime error fails the run
    pub fn strict() -> Self {
        Self::with_strictness(true)
    }

    pub fn with_strictness(strict: bool) -> Self {
        Self {
            operations: crate::operations::default_operations(),
            quiet: false,
            strict,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Register an operation, replacing any built-in with the same name
    pub fn register_operation(&mut self, name: impl Into<String>, op: BoxedOp) {
        self.operations.insert(name.into(), op);
    }

    /// Registered operation names, sorted
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Run `list` until it completes, fails or reaches a breakpoint.
    ///
    /// Sessions are disconnected once the run is finished.
    pub fn run(&self, list: &InstructionList, state: &mut State) -> RunStatus {
        if state.status.is_finished() {
            return state.status.clone();
        }
        state.status = RunStatus::Running;

        while state.status == RunStatus::Running {
            if state.abort_requested() {
                let err = RuntimeError::new(RuntimeErrorKind::Aborted, "run aborted");
                state.logf(&format!("[aborted at instruction {}]", state.pc));
                state.errors.push(err.clone());
                state.status = RunStatus::Failed(err);
                break;
            }
            let Some(instr) = list.get(state.pc) else {
                state.status = RunStatus::Completed;
                break;
            };
            self.step(list, instr, state);
        }

        if state.status.is_finished() {
            state.disconnect_all();
        }
        log::debug!("{}: {:?} at instruction {}", list.name, state.status, state.pc);
        state.status.clone()
    }

    /// Continue a run suspended at a breakpoint
    pub fn resume(&self, list: &InstructionList, state: &mut State) -> RunStatus {
        if state.status != RunStatus::Suspended {
            return state.status.clone();
        }
        state.logf("[resumed]");
        self.run(list, state)
    }

    fn step(&self, list: &InstructionList, instr: &Instruction, state: &mut State) {
        if instr.is_control() {
            self.control(list, instr, state);
            return;
        }
        if state.skipping() {
            state.pc += 1;
            return;
        }

        if !self.quiet {
            state.logf(&format!("> {}", instr));
        }

        let params: Result<Vec<String>, RuntimeError> = instr.params.iter().map(|p| state.resolve(p)).collect();
        let params = match params {
            Ok(p) => p,
            Err(e) => {
                state.pc += 1;
                self.handle_error(state, instr, e);
                return;
            }
        };

        let Some(op) = self.operations.get(&instr.operation) else {
            state.pc += 1;
            let err = RuntimeError::new(
                RuntimeErrorKind::Usage,
                format!("no handler registered for {}", instr.operation),
            );
            self.handle_error(state, instr, err);
            return;
        };

        log::trace!("{}: {} {:?}", instr.line, instr.operation, params);
        state.pc += 1;
        match op.run(state, &params) {
            Ok(OpResult::Continue) => {}
            Ok(OpResult::Suspend) => {
                state.logf(&format!("[suspended at line {}]", instr.line));
                state.status = RunStatus::Suspended;
            }
            Err(e) => self.handle_error(state, instr, e),
        }
    }

    /// Log a runtime error against its instruction and decide whether the
    /// run can go on.
    fn handle_error(&self, state: &mut State, instr: &Instruction, err: RuntimeError) {
        let err = err.with_location(instr.line, instr.operation.clone());
        log::warn!("{}", err);
        state.logf(&format!("[error] {}", err));
        state.errors.push(err.clone());
        if err.is_fatal() || self.strict {
            state.status = RunStatus::Failed(err);
        }
    }

    /// Evaluate an instruction's condition. Errors are logged and count as
    /// false.
    fn condition(&self, instr: &Instruction, state: &mut State) -> bool {
        let resolved: Result<Vec<String>, RuntimeError> = instr.params.iter().map(|p| state.resolve(p)).collect();
        match resolved.and_then(|params| conditions::evaluate(&params)) {
            Ok(value) => {
                if !self.quiet {
                    state.logf(&format!("> {} [{}]", instr, value));
                }
                value
            }
            Err(e) => {
                self.handle_error(state, instr, e);
                false
            }
        }
    }

    fn control(&self, list: &InstructionList, instr: &Instruction, state: &mut State) {
        let wanted = match instr.operation.as_str() {
            "if" | "elseif" => 2,
            "fi" => 0,
            _ => 1,
        };
        if instr.targets.len() != wanted || instr.targets.iter().any(|&t| t > list.len()) {
            let err = RuntimeError::new(
                RuntimeErrorKind::Usage,
                format!("malformed jump targets {:?}", instr.targets),
            )
            .with_location(instr.line, instr.operation.clone());
            state.errors.push(err.clone());
            state.status = RunStatus::Failed(err);
            return;
        }
        let t = &instr.targets;

        match instr.operation.as_str() {
            "if" => {
                let (next, end) = (t[0], t[1]);
                if self.condition(instr, state) {
                    state.push_frame(FrameKind::If, true);
                    state.pc += 1;
                } else if next != end {
                    state.push_frame(FrameKind::If, false);
                    state.pc = next;
                } else {
                    state.pc = end;
                }
            }
            "elseif" => {
                let (next, end) = (t[0], t[1]);
                if state.skipping() {
                    if self.condition(instr, state) {
                        if let Some(frame) = state.top_frame_mut() {
                            frame.active = true;
                        }
                        state.pc += 1;
                    } else if next != end {
                        state.pc = next;
                    } else {
                        state.pop_frame();
                        state.pc = end;
                    }
                } else {
                    // previous branch ran
                    state.pop_frame();
                    state.pc = end;
                }
            }
            "else" => {
                if state.skipping() {
                    if let Some(frame) = state.top_frame_mut() {
                        frame.active = true;
                    }
                    state.pc += 1;
                } else {
                    state.pop_frame();
                    state.pc = t[0];
                }
            }
            "fi" => {
                state.pop_frame();
                state.pc += 1;
            }
            "while" | "loop" => {
                let kind = if instr.operation == "while" { FrameKind::While } else { FrameKind::Loop };
                if self.condition(instr, state) {
                    state.push_frame(kind, true);
                    state.pc += 1;
                } else {
                    state.pc = t[0];
                }
            }
            "endwhile" | "until" => {
                state.pop_frame();
                let has_condition = instr.params.first().map_or(false, |p| !p.is_empty());
                let exit = has_condition && self.condition(instr, state);
                if exit {
                    state.pc += 1;
                } else {
                    // back to the entry, which evaluates its own condition again
                    state.pc = t[0];
                }
            }
            other => {
                let err = RuntimeError::new(RuntimeErrorKind::Usage, format!("unknown control keyword {}", other));
                self.handle_error(state, instr, err);
                state.pc += 1;
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::{parse, NoIncludes};
    use crate::schema::Schema;
    use crate::session::ScriptedSession;
    use crate::sink::MemorySink;
    use crate::vars::StaticConfig;
    use std::sync::Arc;

    fn compile(src: &str) -> InstructionList {
        let schema = Schema::builtin();
        let tokens = Lexer::new(schema).tokenize(src).unwrap();
        parse("test", &tokens, schema, &mut NoIncludes).unwrap()
    }

    fn state() -> State {
        State::new(Arc::new(StaticConfig::new()), Arc::new(MemorySink::new()))
    }

    fn comments(state: &State) -> Vec<String> {
        state
            .log
            .lines()
            .filter_map(|l| l.strip_prefix("# "))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_elseif_branch_only() {
        let list = compile("<if 0>\ncomment A\n<elseif 1>\ncomment B\n<else>\ncomment C\n<fi>\ncomment D");
        let mut s = state();
        assert_eq!(Engine::new().run(&list, &mut s), RunStatus::Completed);
        assert_eq!(comments(&s), vec!["B", "D"]);
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_else_branch() {
        let list = compile("<if 0>\ncomment A\n<elseif 0>\ncomment B\n<else>\ncomment C\n<fi>");
        let mut s = state();
        Engine::new().run(&list, &mut s);
        assert_eq!(comments(&s), vec!["C"]);
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_if_true_resumes_after_fi() {
        let list = compile("<if 1>\ncomment A\n<else>\ncomment B\n<fi>\ncomment after");
        let mut s = state();
        Engine::new().run(&list, &mut s);
        assert_eq!(comments(&s), vec!["A", "after"]);
    }

    #[test]
    fn test_nested_if_inside_false_branch() {
        let src = "<if 0>\n<if 1>\ncomment inner\n<fi>\n<elseif 1>\ncomment outer\n<fi>";
        let list = compile(src);
        let mut s = state();
        Engine::new().run(&list, &mut s);
        assert_eq!(comments(&s), vec!["outer"]);
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_loop_runs_three_times() {
        let src = "<intset count 0>\n<loop {$count} < 3>\ncomment pass {$count}\n<intchange {$count} + 1>\n<until {$count} == 3>";
        let list = compile(src);
        let mut s = state();
        Engine::new().run(&list, &mut s);
        assert_eq!(comments(&s), vec!["pass 0", "pass 1", "pass 2"]);
        assert_eq!(s.var("count"), Some("3"));
    }

    #[test]
    fn test_while_reevaluates_entry() {
        let src = "<intset n 5>\n<while {$n} gt 3>\n<intchange {$n} - 1>\n<endwhile>\ncomment done {$n}";
        let list = compile(src);
        let mut s = state();
        Engine::new().run(&list, &mut s);
        assert_eq!(comments(&s), vec!["done 3"]);
    }

    #[test]
    fn test_condition_error_is_false() {
        let list = compile("<if {$nope} eq 1>\ncomment A\n<fi>\ncomment B");
        let mut s = state();
        assert_eq!(Engine::new().run(&list, &mut s), RunStatus::Completed);
        assert_eq!(comments(&s), vec!["B"]);
        assert_eq!(s.errors[0].kind, RuntimeErrorKind::UnboundVariable);
        assert_eq!(s.errors[0].line, Some(1));
    }

    #[test]
    fn test_strict_fails_on_contract_error() {
        let list = compile("<intchange {$x} + 1>\ncomment after");
        let mut s = state();
        let status = Engine::strict().run(&list, &mut s);
        assert!(matches!(status, RunStatus::Failed(ref e) if e.kind == RuntimeErrorKind::UnboundVariable));
        assert!(comments(&s).is_empty());
    }

    #[test]
    fn test_no_session_is_fatal() {
        let list = compile("[FGT_A]\nget system status\ncomment unreachable");
        let mut s = state();
        let status = Engine::new().run(&list, &mut s);
        assert!(matches!(status, RunStatus::Failed(ref e) if e.kind == RuntimeErrorKind::NoSession));
        assert_eq!(s.errors[0].kind, RuntimeErrorKind::UnknownDevice);
        assert!(comments(&s).is_empty());
    }

    #[test]
    fn test_breakpoint_suspends_and_resumes() {
        let list = compile("comment one\nbreakpoint\ncomment two");
        let engine = Engine::new();
        let mut s = state();
        assert_eq!(engine.run(&list, &mut s), RunStatus::Suspended);
        assert_eq!(comments(&s), vec!["one"]);
        assert_eq!(engine.resume(&list, &mut s), RunStatus::Completed);
        assert_eq!(comments(&s), vec!["one", "two"]);
    }

    #[test]
    fn test_abort_at_instruction_boundary() {
        let list = compile("comment one\ncomment two");
        let mut s = state();
        s.abort_handle().abort();
        let status = Engine::new().run(&list, &mut s);
        assert!(matches!(status, RunStatus::Failed(ref e) if e.kind == RuntimeErrorKind::Aborted));
        assert!(comments(&s).is_empty());
    }

    #[test]
    fn test_sessions_disconnected_at_end() {
        let session = ScriptedSession::new();
        let events = session.events();
        let list = compile("[FGT_A]\nget system status");
        let mut s = state().with_session("FGT_A", Box::new(session));
        Engine::new().run(&list, &mut s);
        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&crate::session::SessionEvent::Connect));
        assert_eq!(events.last(), Some(&crate::session::SessionEvent::Disconnect));
    }

    #[test]
    fn test_custom_operation() {
        struct Shout;
        impl Operation for Shout {
            fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
                state.set_var("shout", params.join(" ").to_uppercase());
                Ok(OpResult::Continue)
            }
            fn usage(&self) -> OpUsage {
                OpUsage { summary: "Shout".into(), args: "text".into() }
            }
        }

        let list = InstructionList::new("x", vec![Instruction::new(1, "shout", vec!["hi {$who}".into()])]);
        let mut engine = Engine::new();
        engine.register_operation("shout", Box::new(Shout));
        let mut s = state();
        s.set_var("who", "there");
        engine.run(&list, &mut s);
        assert_eq!(s.var("shout"), Some("HI THERE"));
    }

    #[test]
    fn test_unregistered_operation_is_recoverable() {
        let list = InstructionList::new("x", vec![
            Instruction::new(1, "nothing_here", vec![]),
            Instruction::new(2, "comment", vec!["after".into()]),
        ]);
        let mut s = state();
        assert_eq!(Engine::new().run(&list, &mut s), RunStatus::Completed);
        assert_eq!(comments(&s), vec!["after"]);
        assert_eq!(s.errors.len(), 1);
    }
}
