//! emx-devscript: a compiler and interpreter for device test scripts
//!
//! Scripts drive network devices over interactive CLI sessions: switch to a
//! device, send commands, wait for patterns in the output, and record
//! pass/fail results per test case.
//!
//! # Overview
//!
//! Compilation is a single pass from source text to a flat
//! [`InstructionList`]: the [`Lexer`] classifies statements against a
//! [`Schema`], the parser binds parameters and back-patches jump targets for
//! structured control flow, and included files are compiled once and spliced
//! in through a shared [`InstructionCache`]. The [`Engine`] executes a list
//! against a per-run [`State`].
//!
//! # Script Syntax
//!
//! ```text
//! # comment
//! include lib/login.dvs
//! [FGT_A]
//! get system status
//! expect -e "Version: v7" -for 1001
//! setvar -e "Serial-Number: (\S+)" -to serial
//! intset count 0
//! <loop {$count} lt 3>
//!     intchange count + 1
//! <until {$count} ge 3>
//! <if {$serial} eq FGT60>
//!     comment known unit
//! <else>
//!     comment other unit
//! <fi>
//! report 1001
//! ```
//!
//! `$NAME` is a configuration variable, resolved for the active device;
//! `{$NAME}` is a runtime variable set by the script.
//!
//! # Running
//!
//! ```rust,ignore
//! #[test]
//! fn device_scripts() {
//!     emx_devscript::run_and_assert("tests/testscript");
//! }
//! ```

mod compiler;
mod conditions;
mod engine;
mod error;
mod lexer;
mod operations;
mod parser;
mod program;
mod runner;
mod schema;
mod session;
mod sink;
mod state;
mod vars;

pub use compiler::{
    normalize, ArchiveResolver, CacheStats, Compiler, FsResolver, IncludeResolver, InstructionCache, MapResolver,
};
pub use conditions::{compare, evaluate, truthy, Comparison};
pub use engine::{BoxedOp, Engine, OpResult, OpUsage, Operation};
pub use error::{CompileError, CompileErrorKind, LexError, RuntimeError, RuntimeErrorKind};
pub use lexer::{is_var_name, is_variable_reference, Lexer, Token, TokenKind};
pub use operations::default_operations;
pub use parser::{parse, Includes, NoIncludes};
pub use program::{Instruction, InstructionList, UNRESOLVED};
pub use runner::{RunConfig, SetupEnv, SetupFn, TestCaseResult, TestResult, TestRunner, TestRunnerBuilder};
pub use schema::{is_control_keyword, OperationSchema, ParamDescriptor, ParseMode, Schema, TypeHint, CONTROL_KEYWORDS};
pub use session::{
    compile_pattern, DeviceSession, EventLog, ExpectMatch, OutputBuffer, ScriptedSession, SessionError, SessionEvent,
    ShellSession,
};
pub use sink::{LogSink, MemorySink, Outcome, ResultSink};
pub use state::{AbortHandle, Frame, FrameKind, RunStatus, SessionFactory, State};
pub use vars::{substitute_config, substitute_runtime, ConfigError, ConfigSource, StaticConfig};

// Convenience functions for cargo test integration
pub use runner::{run, run_and_assert, run_and_assert_with};
