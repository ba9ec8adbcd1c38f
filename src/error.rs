//! Compile and runtime errors

use std::fmt;

/// A malformed token. Fatal to the file being compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
}

impl LexError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for LexError {}

/// The kind of compile error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Malformed token
    Lexical,
    /// Operation name absent from the schema
    UnknownOperation,
    /// Flag or positional argument the operation does not accept
    UnknownParameter,
    /// Required parameter not supplied
    MissingRequiredParameter,
    /// Literal of the wrong type for a parameter
    TypeMismatch,
    /// Jump target left unpatched or pointing outside the list
    UnresolvedJumpTarget,
    /// Block still open at end of file
    UnterminatedBlock,
    /// Closing or alternate keyword with no matching opener
    UnbalancedBlock,
    /// Include resolver could not find the file
    IncludeNotFound,
    /// File includes itself, directly or transitively
    IncludeCycle,
}

impl CompileErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompileErrorKind::Lexical => "lexical error",
            CompileErrorKind::UnknownOperation => "unknown operation",
            CompileErrorKind::UnknownParameter => "unknown parameter",
            CompileErrorKind::MissingRequiredParameter => "missing required parameter",
            CompileErrorKind::TypeMismatch => "type mismatch",
            CompileErrorKind::UnresolvedJumpTarget => "unresolved jump target",
            CompileErrorKind::UnterminatedBlock => "unterminated block",
            CompileErrorKind::UnbalancedBlock => "unbalanced block",
            CompileErrorKind::IncludeNotFound => "include not found",
            CompileErrorKind::IncludeCycle => "include cycle",
        }
    }
}

/// A compile error with file/line context. No instructions run once one
/// of these is raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: usize,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: None,
            line,
        }
    }

    /// Attach the file name, keeping one already set by a nested include.
    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        if self.file.is_none() {
            self.file = Some(file.into());
        }
        self
    }
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError::new(CompileErrorKind::Lexical, e.line, e.message)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:", file)?;
        }
        write!(f, "{}: {}: {}", self.line, self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CompileError {}

/// The kind of runtime error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Pattern not observed, comparison mismatch. Already recorded in the sink.
    AssertionFailed,
    /// `{$NAME}` referenced before it was set
    UnboundVariable,
    /// Integer parse failure, division by zero, overflow
    Arithmetic,
    /// `switch_device` to a name with no session bound
    UnknownDevice,
    /// Handler received arguments it cannot use
    Usage,
    /// The device session reported an error
    Session,
    /// Device I/O with no session bound to the active device
    NoSession,
    /// Run aborted through its abort handle
    Aborted,
}

impl RuntimeErrorKind {
    /// Fatal errors end the run regardless of strictness.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeErrorKind::NoSession | RuntimeErrorKind::Aborted)
    }
}

/// A runtime error raised by an operation handler or by the engine itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub line: Option<usize>,
    pub operation: Option<String>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            operation: None,
        }
    }

    pub fn with_location(mut self, line: usize, operation: impl Into<String>) -> Self {
        self.line = Some(line);
        self.operation = Some(operation.into());
        self
    }

    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::AssertionFailed, msg)
    }

    pub fn usage(op: &str, expected: &str) -> Self {
        Self::new(RuntimeErrorKind::Usage, format!("usage: {} {}", op, expected))
    }

    pub fn unbound(name: &str) -> Self {
        Self::new(RuntimeErrorKind::UnboundVariable, format!("variable {{${}}} is not set", name))
    }

    pub fn arithmetic(msg: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Arithmetic, msg)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line {
            write!(f, "{}:", line)?;
        }
        if let Some(ref op) = self.operation {
            write!(f, " {}: ", op)?;
        } else if self.line.is_some() {
            write!(f, " ")?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let e = CompileError::new(CompileErrorKind::UnknownOperation, 3, "foobar").in_file("main.dvs");
        assert_eq!(e.to_string(), "main.dvs:3: unknown operation: foobar");
    }

    #[test]
    fn test_in_file_keeps_innermost() {
        let e = CompileError::new(CompileErrorKind::TypeMismatch, 1, "x")
            .in_file("lib.dvs")
            .in_file("main.dvs");
        assert_eq!(e.file.as_deref(), Some("lib.dvs"));
    }

    #[test]
    fn test_runtime_error_display() {
        let e = RuntimeError::unbound("count").with_location(7, "intchange");
        assert_eq!(e.to_string(), "7: intchange: variable {$count} is not set");
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(RuntimeError::new(RuntimeErrorKind::NoSession, "x").is_fatal());
        assert!(!RuntimeError::assertion("x").is_fatal());
    }
}
