//! Operation schema registry
//!
//! Maps operation names to their parse mode and parameter descriptors.
//! The built-in table is declared statically below and validated once on
//! first use; callers that register extension operations clone it into an
//! owned [`Schema`] and [`Schema::insert`] their own entries.

use std::collections::HashMap;
use std::sync::OnceLock;

/// How the arguments of an operation are written in a script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Arguments bind to parameters in order
    Positional,
    /// Arguments are `-flag value` pairs in any order
    Flagged,
}

/// The type a parameter's literal must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    /// Any single token
    Str,
    /// Integer literal or variable reference
    Int,
    /// Runtime variable name, `{$NAME}` or `NAME`, normalized to `NAME`
    VarName,
    /// Rest of the statement, joined with single spaces
    Text,
}

/// Describes one parameter of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    /// Flag for flagged operations (`-e`); empty for positional ones
    pub flag: String,
    /// Name used in diagnostics
    pub name: String,
    /// Index in the emitted parameter list
    pub position: usize,
    pub required: bool,
    pub default: Option<String>,
    pub type_hint: TypeHint,
}

/// Schema entry for one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSchema {
    pub name: String,
    pub mode: ParseMode,
    /// Ordered by position
    pub params: Vec<ParamDescriptor>,
}

impl OperationSchema {
    /// Find a parameter by flag (`-t`)
    pub fn by_flag(&self, flag: &str) -> Option<&ParamDescriptor> {
        self.params.iter().find(|p| p.flag == flag)
    }

    /// Check that positions are unique and dense and that required
    /// parameters carry no default.
    pub fn validate(&self) -> Result<(), String> {
        for (i, p) in self.params.iter().enumerate() {
            if p.position != i {
                return Err(format!("{}: parameter {} has position {}, want {}",
                    self.name, p.name, p.position, i));
            }
            if p.required && p.default.is_some() {
                return Err(format!("{}: required parameter {} has a default", self.name, p.name));
            }
            if p.type_hint == TypeHint::Text && i + 1 != self.params.len() {
                return Err(format!("{}: text parameter {} must be last", self.name, p.name));
            }
            if self.mode == ParseMode::Flagged && !p.flag.starts_with('-') {
                return Err(format!("{}: flagged parameter {} has no flag", self.name, p.name));
            }
        }
        Ok(())
    }

    /// One-line usage string, e.g. `expect -e pattern [-t timeout]`
    pub fn usage(&self) -> String {
        let mut out = self.name.clone();
        for p in &self.params {
            let body = match self.mode {
                ParseMode::Flagged => format!("{} {}", p.flag, p.name),
                ParseMode::Positional if p.type_hint == TypeHint::Text => format!("{}...", p.name),
                ParseMode::Positional => p.name.clone(),
            };
            if p.required {
                out.push_str(&format!(" {}", body));
            } else {
                out.push_str(&format!(" [{}]", body));
            }
        }
        out
    }
}

/// Control keywords handled by the parser's block state machine
pub const CONTROL_KEYWORDS: &[&str] = &["if", "elseif", "else", "fi", "while", "endwhile", "loop", "until"];

/// Whether `name` is a control keyword
pub fn is_control_keyword(name: &str) -> bool {
    CONTROL_KEYWORDS.contains(&name)
}

// Declarative built-in table: (flag, name, required, default, type).
type Row = (&'static str, &'static str, bool, Option<&'static str>, TypeHint);

const CONDITION: &[Row] = &[
    ("", "lhs", false, Some(""), TypeHint::Str),
    ("", "op", false, Some(""), TypeHint::Str),
    ("", "rhs", false, Some(""), TypeHint::Str),
];

const BUILTIN: &[(&str, ParseMode, &[Row])] = &[
    ("switch_device", ParseMode::Positional, &[
        ("", "name", true, None, TypeHint::Str),
    ]),
    ("execute", ParseMode::Positional, &[
        ("", "command", true, None, TypeHint::Text),
    ]),
    ("expect", ParseMode::Flagged, &[
        ("-e", "pattern", true, None, TypeHint::Str),
        ("-for", "testcase", false, Some(""), TypeHint::Str),
        ("-t", "timeout", false, Some("5"), TypeHint::Int),
        ("-fail", "fail", false, Some("unmatch"), TypeHint::Str),
        ("-retry_command", "retry_command", false, Some(""), TypeHint::Str),
        ("-retry_cnt", "retry_cnt", false, Some("3"), TypeHint::Int),
        ("-clear", "clear", false, Some("yes"), TypeHint::Str),
    ]),
    ("setvar", ParseMode::Flagged, &[
        ("-e", "pattern", true, None, TypeHint::Str),
        ("-to", "name", true, None, TypeHint::VarName),
        ("-t", "timeout", false, Some("5"), TypeHint::Int),
    ]),
    ("strset", ParseMode::Positional, &[
        ("", "name", true, None, TypeHint::VarName),
        ("", "value", false, Some(""), TypeHint::Text),
    ]),
    ("intset", ParseMode::Positional, &[
        ("", "name", true, None, TypeHint::VarName),
        ("", "value", true, None, TypeHint::Int),
    ]),
    ("listset", ParseMode::Positional, &[
        ("", "name", true, None, TypeHint::VarName),
        ("", "items", false, Some(""), TypeHint::Text),
    ]),
    ("intchange", ParseMode::Positional, &[
        ("", "name", true, None, TypeHint::VarName),
        ("", "operator", true, None, TypeHint::Str),
        ("", "operand", true, None, TypeHint::Int),
    ]),
    ("compare", ParseMode::Flagged, &[
        ("-v1", "value1", true, None, TypeHint::Str),
        ("-v2", "value2", true, None, TypeHint::Str),
        ("-for", "testcase", false, Some(""), TypeHint::Str),
        ("-fail", "fail", false, Some("unmatch"), TypeHint::Str),
    ]),
    ("check_var", ParseMode::Flagged, &[
        ("-name", "name", true, None, TypeHint::VarName),
        ("-value", "value", false, Some(""), TypeHint::Str),
        ("-pattern", "pattern", false, Some(""), TypeHint::Str),
        ("-for", "testcase", false, Some(""), TypeHint::Str),
        ("-fail", "fail", false, Some("unmatch"), TypeHint::Str),
    ]),
    ("report", ParseMode::Positional, &[
        ("", "testcase", true, None, TypeHint::Str),
    ]),
    ("sleep", ParseMode::Positional, &[
        ("", "seconds", true, None, TypeHint::Int),
    ]),
    ("comment", ParseMode::Positional, &[
        ("", "text", false, Some(""), TypeHint::Text),
    ]),
    ("breakpoint", ParseMode::Positional, &[]),
    ("if", ParseMode::Positional, CONDITION),
    ("elseif", ParseMode::Positional, CONDITION),
    ("else", ParseMode::Positional, &[]),
    ("fi", ParseMode::Positional, &[]),
    ("while", ParseMode::Positional, CONDITION),
    ("endwhile", ParseMode::Positional, CONDITION),
    ("loop", ParseMode::Positional, CONDITION),
    ("until", ParseMode::Positional, CONDITION),
];

/// The operation schema registry
#[derive(Debug, Clone, Default)]
pub struct Schema {
    ops: HashMap<String, OperationSchema>,
}

impl Schema {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared built-in registry, built on first use
    pub fn builtin() -> &'static Schema {
        static BUILTIN_SCHEMA: OnceLock<Schema> = OnceLock::new();
        BUILTIN_SCHEMA.get_or_init(Schema::with_builtins)
    }

    /// An owned copy of the built-in table, ready for extension
    pub fn with_builtins() -> Self {
        let mut schema = Schema::new();
        for (name, mode, rows) in BUILTIN {
            let params = rows
                .iter()
                .enumerate()
                .map(|(position, (flag, pname, required, default, type_hint))| ParamDescriptor {
                    flag: flag.to_string(),
                    name: pname.to_string(),
                    position,
                    required: *required,
                    default: default.map(str::to_string),
                    type_hint: *type_hint,
                })
                .collect();
            schema.ops.insert(name.to_string(), OperationSchema {
                name: name.to_string(),
                mode: *mode,
                params,
            });
        }
        schema
    }

    /// Register an operation, replacing any entry with the same name
    pub fn insert(&mut self, op: OperationSchema) -> Result<(), String> {
        op.validate()?;
        self.ops.insert(op.name.clone(), op);
        Ok(())
    }

    /// Look up an operation by name
    pub fn lookup(&self, name: &str) -> Option<&OperationSchema> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Operation names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Iterate all entries
    pub fn iter(&self) -> impl Iterator<Item = &OperationSchema> {
        self.ops.values()
    }
}
