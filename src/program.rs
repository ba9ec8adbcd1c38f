//! Compiled instruction lists
//!
//! An [`InstructionList`] is the flat output of the parser. Jump targets
//! are indices into the same list; an index equal to the list length
//! means "run to completion".
//!
//! The text form writes one instruction per line:
//!
//! ```text
//! 3 if {$count} lt 3 @5 @9
//! 4 execute "get system status"
//! ```
//!
//! and [`InstructionList::from_text`] reads it back.

use std::fmt;

/// Placeholder for a target the parser has not patched yet
pub const UNRESOLVED: usize = usize::MAX;

/// One unit of compiled work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Source line the instruction came from
    pub line: usize,
    pub operation: String,
    /// Positional parameters, defaults already filled in
    pub params: Vec<String>,
    /// Jump targets, empty for sequential instructions
    pub targets: Vec<usize>,
}

impl Instruction {
    pub fn new(line: usize, operation: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            line,
            operation: operation.into(),
            params,
            targets: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: Vec<usize>) -> Self {
        self.targets = targets;
        self
    }

    /// Whether the engine handles this instruction itself
    pub fn is_control(&self) -> bool {
        crate::schema::is_control_keyword(&self.operation)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.line, self.operation)?;
        for p in &self.params {
            write!(f, " {}", quote_param(p))?;
        }
        for t in &self.targets {
            if *t == UNRESOLVED {
                write!(f, " @?")?;
            } else {
                write!(f, " @{}", t)?;
            }
        }
        Ok(())
    }
}

/// The compiled form of one source file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionList {
    /// Cache key or file name the list was compiled from
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl InstructionList {
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            instructions,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// First instruction whose targets are unpatched or out of range
    pub fn unresolved_target(&self) -> Option<&Instruction> {
        let len = self.instructions.len();
        self.instructions
            .iter()
            .find(|i| i.targets.iter().any(|&t| t == UNRESOLVED || t > len))
    }

    /// Render the human-readable text form
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for instr in &self.instructions {
            out.push_str(&instr.to_string());
            out.push('\n');
        }
        out
    }

    /// Parse the text form written by [`InstructionList::to_text`].
    pub fn from_text(name: impl Into<String>, text: &str) -> Result<Self, String> {
        let mut instructions = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let fields = split_fields(raw).map_err(|e| format!("line {}: {}", i + 1, e))?;
            let mut fields = fields.into_iter();

            let line = match fields.next() {
                Some(Field::Bare(s)) => s
                    .parse::<usize>()
                    .map_err(|_| format!("line {}: bad source line {:?}", i + 1, s))?,
                _ => return Err(format!("line {}: missing source line", i + 1)),
            };
            let operation = match fields.next() {
                Some(Field::Bare(s)) => s,
                _ => return Err(format!("line {}: missing operation", i + 1)),
            };

            let mut params = Vec::new();
            let mut targets = Vec::new();
            for field in fields {
                match field {
                    Field::Target(t) => targets.push(t),
                    Field::Bare(s) | Field::Quoted(s) => {
                        if !targets.is_empty() {
                            return Err(format!("line {}: parameter after jump target", i + 1));
                        }
                        params.push(s);
                    }
                }
            }
            instructions.push(Instruction {
                line,
                operation,
                params,
                targets,
            });
        }
        Ok(Self::new(name, instructions))
    }
}

impl fmt::Display for InstructionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

fn quote_param(p: &str) -> String {
    let needs_quotes = p.is_empty()
        || p.starts_with('@')
        || p.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\');
    if !needs_quotes {
        return p.to_string();
    }
    let mut out = String::with_capacity(p.len() + 2);
    out.push('"');
    for c in p.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

enum Field {
    Bare(String),
    Quoted(String),
    Target(usize),
}

fn split_fields(line: &str) -> Result<Vec<Field>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    None => return Err("unterminated quoted parameter".into()),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some('t') => s.push('\t'),
                        Some('r') => s.push('\r'),
                        Some(other) => s.push(other),
                        None => return Err("unterminated escape".into()),
                    },
                    Some(other) => s.push(other),
                }
            }
            fields.push(Field::Quoted(s));
            continue;
        }
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            word.push(c);
            chars.next();
        }
        if let Some(t) = word.strip_prefix('@') {
            let t = t.parse().map_err(|_| format!("bad jump target {:?}", word))?;
            fields.push(Field::Target(t));
        } else {
            fields.push(Field::Bare(word));
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstructionList {
        InstructionList::new("main.dvs", vec![
            Instruction::new(1, "switch_device", vec!["FGT_A".into()]),
            Instruction::new(2, "if", vec!["{$x}".into(), "eq".into(), "".into()]).with_targets(vec![4, 4]),
            Instruction::new(3, "execute", vec!["get system status".into()]),
            Instruction::new(4, "fi", vec![]),
            Instruction::new(5, "comment", vec!["say \"hi\"\\\n".into()]),
            Instruction::new(6, "strset", vec!["x".into(), "@home".into()]),
        ])
    }

    #[test]
    fn test_to_text() {
        let text = sample().to_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "1 switch_device FGT_A");
        assert_eq!(lines[1], "2 if {$x} eq \"\" @4 @4");
        assert_eq!(lines[2], "3 execute \"get system status\"");
        assert_eq!(lines[4], r#"5 comment "say \"hi\"\\\n""#);
        assert_eq!(lines[5], "6 strset x \"@home\"");
    }

    #[test]
    fn test_text_round_trip() {
        let list = sample();
        let parsed = InstructionList::from_text("main.dvs", &list.to_text()).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn test_from_text_errors() {
        assert!(InstructionList::from_text("x", "abc if").is_err());
        assert!(InstructionList::from_text("x", "1 if \"open").is_err());
        assert!(InstructionList::from_text("x", "1 if @2 x").is_err());
        assert!(InstructionList::from_text("x", "1 if @z").is_err());
    }

    #[test]
    fn test_unresolved_target() {
        let mut list = sample();
        assert!(list.unresolved_target().is_none());
        list.instructions[1].targets[0] = UNRESOLVED;
        assert_eq!(list.unresolved_target().map(|i| i.line), Some(2));
        list.instructions[1].targets[0] = 99;
        assert!(list.unresolved_target().is_some());
    }
}
