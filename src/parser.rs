//! Statement parser
//!
//! Turns tokens into a flat [`InstructionList`] in one pass. There is no
//! syntax tree: control-flow keywords push markers on a parse-time block
//! stack, and the jump targets of earlier instructions are patched when the
//! matching alternate or closing keyword is reached.
//!
//! Target layout:
//! - `if` / `elseif`: `[next, end]`, where `next` is the following
//!   `elseif`/`else` or `end` when there is none
//! - `else`: `[end]`
//! - `while` / `loop`: `[exit]`, one past the terminator
//! - `endwhile` / `until`: `[entry]`, the opening instruction
//!
//! `end` is one past the `fi`.

use std::sync::Arc;

use crate::conditions::Comparison;
use crate::error::{CompileError, CompileErrorKind};
use crate::lexer::{is_var_name, Token, TokenKind};
use crate::program::{Instruction, InstructionList, UNRESOLVED};
use crate::schema::{is_control_keyword, OperationSchema, ParamDescriptor, ParseMode, Schema, TypeHint};

/// Supplies compiled instruction lists for `include` directives
pub trait Includes {
    /// Compile (or fetch from cache) the file named by `path`. `device` is
    /// the includer's active device, used to scope `$NAME` in the path.
    fn include(
        &mut self,
        path: &str,
        device: Option<&str>,
        line: usize,
    ) -> Result<Arc<InstructionList>, CompileError>;
}

/// Rejects every include
pub struct NoIncludes;

impl Includes for NoIncludes {
    fn include(
        &mut self,
        path: &str,
        _device: Option<&str>,
        line: usize,
    ) -> Result<Arc<InstructionList>, CompileError> {
        Err(CompileError::new(
            CompileErrorKind::IncludeNotFound,
            line,
            format!("{}: includes are not available here", path),
        ))
    }
}

/// Parse `tokens` into an instruction list named `name`.
pub fn parse(
    name: &str,
    tokens: &[Token],
    schema: &Schema,
    includes: &mut dyn Includes,
) -> Result<InstructionList, CompileError> {
    let mut parser = Parser {
        schema,
        includes,
        out: Vec::new(),
        blocks: Vec::new(),
        device: None,
        restore: None,
    };

    let mut i = 0;
    while i < tokens.len() {
        let head = &tokens[i];
        let mut j = i + 1;
        while j < tokens.len() && !tokens[j].kind.is_head() {
            j += 1;
        }
        parser.statement(head, &tokens[i + 1..j])?;
        i = j;
    }

    parser.finish(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    While,
    Loop,
}

impl BlockKind {
    fn opener(&self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::While => "while",
            BlockKind::Loop => "loop",
        }
    }
}

/// An open block on the parse-time stack
struct Block {
    kind: BlockKind,
    line: usize,
    /// Index of the opening instruction
    opener: usize,
    /// Instruction whose `next` target is still unpatched
    pending: Option<usize>,
    /// `if`/`elseif`/`else` instructions waiting for the `end` target
    branches: Vec<usize>,
    has_else: bool,
}

struct Parser<'a> {
    schema: &'a Schema,
    includes: &'a mut dyn Includes,
    out: Vec<Instruction>,
    blocks: Vec<Block>,
    /// Device selected by the most recent section header
    device: Option<String>,
    /// Device to switch back to after an include changed it
    restore: Option<String>,
}

impl<'a> Parser<'a> {
    fn statement(&mut self, head: &Token, args: &[Token]) -> Result<(), CompileError> {
        let line = head.line;
        match head.kind {
            TokenKind::Comment => Ok(()),
            TokenKind::Section => {
                self.restore = None;
                self.device = Some(head.text.clone());
                self.out.push(Instruction::new(line, "switch_device", vec![head.text.clone()]));
                Ok(())
            }
            TokenKind::Command => {
                self.restore_device(line);
                self.out.push(Instruction::new(line, "execute", vec![head.text.clone()]));
                Ok(())
            }
            TokenKind::Include => {
                self.restore_device(line);
                self.include(head, args)
            }
            TokenKind::Keyword => self.keyword(head, args),
            TokenKind::Operation if is_control_keyword(&head.text) => self.keyword(head, args),
            TokenKind::Operation => {
                let op = self.schema.lookup(&head.text).ok_or_else(|| {
                    CompileError::new(
                        CompileErrorKind::UnknownOperation,
                        line,
                        format!("unknown operation {:?}", head.text),
                    )
                })?;
                let params = bind(op, args, line)?;
                self.restore_device(line);
                self.out.push(Instruction::new(line, op.name.clone(), params));
                Ok(())
            }
            _ => Err(CompileError::new(
                CompileErrorKind::UnknownOperation,
                line,
                format!("statement cannot start with {:?}", head.text),
            )),
        }
    }

    fn restore_device(&mut self, line: usize) {
        if let Some(device) = self.restore.take() {
            self.out.push(Instruction::new(line, "switch_device", vec![device]));
        }
    }

    fn include(&mut self, head: &Token, args: &[Token]) -> Result<(), CompileError> {
        let path = match args {
            [path] => path.text.clone(),
            [] => {
                return Err(CompileError::new(
                    CompileErrorKind::MissingRequiredParameter,
                    head.line,
                    "include: missing required parameter path",
                ))
            }
            [_, extra, ..] => {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownParameter,
                    extra.line,
                    format!("include: unexpected argument {:?}", extra.text),
                ))
            }
        };

        let list = self.includes.include(&path, self.device.as_deref(), head.line)?;
        let offset = self.out.len();
        let mut switches = false;
        for instr in list.iter() {
            let mut instr = instr.clone();
            for target in instr.targets.iter_mut() {
                *target += offset;
            }
            switches |= instr.operation == "switch_device";
            self.out.push(instr);
        }
        if switches {
            self.restore = self.device.clone();
        }
        Ok(())
    }

    fn keyword(&mut self, head: &Token, args: &[Token]) -> Result<(), CompileError> {
        let line = head.line;
        let name = head.text.as_str();
        let op = self.schema.lookup(name).ok_or_else(|| {
            CompileError::new(CompileErrorKind::UnknownOperation, line, format!("unknown keyword {:?}", name))
        })?;
        let params = bind(op, args, line)?;
        match name {
            "if" | "elseif" | "while" | "loop" | "until" => check_condition(name, &params, line, true)?,
            "endwhile" => check_condition(name, &params, line, false)?,
            _ => {}
        }

        self.restore_device(line);
        let idx = self.out.len();
        let instr = Instruction::new(line, name, params);

        match name {
            "if" => {
                self.out.push(instr.with_targets(vec![UNRESOLVED, UNRESOLVED]));
                self.blocks.push(Block {
                    kind: BlockKind::If,
                    line,
                    opener: idx,
                    pending: Some(idx),
                    branches: vec![idx],
                    has_else: false,
                });
            }
            "elseif" | "else" => {
                let block = match self.blocks.last_mut() {
                    Some(b) if b.kind == BlockKind::If && !b.has_else => b,
                    _ => return Err(unbalanced(name, line, self.blocks.last())),
                };
                if let Some(prev) = block.pending.take() {
                    self.out[prev].targets[0] = idx;
                }
                block.branches.push(idx);
                if name == "elseif" {
                    block.pending = Some(idx);
                    self.out.push(instr.with_targets(vec![UNRESOLVED, UNRESOLVED]));
                } else {
                    block.has_else = true;
                    self.out.push(instr.with_targets(vec![UNRESOLVED]));
                }
            }
            "fi" => {
                let block = self.close(BlockKind::If, name, line)?;
                let end = idx + 1;
                if let Some(prev) = block.pending {
                    self.out[prev].targets[0] = end;
                }
                for b in block.branches {
                    let branch = &mut self.out[b];
                    let slot = if branch.operation == "else" { 0 } else { 1 };
                    branch.targets[slot] = end;
                }
                self.out.push(instr);
            }
            "while" | "loop" => {
                let kind = if name == "while" { BlockKind::While } else { BlockKind::Loop };
                self.out.push(instr.with_targets(vec![UNRESOLVED]));
                self.blocks.push(Block {
                    kind,
                    line,
                    opener: idx,
                    pending: Some(idx),
                    branches: Vec::new(),
                    has_else: false,
                });
            }
            "endwhile" | "until" => {
                let kind = if name == "endwhile" { BlockKind::While } else { BlockKind::Loop };
                let block = self.close(kind, name, line)?;
                self.out[block.opener].targets[0] = idx + 1;
                self.out.push(instr.with_targets(vec![block.opener]));
            }
            _ => {
                return Err(CompileError::new(
                    CompileErrorKind::UnknownOperation,
                    line,
                    format!("keyword {:?} has no block handling", name),
                ))
            }
        }
        Ok(())
    }

    /// Pop the innermost block, which must be of `kind`
    fn close(&mut self, kind: BlockKind, name: &str, line: usize) -> Result<Block, CompileError> {
        match self.blocks.pop() {
            Some(b) if b.kind == kind => Ok(b),
            other => Err(unbalanced(name, line, other.as_ref())),
        }
    }

    fn finish(self, name: &str) -> Result<InstructionList, CompileError> {
        if let Some(block) = self.blocks.last() {
            return Err(CompileError::new(
                CompileErrorKind::UnterminatedBlock,
                block.line,
                format!("{} opened here is never closed", block.kind.opener()),
            ));
        }
        let list = InstructionList::new(name, self.out);
        if let Some(instr) = list.unresolved_target() {
            return Err(CompileError::new(
                CompileErrorKind::UnresolvedJumpTarget,
                instr.line,
                format!("{} has an unresolved jump target", instr.operation),
            ));
        }
        Ok(list)
    }
}

fn unbalanced(name: &str, line: usize, open: Option<&Block>) -> CompileError {
    let message = match open {
        Some(b) => format!("{} does not match {} opened at line {}", name, b.kind.opener(), b.line),
        None => format!("{} without an open block", name),
    };
    CompileError::new(CompileErrorKind::UnbalancedBlock, line, message)
}

fn check_condition(name: &str, params: &[String], line: usize, required: bool) -> Result<(), CompileError> {
    let get = |i: usize| params.get(i).map(String::as_str).unwrap_or("");
    if get(0).is_empty() {
        if required {
            return Err(CompileError::new(
                CompileErrorKind::MissingRequiredParameter,
                line,
                format!("{}: missing required condition", name),
            ));
        }
        return Ok(());
    }
    let op = get(1);
    if op.is_empty() {
        return Ok(());
    }
    if Comparison::parse(op).is_none() && !op.contains('$') {
        return Err(CompileError::new(
            CompileErrorKind::TypeMismatch,
            line,
            format!("{}: unknown comparison operator {:?}", name, op),
        ));
    }
    Ok(())
}

/// Bind statement arguments to the operation's parameter positions,
/// filling defaults.
fn bind(op: &OperationSchema, args: &[Token], line: usize) -> Result<Vec<String>, CompileError> {
    let mut values: Vec<Option<String>> = vec![None; op.params.len()];

    match op.mode {
        ParseMode::Positional => {
            for (k, tok) in args.iter().enumerate() {
                let p = op.params.get(k).ok_or_else(|| {
                    CompileError::new(
                        CompileErrorKind::UnknownParameter,
                        tok.line,
                        format!("{}: unexpected argument {:?}", op.name, tok.text),
                    )
                })?;
                if p.type_hint == TypeHint::Text {
                    let rest: Vec<&str> = args[k..].iter().map(|t| t.text.as_str()).collect();
                    values[k] = Some(rest.join(" "));
                    break;
                }
                values[k] = Some(convert(op, p, tok)?);
            }
        }
        ParseMode::Flagged => {
            let mut k = 0;
            while k < args.len() {
                let tok = &args[k];
                if tok.kind != TokenKind::Flag {
                    return Err(CompileError::new(
                        CompileErrorKind::UnknownParameter,
                        tok.line,
                        format!("{}: expected a flag, found {:?}", op.name, tok.text),
                    ));
                }
                let p = op.by_flag(&tok.text).ok_or_else(|| {
                    CompileError::new(
                        CompileErrorKind::UnknownParameter,
                        tok.line,
                        format!("{}: unknown flag {}", op.name, tok.text),
                    )
                })?;
                let value = args.get(k + 1).filter(|t| t.kind != TokenKind::Flag).ok_or_else(|| {
                    CompileError::new(
                        CompileErrorKind::MissingRequiredParameter,
                        tok.line,
                        format!("{}: flag {} requires a value", op.name, tok.text),
                    )
                })?;
                if values[p.position].is_some() {
                    return Err(CompileError::new(
                        CompileErrorKind::UnknownParameter,
                        tok.line,
                        format!("{}: flag {} given twice", op.name, tok.text),
                    ));
                }
                values[p.position] = Some(convert(op, p, value)?);
                k += 2;
            }
        }
    }

    values
        .into_iter()
        .zip(&op.params)
        .map(|(value, p)| match (value, &p.default) {
            (Some(v), _) => Ok(v),
            (None, Some(d)) => Ok(d.clone()),
            (None, None) if !p.required => Ok(String::new()),
            (None, None) => {
                let what = if p.flag.is_empty() {
                    p.name.clone()
                } else {
                    format!("{} ({})", p.flag, p.name)
                };
                Err(CompileError::new(
                    CompileErrorKind::MissingRequiredParameter,
                    line,
                    format!("{}: missing required parameter {}", op.name, what),
                ))
            }
        })
        .collect()
}

fn convert(
    op: &OperationSchema,
    p: &ParamDescriptor,
    tok: &Token,
) -> Result<String, CompileError> {
    let mismatch = |expected: &str| {
        CompileError::new(
            CompileErrorKind::TypeMismatch,
            tok.line,
            format!("{}: {} expects {}, found {:?}", op.name, p.name, expected, tok.text),
        )
    };

    match p.type_hint {
        TypeHint::VarName => {
            let text = tok.text.as_str();
            match tok.kind {
                TokenKind::VariableReference if text.starts_with("{$") => {
                    Ok(text[2..text.len() - 1].to_string())
                }
                TokenKind::Identifier if is_var_name(text) => Ok(text.to_string()),
                _ => Err(mismatch("a variable name")),
            }
        }
        TypeHint::Int => {
            if tok.kind == TokenKind::VariableReference
                || tok.text.contains('$')
                || tok.text.parse::<i64>().is_ok()
            {
                Ok(tok.text.clone())
            } else {
                Err(mismatch("an integer"))
            }
        }
        TypeHint::Str | TypeHint::Text => Ok(tok.text.clone()),
    }
}
