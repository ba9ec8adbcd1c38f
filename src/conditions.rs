//! Conditions for `if`, `elseif`, `while`, `endwhile`, `loop` and `until`
//!
//! A condition is a lone operand or `lhs op rhs`. When both operands parse
//! as numbers they compare numerically, otherwise as strings.

use std::cmp::Ordering;

use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::lexer::is_number;

/// A comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Comparison {
    /// Parse `eq`/`==`, `ne`/`!=`, `lt`/`<`, `gt`/`>`, `le`/`<=`, `ge`/`>=`
    pub fn parse(s: &str) -> Option<Comparison> {
        match s {
            "eq" | "==" => Some(Comparison::Eq),
            "ne" | "!=" => Some(Comparison::Ne),
            "lt" | "<" => Some(Comparison::Lt),
            "gt" | ">" => Some(Comparison::Gt),
            "le" | "<=" => Some(Comparison::Le),
            "ge" | ">=" => Some(Comparison::Ge),
            _ => None,
        }
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            Comparison::Eq => ord == Ordering::Equal,
            Comparison::Ne => ord != Ordering::Equal,
            Comparison::Lt => ord == Ordering::Less,
            Comparison::Gt => ord == Ordering::Greater,
            Comparison::Le => ord != Ordering::Greater,
            Comparison::Ge => ord != Ordering::Less,
        }
    }
}

/// Whether a lone operand counts as true
pub fn truthy(s: &str) -> bool {
    let s = s.trim();
    !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false"))
}

/// Compare two operands with `op`
pub fn compare(lhs: &str, op: Comparison, rhs: &str) -> bool {
    let (l, r) = (lhs.trim(), rhs.trim());
    let ord = if is_number(l) && is_number(r) {
        match (l.parse::<f64>(), r.parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => lhs.cmp(rhs),
        }
    } else {
        lhs.cmp(rhs)
    };
    op.holds(ord)
}

/// Evaluate resolved condition parameters `[lhs, op, rhs]`.
/// Missing trailing parameters are empty strings.
pub fn evaluate(params: &[String]) -> Result<bool, RuntimeError> {
    let get = |i: usize| params.get(i).map(String::as_str).unwrap_or("");
    let (lhs, op, rhs) = (get(0), get(1), get(2));

    if op.is_empty() {
        if !rhs.is_empty() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::Usage,
                format!("condition has an operand but no operator: {:?} {:?}", lhs, rhs),
            ));
        }
        return Ok(truthy(lhs));
    }

    let cmp = Comparison::parse(op).ok_or_else(|| {
        RuntimeError::new(RuntimeErrorKind::Usage, format!("unknown comparison operator {:?}", op))
    })?;
    Ok(compare(lhs, cmp, rhs))
}
