//! strset / intset / listset / intchange: runtime variables

use crate::engine::{OpResult, OpUsage, Operation};
use crate::error::RuntimeError;
use crate::state::State;

use super::{int_param, param};

fn name_param<'a>(op: &str, params: &'a [String], args: &str) -> Result<&'a str, RuntimeError> {
    let name = param(params, 0);
    if name.is_empty() {
        return Err(RuntimeError::usage(op, args));
    }
    Ok(name)
}

pub(super) struct StrSetOp;

impl Operation for StrSetOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let name = name_param("strset", params, "name [value...]")?;
        state.set_var(name, param(params, 1));
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Set a string variable".into(),
            args: "name [value...]".into(),
        }
    }
}

pub(super) struct IntSetOp;

impl Operation for IntSetOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let name = name_param("intset", params, "name value")?;
        let value = int_param("intset", "value", param(params, 1))?;
        state.set_var(name, value.to_string());
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Set an integer variable".into(),
            args: "name value".into(),
        }
    }
}

/// Stores items separated by commas or whitespace as one comma-separated
/// value.
pub(super) struct ListSetOp;

impl Operation for ListSetOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let name = name_param("listset", params, "name [items...]")?;
        let items: Vec<&str> = param(params, 1)
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();
        state.set_var(name, items.join(","));
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Set a list variable".into(),
            args: "name [items...]".into(),
        }
    }
}

pub(super) struct IntChangeOp;

impl Operation for IntChangeOp {
    fn run(&self, state: &mut State, params: &[String]) -> Result<OpResult, RuntimeError> {
        let name = name_param("intchange", params, "name operator operand")?;
        let current = state.var(name).ok_or_else(|| RuntimeError::unbound(name))?;
        let current = int_param("intchange", name, current)?;
        let operand = int_param("intchange", "operand", param(params, 2))?;

        let result = match param(params, 1) {
            "+" => current.checked_add(operand),
            "-" => current.checked_sub(operand),
            "*" => current.checked_mul(operand),
            "/" | "%" if operand == 0 => {
                return Err(RuntimeError::arithmetic(format!("intchange: {} by zero", param(params, 1))));
            }
            "/" => current.checked_div(operand),
            "%" => current.checked_rem(operand),
            other => {
                return Err(RuntimeError::usage(
                    "intchange",
                    &format!("name (+|-|*|/|%) operand, got operator {:?}", other),
                ))
            }
        };
        let result = result.ok_or_else(|| {
            RuntimeError::arithmetic(format!(
                "intchange: {} {} {} overflows",
                current,
                param(params, 1),
                operand
            ))
        })?;
        state.set_var(name, result.to_string());
        Ok(OpResult::Continue)
    }

    fn usage(&self) -> OpUsage {
        OpUsage {
            summary: "Apply arithmetic to an integer variable".into(),
            args: "name (+|-|*|/|%) operand".into(),
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

    fn state() -> State {
        State::new(Arc::new(StaticConfig::new()), Arc::new(MemorySink::new()))
    }

    fn run(op: &dyn Operation, state: &mut State, p: &[&str]) -> Result<OpResult, RuntimeError> {
        let params: Vec<String> = p.iter().map(|s| s.to_string()).collect();
        op.run(state, &params)
    }

    #[test]
    fn test_set_ops() {
        let mut s = state();
        run(&StrSetOp, &mut s, &["greeting", "hello world"]).unwrap();
        run(&IntSetOp, &mut s, &["n", "-4"]).unwrap();
        run(&ListSetOp, &mut s, &["ports", "port1, port2 port3"]).unwrap();
        assert_eq!(s.var("greeting"), Some("hello world"));
        assert_eq!(s.var("n"), Some("-4"));
        assert_eq!(s.var("ports"), Some("port1,port2,port3"));
        assert_eq!(
            run(&IntSetOp, &mut s, &["n", "four"]).unwrap_err().kind,
            RuntimeErrorKind::Arithmetic
        );
    }

    #[test]
    fn test_intchange() {
        let mut s = state();
        s.set_var("n", "7");
        run(&IntChangeOp, &mut s, &["n", "+", "3"]).unwrap();
        assert_eq!(s.var("n"), Some("10"));
        run(&IntChangeOp, &mut s, &["n", "%", "4"]).unwrap();
        assert_eq!(s.var("n"), Some("2"));
        run(&IntChangeOp, &mut s, &["n", "*", "-5"]).unwrap();
        assert_eq!(s.var("n"), Some("-10"));
    }

    #[test]
    fn test_intchange_errors() {
        let mut s = state();
        assert_eq!(
            run(&IntChangeOp, &mut s, &["missing", "+", "1"]).unwrap_err().kind,
            RuntimeErrorKind::UnboundVariable
        );
        s.set_var("n", "1");
        assert_eq!(
            run(&IntChangeOp, &mut s, &["n", "/", "0"]).unwrap_err().kind,
            RuntimeErrorKind::Arithmetic
        );
        assert_eq!(
            run(&IntChangeOp, &mut s, &["n", "^", "2"]).unwrap_err().kind,
            RuntimeErrorKind::Usage
        );
        s.set_var("big", i64::MAX.to_string());
        assert_eq!(
            run(&IntChangeOp, &mut s, &["big", "+", "1"]).unwrap_err().kind,
            RuntimeErrorKind::Arithmetic
        );
        // failed changes leave the value alone
        assert_eq!(s.var("n"), Some("1"));
    }
}
