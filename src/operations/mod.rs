//! Built-in operations
//!
//! Every schema operation except the control keywords has a handler here.
//! Handlers receive parameters in schema position order with defaults
//! filled in and both substitution passes applied.

mod check;
mod device;
mod expect;
mod flow;
mod vars;

use std::collections::HashMap;

use crate::engine::BoxedOp;
use crate::error::{RuntimeError, RuntimeErrorKind};

/// Return the default set of built-in operations
pub fn default_operations() -> HashMap<String, BoxedOp> {
    let mut ops: HashMap<String, BoxedOp> = HashMap::new();
    ops.insert("switch_device".into(), Box::new(device::SwitchDeviceOp));
    ops.insert("execute".into(), Box::new(device::ExecuteOp));
    ops.insert("expect".into(), Box::new(expect::ExpectOp));
    ops.insert("setvar".into(), Box::new(expect::SetVarOp));
    ops.insert("strset".into(), Box::new(vars::StrSetOp));
    ops.insert("intset".into(), Box::new(vars::IntSetOp));
    ops.insert("listset".into(), Box::new(vars::ListSetOp));
    ops.insert("intchange".into(), Box::new(vars::IntChangeOp));
    ops.insert("compare".into(), Box::new(check::CompareOp));
    ops.insert("check_var".into(), Box::new(check::CheckVarOp));
    ops.insert("report".into(), Box::new(check::ReportOp));
    ops.insert("sleep".into(), Box::new(flow::SleepOp));
    ops.insert("comment".into(), Box::new(flow::CommentOp));
    ops.insert("breakpoint".into(), Box::new(flow::BreakpointOp));
    ops
}

/// Parameter `i`, empty when absent
fn param(params: &[String], i: usize) -> &str {
    params.get(i).map(String::as_str).unwrap_or("")
}

/// Parse an integer parameter
fn int_param(op: &str, name: &str, value: &str) -> Result<i64, RuntimeError> {
    value.trim().parse::<i64>().map_err(|_| {
        RuntimeError::arithmetic(format!("{}: {} is not an integer: {:?}", op, name, value))
    })
}

/// Parse a `-fail` value into whether the check expects a match.
/// `unmatch` fails when the values do not match; `match` fails when they do.
fn expects_match(op: &str, fail: &str) -> Result<bool, RuntimeError> {
    match fail {
        "unmatch" | "" => Ok(true),
        "match" => Ok(false),
        other => Err(RuntimeError::new(
            RuntimeErrorKind::Usage,
            format!("{}: -fail must be match or unmatch, got {:?}", op, other),
        )),
    }
}

/// Parse a yes/no switch
fn yes_no(op: &str, name: &str, value: &str) -> Result<bool, RuntimeError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Ok(true),
        "no" | "n" | "false" | "0" => Ok(false),
        _ => Err(RuntimeError::new(
            RuntimeErrorKind::Usage,
            format!("{}: {} must be yes or no, got {:?}", op, name, value),
        )),
    }
}
