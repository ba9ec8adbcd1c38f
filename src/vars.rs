//! Configuration variables and two-phase substitution
//!
//! `$NAME` references come from a read-only [`ConfigSource`], optionally
//! scoped by the active device. `{$NAME}` references come from the runtime
//! variables owned by a run. The configuration pass always runs first.

use std::collections::HashMap;

use thiserror::Error;

use crate::error::RuntimeError;
use crate::lexer::is_var_name;

/// Read-only source of configuration variables
pub trait ConfigSource: Send + Sync {
    /// Resolve `name`, preferring a value scoped to `device`
    fn resolve(&self, name: &str, device: Option<&str>) -> Option<String>;
}

/// Errors loading configuration variables
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line {line}: expected KEY=VALUE, got {text:?}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: invalid variable name {name:?}")]
    InvalidName { line: usize, name: String },
}

/// In-memory configuration: global values plus per-device overrides
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    global: HashMap<String, String>,
    devices: HashMap<String, HashMap<String, String>>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a global value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.global.insert(key.into(), value.into());
    }

    /// Set a value visible only while `device` is active
    pub fn set_for(&mut self, device: impl Into<String>, key: impl Into<String>, value: impl Into<String>) {
        self.devices
            .entry(device.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Apply one `[DEVICE:]KEY=VALUE` assignment
    pub fn assign(&mut self, text: &str) -> Result<(), ConfigError> {
        self.assign_at(text, None, 1)
    }

    /// Load `KEY=VALUE` lines. `[DEVICE]` headers scope the lines that
    /// follow; `#` starts a comment line.
    pub fn load_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut device: Option<String> = None;
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                device = if name.is_empty() { None } else { Some(name.to_string()) };
                continue;
            }
            self.assign_at(line, device.as_deref(), i + 1)?;
        }
        Ok(())
    }

    fn assign_at(&mut self, text: &str, device: Option<&str>, line: usize) -> Result<(), ConfigError> {
        let (key, value) = text.split_once('=').ok_or_else(|| ConfigError::Malformed {
            line,
            text: text.to_string(),
        })?;
        let key = key.trim();
        let (device, key) = match key.split_once(':') {
            Some((dev, k)) => (Some(dev.trim()), k.trim()),
            None => (device, key),
        };
        if !is_var_name(key) {
            return Err(ConfigError::InvalidName {
                line,
                name: key.to_string(),
            });
        }
        match device {
            Some(dev) => self.set_for(dev, key, value.trim()),
            None => self.set(key, value.trim()),
        }
        Ok(())
    }
}

impl ConfigSource for StaticConfig {
    fn resolve(&self, name: &str, device: Option<&str>) -> Option<String> {
        device
            .and_then(|d| self.devices.get(d))
            .and_then(|vars| vars.get(name))
            .or_else(|| self.global.get(name))
            .cloned()
    }
}

/// Replace `$NAME` references with configuration values.
///
/// Unresolved references stay verbatim, so `$` keeps working as a regex
/// anchor. The `$` of a `{$NAME}` reference is left for the runtime pass.
pub fn substitute_config(s: &str, source: &dyn ConfigSource, device: Option<&str>) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        if c != '$' || prev == Some('{') {
            result.push(c);
            prev = Some(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            let valid = if name.is_empty() {
                n.is_ascii_alphabetic() || n == '_'
            } else {
                n.is_ascii_alphanumeric() || n == '_'
            };
            if !valid {
                break;
            }
            name.push(n);
            chars.next();
        }

        match source.resolve(&name, device) {
            Some(value) if !name.is_empty() => result.push_str(&value),
            _ => {
                result.push('$');
                result.push_str(&name);
            }
        }
        prev = name.chars().last().or(Some('$'));
    }

    result
}

/// Replace `{$NAME}` references using `lookup`. An unbound name is an error.
pub fn substitute_runtime(
    s: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, RuntimeError> {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("{$") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_var_name(&after[..end]) => {
                let name = &after[..end];
                let value = lookup(name).ok_or_else(|| RuntimeError::unbound(name))?;
                result.push_str(&value);
                rest = &after[end + 1..];
            }
            _ => {
                result.push_str("{$");
                rest = after;
            }
        }
    }
    result.push_str(rest);

    Ok(result)
}
