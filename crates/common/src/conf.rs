//! Configuration-file parser.
//!
//! The file is UTF-8 text, one `ident = value` assignment per line, `#`
//! comments, lines up to 4 KB. Identifiers match
//! `[-_A-Za-z][-_A-Za-z0-9]*`. Values are either plain (no whitespace,
//! control characters, `"`, `#`, `'`, `=` or `\`) or double-quoted with
//! the escape set of [`crate::strarray`]. Setting an unknown variable,
//! setting a variable twice, or omitting a required one is an error.
//!
//! Callers describe their variables as a slice of [`Var`]s pointing at
//! values implementing [`Value`]; custom syntaxes (hex keys, addresses)
//! are custom `Value` impls.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::strarray;

/// A settable configuration value.
pub trait Value {
    /// Installs the (already unquoted) string form, validating syntax.
    fn set(&mut self, raw: &str) -> Result<(), String>;
}

impl Value for String {
    fn set(&mut self, raw: &str) -> Result<(), String> {
        *self = raw.to_string();
        Ok(())
    }
}

impl Value for u64 {
    /// Accepts decimal, octal (leading `0`) and hex (leading `0x`).
    fn set(&mut self, raw: &str) -> Result<(), String> {
        *self = parse_u64_auto(raw).ok_or_else(|| "invalid number".to_string())?;
        Ok(())
    }
}

/// Parses an unsigned integer in the usual C manner:
/// `255 == 0377 == 0xff`.
pub fn parse_u64_auto(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// One configuration variable known to the parser.
pub struct Var<'a> {
    pub name: &'static str,
    pub required: bool,
    pub value: &'a mut dyn Value,
    set: bool,
}

impl<'a> Var<'a> {
    pub fn new(name: &'static str, value: &'a mut dyn Value) -> Self {
        Var { name, required: false, value, set: false }
    }

    pub fn required(name: &'static str, value: &'a mut dyn Value) -> Self {
        Var { name, required: true, value, set: false }
    }
}

/// Parse failure, pointing at file, line and identifier where known.
#[derive(Debug)]
pub struct ConfError {
    pub file: String,
    /// 1-based line number, 0 when the error is not tied to a line.
    pub line: usize,
    pub ident: String,
    pub msg: String,
}

impl fmt::Display for ConfError {
    /// `file:[line:][ ident:] message`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.file)?;
        if self.line != 0 {
            write!(f, "{}:", self.line)?;
        }
        if !self.ident.is_empty() {
            write!(f, " {}:", self.ident)?;
        }
        write!(f, " {}", self.msg)
    }
}

impl std::error::Error for ConfError {}

const MAX_LINE: usize = 4096;

struct Parser<'v, 'a> {
    file: String,
    line: usize,
    ident: String,
    vars: &'v mut [Var<'a>],
}

impl<'v, 'a> Parser<'v, 'a> {
    fn err(&self, msg: impl Into<String>) -> ConfError {
        ConfError {
            file: self.file.clone(),
            line: self.line,
            ident: self.ident.clone(),
            msg: msg.into(),
        }
    }

    fn set_value(&mut self, raw: &str) -> Result<(), ConfError> {
        let ident = self.ident.clone();
        let Some(i) = self.vars.iter().position(|v| v.name == ident) else {
            return Err(self.err("unknown variable"));
        };
        if self.vars[i].set {
            return Err(self.err("already defined"));
        }
        self.vars[i].set = true;
        let res = self.vars[i].value.set(raw);
        res.map_err(|e| self.err(e))
    }

    fn parse_line(&mut self, line: &str) -> Result<(), ConfError> {
        let rest = line.trim_start();
        if rest.is_empty() || rest.starts_with('#') {
            return Ok(());
        }
        let (ident, rest) = take_ident(rest);
        self.ident = ident.to_string();
        let rest = rest.trim_start();
        if ident.is_empty() || !rest.starts_with('=') {
            return Err(self.err("syntax error"));
        }
        let rest = rest[1..].trim_start();
        let (raw, rest) = if rest.starts_with('"') {
            let (tok, rest) = take_quoted(rest).ok_or_else(|| self.err("syntax error"))?;
            let unquoted =
                strarray::unquote(tok).map_err(|_| self.err("syntax error"))?;
            (unquoted, rest)
        } else {
            let (tok, rest) = take_plain(rest);
            if tok.is_empty() {
                return Err(self.err("syntax error"));
            }
            (tok.to_string(), rest)
        };
        let rest = rest.trim_start();
        if !rest.is_empty() && !rest.starts_with('#') {
            return Err(self.err("syntax error"));
        }
        self.set_value(&raw)
    }
}

fn take_ident(s: &str) -> (&str, &str) {
    let mut end = 0;
    for (i, c) in s.char_indices() {
        let ok = match c {
            'a'..='z' | 'A'..='Z' | '-' | '_' => true,
            '0'..='9' => i > 0,
            _ => false,
        };
        if !ok {
            break;
        }
        end = i + c.len_utf8();
    }
    (&s[..end], &s[end..])
}

fn take_plain(s: &str) -> (&str, &str) {
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if c.is_whitespace()
            || c.is_control()
            || matches!(c, '"' | '#' | '\'' | '=' | '\\')
        {
            break;
        }
        end = i + c.len_utf8();
    }
    (&s[..end], &s[end..])
}

/// Splits one `"..."` token off the front, rejecting embedded control
/// characters. Returns the token with quotes attached and the remainder.
fn take_quoted(s: &str) -> Option<(&str, &str)> {
    let mut escape = false;
    for (i, c) in s.char_indices().skip(1) {
        if c.is_control() {
            return None;
        }
        if escape {
            escape = false;
        } else if c == '\\' {
            escape = true;
        } else if c == '"' {
            return Some((&s[..i + 1], &s[i + 1..]));
        }
    }
    None
}

/// Parses `input` according to `vars`. The filename is only used in
/// error messages.
pub fn parse_str(input: &str, filename: &str, vars: &mut [Var<'_>]) -> Result<(), ConfError> {
    let mut p = Parser {
        file: if filename.is_empty() { "stdin".into() } else { filename.into() },
        line: 0,
        ident: String::new(),
        vars,
    };
    for line in input.lines() {
        p.line += 1;
        p.ident.clear();
        if line.len() > MAX_LINE {
            return Err(p.err("line too long"));
        }
        p.parse_line(line)?;
    }
    for v in p.vars.iter() {
        if v.required && !v.set {
            return Err(ConfError {
                file: p.file.clone(),
                line: 0,
                ident: v.name.to_string(),
                msg: "required but not set".into(),
            });
        }
    }
    Ok(())
}

/// Reads and parses a configuration file.
pub fn parse_file(path: impl AsRef<Path>, vars: &mut [Var<'_>]) -> Result<(), ConfError> {
    let path = path.as_ref();
    let name = path.display().to_string();
    let input = fs::read_to_string(path).map_err(|e| ConfError {
        file: name.clone(),
        line: 0,
        ident: String::new(),
        msg: e.to_string(),
    })?;
    parse_str(&input, &name, vars)
}
