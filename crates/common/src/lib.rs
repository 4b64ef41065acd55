//! Shared building blocks for benchnet.
//!
//! - `result`: the check result record exchanged between node and server
//! - `check`: check command parsing and validation
//! - `strarray`: the quoted string-array codec used by the `result` column
//! - `conf`: the `ident = value` configuration-file parser

pub mod check;
pub mod conf;
pub mod result;
pub mod strarray;

pub use result::{CheckResult, RES_FAIL};
