//! The check result record.
//!
//! A `CheckResult` is produced by one run of a check on a node, stored in
//! the node's local database, uploaded to the server on the next session,
//! and finally inserted into the server's `results` table. The record is
//! immutable after creation; the server tags it with the authenticated
//! node id on receipt but never rewrites the fields below.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Set when the check failed (e.g. HTTP response was not 200).
pub const RES_FAIL: u32 = 1 << 0;

/// Result of one check run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Id of the job that started the check.
    pub job_id: u64,
    /// Flags (bit 0 = failure).
    pub flags: u32,
    /// Time the check started, nanoseconds since the Unix epoch.
    pub start: i64,
    /// Elapsed run time, nanoseconds.
    pub rt: i64,
    /// Error string returned by libraries, empty on success.
    pub errs: String,
    /// Output of the run (e.g. HTTP status line, header dumps).
    pub output: Vec<String>,
}

impl CheckResult {
    /// True if the failure flag is set.
    pub fn failed(&self) -> bool {
        self.flags & RES_FAIL != 0
    }

    /// A failed result carrying only an error message.
    pub fn fail(errs: impl Into<String>) -> Self {
        CheckResult {
            flags: RES_FAIL,
            errs: errs.into(),
            ..CheckResult::default()
        }
    }
}

impl fmt::Display for CheckResult {
    /// Dumps all fields on several lines for easier debugging.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?}", self.output)?;
        writeln!(f, "job: {}", self.job_id)?;
        writeln!(f, "flags: {}", self.flags)?;
        writeln!(f, "err: {}", self.errs)?;
        writeln!(f, "start: {}", self.start)?;
        writeln!(
            f,
            "elapsed: {}.{:06} s",
            self.rt / 1_000_000_000,
            self.rt % 1_000_000_000 / 1_000
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_sets_flag_and_message() {
        let r = CheckResult::fail("boom");
        assert!(r.failed());
        assert_eq!(r.errs, "boom");
        assert!(r.output.is_empty());
    }

    #[test]
    fn default_is_success() {
        assert!(!CheckResult::default().failed());
    }

    #[test]
    fn display_contains_fields() {
        let r = CheckResult {
            job_id: 7,
            flags: RES_FAIL,
            start: 1_000,
            rt: 2_500_000_000,
            errs: "timeout".into(),
            output: vec!["a".into()],
        };
        let s = r.to_string();
        assert!(s.contains("job: 7"));
        assert!(s.contains("err: timeout"));
        assert!(s.contains("elapsed: 2.500000 s"));
    }
}
