// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Result records produced by the parser.

use std::fmt;

/// The outcome reported for a single test case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum ResultCode {
    /// The test case passed.
    Success,

    /// The test case was skipped.
    Skip,

    /// The test case failed.
    Failure,

    /// No verdict yet.
    ///
    /// Emitted when a test case opens its own subtest (a parametrized case). The verdict for that
    /// case follows later as a second record with the same suite and case names.
    Invalid,
}

impl ResultCode {
    /// Returns true if this code carries a verdict, i.e. it is not [`ResultCode::Invalid`].
    pub fn is_verdict(self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Returns the status label used by reporters.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "PASS",
            Self::Skip => "SKIP",
            Self::Failure => "FAIL",
            Self::Invalid => "START",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single test case result.
///
/// Records are handed to a [`ResultSink`](crate::sink::ResultSink) once they are complete, and the
/// parser never touches them again.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct KtapResult {
    /// The name of the enclosing suite, or an empty string for results reported outside of any
    /// subtest.
    pub suite_name: String,

    /// The name of the test case.
    pub case_name: String,

    /// The diagnostic attached to the result line, if any.
    pub message: Option<String>,

    /// The outcome.
    pub code: ResultCode,
}

impl KtapResult {
    /// The delimiter used by [`Self::full_name`] in the kernel log scraping convention.
    pub const DEFAULT_DELIMITER: &'static str = "-";

    /// Creates a new record without a message.
    pub fn new(
        suite_name: impl Into<String>,
        case_name: impl Into<String>,
        code: ResultCode,
    ) -> Self {
        Self {
            suite_name: suite_name.into(),
            case_name: case_name.into(),
            message: None,
            code,
        }
    }

    /// Sets the message for this record.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns the suite and case names joined by `delimiter`.
    ///
    /// If the suite name is empty, only the case name is returned.
    pub fn full_name(&self, delimiter: &str) -> String {
        if self.suite_name.is_empty() {
            self.case_name.clone()
        } else {
            format!("{}{delimiter}{}", self.suite_name, self.case_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_name() {
        let result = KtapResult::new("drm_buddy", "drm_test_buddy_alloc_range", ResultCode::Success);
        assert_eq!(
            result.full_name(KtapResult::DEFAULT_DELIMITER),
            "drm_buddy-drm_test_buddy_alloc_range"
        );
        assert_eq!(
            result.full_name("::"),
            "drm_buddy::drm_test_buddy_alloc_range"
        );

        let top_level = KtapResult::new("", "lonely", ResultCode::Failure);
        assert_eq!(top_level.full_name("-"), "lonely");
    }

    #[test]
    fn verdicts() {
        assert!(ResultCode::Success.is_verdict());
        assert!(ResultCode::Skip.is_verdict());
        assert!(ResultCode::Failure.is_verdict());
        assert!(!ResultCode::Invalid.is_verdict());
    }
}
