// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable output for parsed results.

use crate::result::{KtapResult, ResultCode};
use owo_colors::{OwoColorize, Style};
use std::io::{self, Write};
use swrite::{SWrite, swrite};

/// Counts of test case verdicts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// The number of test cases that passed.
    pub passed: usize,

    /// The number of test cases that failed.
    pub failed: usize,

    /// The number of test cases that were skipped.
    pub skipped: usize,
}

impl RunSummary {
    /// Computes the summary for a list of results.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a KtapResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.add(result.code);
        }
        summary
    }

    /// Counts a verdict. [`ResultCode::Invalid`] is not counted.
    pub fn add(&mut self, code: ResultCode) {
        match code {
            ResultCode::Success => self.passed += 1,
            ResultCode::Failure => self.failed += 1,
            ResultCode::Skip => self.skipped += 1,
            ResultCode::Invalid => {}
        }
    }

    /// Returns the number of verdicts counted.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    /// Returns true if no test case failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
    message: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.message = Style::new().dimmed();
    }
}

/// Writes one status line per finished test case, followed by a summary.
#[derive(Debug)]
pub struct ResultReporter<W> {
    writer: W,
    styles: Styles,
    summary: RunSummary,
}

impl<W: Write> ResultReporter<W> {
    /// Creates a new reporter. If `colorize` is true, output is styled with ANSI escapes.
    pub fn new(writer: W, colorize: bool) -> Self {
        let mut styles = Styles::default();
        if colorize {
            styles.colorize();
        }
        Self {
            writer,
            styles,
            summary: RunSummary::default(),
        }
    }

    /// Returns the summary of results reported so far.
    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Writes the status line for `result`. Records without a verdict are skipped.
    pub fn report(&mut self, result: &KtapResult) -> io::Result<()> {
        let style = match result.code {
            ResultCode::Success => self.styles.pass,
            ResultCode::Failure => self.styles.fail,
            ResultCode::Skip => self.styles.skip,
            ResultCode::Invalid => return Ok(()),
        };
        self.summary.add(result.code);

        write!(
            self.writer,
            "{:>12} {}",
            result.code.as_str().style(style),
            result.full_name("::"),
        )?;
        if let Some(message) = &result.message {
            write!(self.writer, ": {}", message.style(self.styles.message))?;
        }
        writeln!(self.writer)
    }

    /// Writes the summary line, flushes the writer and returns the summary.
    pub fn finish(mut self) -> io::Result<RunSummary> {
        let summary_style = if self.summary.failed > 0 {
            self.styles.fail
        } else if self.summary.total() == 0 {
            self.styles.skip
        } else {
            self.styles.pass
        };
        let tests_str = if self.summary.total() == 1 {
            "test"
        } else {
            "tests"
        };

        writeln!(
            self.writer,
            "------------\n{:>12} {} {tests_str} run: {}",
            "Summary".style(summary_style),
            self.summary.total().style(self.styles.count),
            summary_str(&self.summary, &self.styles),
        )?;
        self.writer.flush()?;
        Ok(self.summary)
    }
}

fn summary_str(summary: &RunSummary, styles: &Styles) -> String {
    let mut out = String::new();
    swrite!(
        out,
        "{} {}, ",
        summary.passed.style(styles.count),
        "passed".style(styles.pass),
    );
    if summary.failed > 0 {
        swrite!(
            out,
            "{} {}, ",
            summary.failed.style(styles.count),
            "failed".style(styles.fail),
        );
    }
    swrite!(
        out,
        "{} {}",
        summary.skipped.style(styles.count),
        "skipped".style(styles.skip),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn report_without_color() {
        let mut out = Vec::new();
        let mut reporter = ResultReporter::new(&mut out, false);
        for result in [
            KtapResult::new("drm_mm", "drm_test_mm_init", ResultCode::Success),
            KtapResult::new("drm_mm", "drm_test_mm_insert", ResultCode::Invalid),
            KtapResult::new("drm_mm", "drm_test_mm_insert", ResultCode::Failure)
                .with_message("expected 0, got -12"),
            KtapResult::new("", "lonely", ResultCode::Skip),
        ] {
            reporter.report(&result).expect("write succeeded");
        }
        let summary = reporter.finish().expect("write succeeded");

        assert_eq!(
            summary,
            RunSummary {
                passed: 1,
                failed: 1,
                skipped: 1,
            }
        );
        assert!(!summary.is_success());
        assert_eq!(
            String::from_utf8(out).expect("valid UTF-8"),
            indoc! {"
                        PASS drm_mm::drm_test_mm_init
                        FAIL drm_mm::drm_test_mm_insert: expected 0, got -12
                        SKIP lonely
                ------------
                     Summary 3 tests run: 1 passed, 1 failed, 1 skipped
            "}
        );
    }

    #[test]
    fn empty_summary() {
        let mut out = Vec::new();
        let summary = ResultReporter::new(&mut out, false)
            .finish()
            .expect("write succeeded");
        assert_eq!(summary.total(), 0);
        assert!(summary.is_success());
        assert_eq!(
            String::from_utf8(out).expect("valid UTF-8"),
            "------------\n     Summary 0 tests run: 0 passed, 0 skipped\n"
        );
    }

    #[test]
    fn colorized_output_has_escapes() {
        let mut out = Vec::new();
        let mut reporter = ResultReporter::new(&mut out, true);
        reporter
            .report(&KtapResult::new("a", "b", ResultCode::Success))
            .expect("write succeeded");
        reporter.finish().expect("write succeeded");
        let out = String::from_utf8(out).expect("valid UTF-8");
        assert!(out.contains("\u{1b}["), "output is styled: {out:?}");
    }

    #[test]
    fn summary_from_results() {
        let results = [
            KtapResult::new("s", "a", ResultCode::Success),
            KtapResult::new("s", "b", ResultCode::Invalid),
            KtapResult::new("s", "b", ResultCode::Success),
            KtapResult::new("s", "c", ResultCode::Skip),
        ];
        let summary = RunSummary::from_results(&results);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.passed, 2);
        assert!(summary.is_success());
    }
}
