// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Code to generate JUnit XML reports from parsed results.

use crate::{
    errors::WriteJunitError,
    result::{KtapResult, ResultCode},
};
use camino::Utf8Path;
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, SerializeError, TestCase, TestCaseStatus, TestSuite};
use std::{fs::File, io::Write};

/// Accumulates results into a JUnit report, with one test suite per KTAP suite.
///
/// Suites appear in the report in the order they were first seen.
#[derive(Clone, Debug)]
pub struct JunitReportBuilder {
    report_name: String,
    test_suites: IndexMap<String, TestSuite>,
}

impl JunitReportBuilder {
    /// Creates a new builder. `report_name` is also used as the suite name for results reported
    /// outside of any suite.
    pub fn new(report_name: impl Into<String>) -> Self {
        Self {
            report_name: report_name.into(),
            test_suites: IndexMap::new(),
        }
    }

    /// Adds a single result. Records without a verdict are ignored.
    pub fn add_result(&mut self, result: &KtapResult) -> &mut Self {
        let mut status = match result.code {
            ResultCode::Success => TestCaseStatus::success(),
            ResultCode::Skip => TestCaseStatus::skipped(),
            ResultCode::Failure => TestCaseStatus::non_success(NonSuccessKind::Failure),
            ResultCode::Invalid => return self,
        };
        if let Some(message) = &result.message {
            status.set_message(message.as_str());
        }

        let suite_name = if result.suite_name.is_empty() {
            &self.report_name
        } else {
            &result.suite_name
        };
        let mut testcase = TestCase::new(result.case_name.as_str(), status);
        testcase.set_classname(suite_name.as_str());

        self.test_suites
            .entry(suite_name.clone())
            .or_insert_with(|| TestSuite::new(suite_name.as_str()))
            .add_test_case(testcase);
        self
    }

    /// Adds a sequence of results.
    pub fn add_results<'a>(
        &mut self,
        results: impl IntoIterator<Item = &'a KtapResult>,
    ) -> &mut Self {
        for result in results {
            self.add_result(result);
        }
        self
    }

    /// Builds the report.
    pub fn build(&self) -> Report {
        let mut report = Report::new(self.report_name.as_str());
        report.add_test_suites(self.test_suites.values().cloned());
        report
    }
}

/// Serializes `report` to `writer`.
pub fn write_to(report: &Report, writer: impl Write) -> Result<(), SerializeError> {
    report.serialize(writer)
}

/// Writes `report` to `path`, creating its parent directory if necessary.
pub fn write_to_path(report: &Report, path: &Utf8Path) -> Result<(), WriteJunitError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|error| WriteJunitError::Fs {
            path: dir.to_path_buf(),
            error,
        })?;
    }

    let f = File::create(path).map_err(|error| WriteJunitError::Fs {
        path: path.to_path_buf(),
        error,
    })?;
    write_to(report, f).map_err(|error| WriteJunitError::Serialize {
        path: path.to_path_buf(),
        error,
    })
}
