// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Destinations for parsed results.

use crate::result::KtapResult;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An ordered destination for finished result records.
///
/// The parser only ever appends to a sink.
pub trait ResultSink {
    /// Appends a finished record.
    fn push(&mut self, result: KtapResult);
}

impl ResultSink for Vec<KtapResult> {
    fn push(&mut self, result: KtapResult) {
        Vec::push(self, result);
    }
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn push(&mut self, result: KtapResult) {
        (**self).push(result);
    }
}

/// A result list shared between a producer thread and its readers.
///
/// Cloning a `SharedResults` produces another handle to the same list. The lock is held only
/// while a record is appended or while the list is copied out.
#[derive(Clone, Debug, Default)]
pub struct SharedResults {
    inner: Arc<Mutex<Vec<KtapResult>>>,
}

impl SharedResults {
    /// Creates a new, empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records appended so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no records have been appended yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns a copy of all records appended so far.
    pub fn snapshot(&self) -> Vec<KtapResult> {
        self.lock().clone()
    }

    /// Returns a copy of the records appended at or after `start`.
    ///
    /// Pollers can pass the number of records they have already seen to get only new ones.
    pub fn snapshot_from(&self, start: usize) -> Vec<KtapResult> {
        self.lock().get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Removes and returns all records appended so far.
    pub fn take(&self) -> Vec<KtapResult> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<KtapResult>> {
        // Records are only ever appended whole, so a poisoned list is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResultSink for SharedResults {
    fn push(&mut self, result: KtapResult) {
        self.lock().push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn shared_results_are_shared() {
        let results = SharedResults::new();
        let mut producer = results.clone();
        assert!(results.is_empty());

        producer.push(KtapResult::new("suite", "one", ResultCode::Success));
        producer.push(KtapResult::new("suite", "two", ResultCode::Skip));
        assert_eq!(results.len(), 2);
        assert_eq!(
            results.snapshot_from(1),
            vec![KtapResult::new("suite", "two", ResultCode::Skip)]
        );
        assert_eq!(results.snapshot_from(2), vec![]);
        assert_eq!(results.snapshot_from(5), vec![]);

        let taken = results.take();
        assert_eq!(taken.len(), 2);
        assert!(producer.is_empty());
    }

    #[test]
    fn mut_ref_sink() {
        let mut results = Vec::new();
        {
            let mut sink = &mut results;
            ResultSink::push(&mut sink, KtapResult::new("a", "b", ResultCode::Failure));
        }
        assert_eq!(results, vec![KtapResult::new("a", "b", ResultCode::Failure)]);
    }
}
