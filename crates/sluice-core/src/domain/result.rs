//! Result model: what a processor reports back to the dispatcher.
//!
//! `ResultState` is the required tag (Success / Error). Requeueing is an
//! independent capability, so a result can be Success and Requeueable at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultState {
    Success,
    Error,
}

/// A processor's verdict on one source.
///
/// - `SUCCESS`: terminal, positive.
/// - `ERROR`: terminal, negative. Carries the source (filled in by the dispatcher
///   if the processor did not set one) and optionally the causal error.
///
/// Requeue items are only acted on for Success results.
#[derive(Debug, Clone)]
pub struct ProcessResult<S> {
    state: ResultState,
    requeue: Vec<S>,
    requeue_current: bool,
    source: Option<S>,
    error: Option<ProcessError>,
    completed_at: Option<DateTime<Utc>>,
}

impl<S> ProcessResult<S> {
    pub fn success() -> Self {
        Self::with_state(ResultState::Success)
    }

    pub fn error(error: ProcessError) -> Self {
        let mut result = Self::with_state(ResultState::Error);
        result.error = Some(error);
        result
    }

    /// Error without a causal error attached.
    pub fn rejected() -> Self {
        Self::with_state(ResultState::Error)
    }

    fn with_state(state: ResultState) -> Self {
        Self {
            state,
            requeue: Vec::new(),
            requeue_current: false,
            source: None,
            error: None,
            completed_at: None,
        }
    }

    /// Ask the dispatcher to put these sources back into the backend.
    pub fn with_requeue(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.requeue.extend(sources);
        self
    }

    /// Ask the dispatcher to put the source being processed back into the backend.
    ///
    /// The dispatcher owns that source, so the processor does not need to clone it.
    pub fn requeue_current(mut self) -> Self {
        self.requeue_current = true;
        self
    }

    pub fn with_source(mut self, source: S) -> Self {
        self.source = Some(source);
        self
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn is_success(&self) -> bool {
        self.state == ResultState::Success
    }

    pub fn is_requeueable(&self) -> bool {
        self.requeue_current || !self.requeue.is_empty()
    }

    pub fn wants_current_requeued(&self) -> bool {
        self.requeue_current
    }

    pub fn requeue_items(&self) -> &[S] {
        &self.requeue
    }

    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    pub fn error_detail(&self) -> Option<&ProcessError> {
        self.error.as_ref()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn into_source(self) -> Option<S> {
        self.source
    }

    pub(crate) fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn attach_source(&mut self, source: S) {
        self.source = Some(source);
    }

    pub(crate) fn take_requeue(&mut self) -> Vec<S> {
        self.requeue_current = false;
        std::mem::take(&mut self.requeue)
    }

    pub(crate) fn stamp(&mut self) {
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_state_serializes_as_screaming_names() {
        let s = serde_json::to_string(&ResultState::Success).unwrap();
        assert_eq!(s, "\"SUCCESS\"");

        let s = serde_json::to_string(&ResultState::Error).unwrap();
        assert_eq!(s, "\"ERROR\"");
    }

    #[test]
    fn success_and_requeueable_are_orthogonal() {
        let plain = ProcessResult::<u32>::success();
        assert!(plain.is_success());
        assert!(!plain.is_requeueable());

        let with_items = ProcessResult::success().with_requeue([1_u32, 2]);
        assert!(with_items.is_success());
        assert!(with_items.is_requeueable());
        assert_eq!(with_items.requeue_items(), &[1, 2]);

        let current = ProcessResult::<u32>::success().requeue_current();
        assert!(current.is_requeueable());
        assert!(current.requeue_items().is_empty());
    }

    #[test]
    fn error_keeps_its_cause() {
        let r = ProcessResult::<u32>::error(ProcessError::failed("bad input"));
        assert_eq!(r.state(), ResultState::Error);
        assert!(!r.is_success());
        assert!(r.error_detail().is_some());
        assert!(r.source().is_none());
    }

    #[test]
    fn take_requeue_drains_the_capability() {
        let mut r = ProcessResult::success().with_requeue([7_u32]).requeue_current();
        let items = r.take_requeue();
        assert_eq!(items, vec![7]);
        assert!(!r.is_requeueable());
    }

    #[test]
    fn stamp_sets_completion_time() {
        let mut r = ProcessResult::<u32>::success();
        assert!(r.completed_at().is_none());
        r.stamp();
        assert!(r.completed_at().is_some());
    }
}
