//! Test fixtures shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::domain::{DistributionId, ProcessError, ProcessResult, Source, SourceType};
use crate::ports::Processor;

pub(crate) const SUBJECT: SourceType = SourceType::new("test.subject.v1");
pub(crate) const AUDIT: SourceType = SourceType::new("test.audit.v1");
pub(crate) const ORPHAN: SourceType = SourceType::new("test.orphan.v1");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Subject,
    Audit,
    /// Nothing is ever registered for this one.
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TestSource {
    pub kind: Kind,
    pub subject_id: u32,
    pub distribution: DistributionId,
    /// How many times a processor has seen this source.
    pub attempts: u32,
}

impl TestSource {
    fn new(kind: Kind, subject_id: u32, distribution: DistributionId) -> Self {
        Self {
            kind,
            subject_id,
            distribution,
            attempts: 0,
        }
    }

    pub fn subject(subject_id: u32, distribution: DistributionId) -> Self {
        Self::new(Kind::Subject, subject_id, distribution)
    }

    pub fn audit(subject_id: u32, distribution: DistributionId) -> Self {
        Self::new(Kind::Audit, subject_id, distribution)
    }

    pub fn orphan(subject_id: u32) -> Self {
        Self::new(Kind::Orphan, subject_id, DistributionId::DEFAULT)
    }
}

impl Source for TestSource {
    fn source_type(&self) -> SourceType {
        match self.kind {
            Kind::Subject => SUBJECT,
            Kind::Audit => AUDIT,
            Kind::Orphan => ORPHAN,
        }
    }

    fn distribution_id(&self) -> DistributionId {
        self.distribution
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Return an Error result instead of `Err`, with a child it wants requeued.
    Reject,
    /// Ask for the current source back until it has been seen `n` times.
    RequeueUntil(u32),
    /// Succeed and hand back `n` audit sources for the same subject.
    Spawn(u32),
}

/// Scriptable processor that counts its calls.
pub(crate) struct ScriptedProcessor {
    source_type: SourceType,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProcessor {
    pub fn new(source_type: SourceType, behavior: Behavior) -> Self {
        Self {
            source_type,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Processor<TestSource> for ScriptedProcessor {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn process(
        &self,
        source: &mut TestSource,
    ) -> Result<ProcessResult<TestSource>, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        source.attempts += 1;

        match self.behavior {
            Behavior::Succeed => Ok(ProcessResult::success()),
            Behavior::Fail => Err(ProcessError::failed(format!(
                "subject {} failed",
                source.subject_id
            ))),
            Behavior::Panic => panic!("subject {} exploded", source.subject_id),
            Behavior::Reject => {
                let child = TestSource::audit(source.subject_id, source.distribution);
                Ok(ProcessResult::rejected().with_requeue([child]))
            }
            Behavior::RequeueUntil(n) if source.attempts < n => {
                Ok(ProcessResult::success().requeue_current())
            }
            Behavior::RequeueUntil(_) => Ok(ProcessResult::success()),
            Behavior::Spawn(n) => {
                let children =
                    (0..n).map(|_| TestSource::audit(source.subject_id, source.distribution));
                Ok(ProcessResult::success().with_requeue(children))
            }
        }
    }
}
