//! ProcessorRegistry - source_type ごとの Processor 管理
//!
//! # ポイント
//! - HashMap<SourceType, Arc<dyn Processor<S>>> で型消去された processor を保持
//! - `get` は Arc を clone して返すので、差し替え中も実行中の dispatch は旧 processor で完了する
//! - 登録は上書き（hot replace）。戻り値で置き換えが起きたか分かる

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::domain::{Source, SourceType};
use crate::ports::Processor;

pub struct ProcessorRegistry<S> {
    processors: RwLock<HashMap<SourceType, Arc<dyn Processor<S>>>>,
}

impl<S: Source> ProcessorRegistry<S> {
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
        }
    }

    /// Register `processor` under its own source type.
    ///
    /// Returns `true` if an existing processor was replaced.
    pub fn register(&self, processor: Arc<dyn Processor<S>>) -> bool {
        let source_type = processor.source_type();
        let replaced = self
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_type, processor)
            .is_some();
        debug!(%source_type, replaced, "processor registered");
        replaced
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn Processor<S>>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source_type)
            .cloned()
    }

    pub fn unregister(&self, source_type: SourceType) -> Option<Arc<dyn Processor<S>>> {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&source_type)
    }

    pub fn contains(&self, source_type: SourceType) -> bool {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&source_type)
    }

    pub fn registered_types(&self) -> Vec<SourceType> {
        let mut types: Vec<SourceType> = self
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        types.sort();
        types
    }
}

impl<S: Source> Default for ProcessorRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AUDIT, Behavior, ORPHAN, SUBJECT, ScriptedProcessor, TestSource};

    fn processor(source_type: SourceType, behavior: Behavior) -> Arc<dyn Processor<TestSource>> {
        Arc::new(ScriptedProcessor::new(source_type, behavior))
    }

    #[test]
    fn register_then_get() {
        let registry = ProcessorRegistry::new();
        assert!(!registry.register(processor(SUBJECT, Behavior::Succeed)));

        assert!(registry.get(SUBJECT).is_some());
        assert!(registry.get(ORPHAN).is_none());
        assert!(registry.contains(SUBJECT));
    }

    #[test]
    fn second_registration_replaces_and_reports_it() {
        let registry = ProcessorRegistry::new();
        let first = processor(SUBJECT, Behavior::Succeed);
        let second = processor(SUBJECT, Behavior::Fail);

        assert!(!registry.register(Arc::clone(&first)));
        assert!(registry.register(Arc::clone(&second)));

        let current = registry.get(SUBJECT).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(registry.registered_types(), vec![SUBJECT]);
    }

    #[test]
    fn replaced_processor_stays_alive_for_holders() {
        let registry = ProcessorRegistry::new();
        registry.register(processor(SUBJECT, Behavior::Succeed));
        let held = registry.get(SUBJECT).unwrap();

        registry.register(processor(SUBJECT, Behavior::Fail));
        // 古い Arc はまだ使える
        assert_eq!(held.source_type(), SUBJECT);
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn unregister_and_registered_types() {
        let registry = ProcessorRegistry::new();
        registry.register(processor(SUBJECT, Behavior::Succeed));
        registry.register(processor(AUDIT, Behavior::Succeed));

        // sorted by name
        assert_eq!(registry.registered_types(), vec![AUDIT, SUBJECT]);

        assert!(registry.unregister(AUDIT).is_some());
        assert!(registry.unregister(AUDIT).is_none());
        assert_eq!(registry.registered_types(), vec![SUBJECT]);
    }
}
