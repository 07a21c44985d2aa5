//! Priority-ranked resource allocators consulted before a job is handed to a
//! cluster backend.
//!
//! Factories are registered at startup in module-dependency order and the
//! registry is read-only afterwards. Resolution for a task asks every factory
//! for its priority, drops the ones without an opinion, and picks the highest
//! priority. Ties go to the factory registered last.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::PipelineJob;

pub mod engine;
pub mod sequence;

pub use engine::{ClusterEngineConfig, EngineType, ResourceRequest};
pub use sequence::{SequenceJobResourceAllocator, SequenceJobResourceAllocatorFactory};

/// Identifies the task a job is about to run, e.g.
/// `sequenceanalysis.pipeline.SequenceAlignmentTask`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub namespace: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl TaskId {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Last dotted segment of the namespace.
    pub fn simple_name(&self) -> &str {
        self.namespace
            .rsplit('.')
            .next()
            .unwrap_or(&self.namespace)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{}", self.namespace, name),
            None => f.write_str(&self.namespace),
        }
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Task id cannot be empty".to_string());
        }
        Ok(match s.split_once(':') {
            Some((namespace, name)) => TaskId::new(namespace).with_name(name),
            None => TaskId::new(s),
        })
    }
}

/// Resource policy for one job. `None` from the ceiling methods means the
/// static engine configuration applies.
pub trait ClusterResourceAllocator: Send {
    fn max_request_cpus(&self, job: &PipelineJob) -> Option<u32>;

    /// Memory ceiling in GB.
    fn max_request_memory(&self, job: &PipelineJob) -> Option<u32>;

    fn add_extra_submit_script_lines(
        &self,
        job: &PipelineJob,
        engine: EngineType,
        lines: &mut Vec<String>,
    );

    fn environment_vars(
        &self,
        _job: &PipelineJob,
        _engine: EngineType,
    ) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

pub trait AllocatorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn allocator(&self) -> Box<dyn ClusterResourceAllocator>;

    /// `None` means no opinion about `task`.
    fn priority(&self, task: &TaskId) -> Option<i32>;
}

#[derive(Default)]
pub struct AllocatorRegistry {
    factories: Vec<Arc<dyn AllocatorFactory>>,
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|factory| factory.name()))
            .finish()
    }
}

impl AllocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: impl AllocatorFactory + 'static) {
        self.factories.push(Arc::new(factory));
    }

    pub fn factories(&self) -> impl Iterator<Item = &Arc<dyn AllocatorFactory>> {
        self.factories.iter()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn resolve(&self, task: &TaskId) -> Option<&Arc<dyn AllocatorFactory>> {
        let mut selected: Option<(i32, &Arc<dyn AllocatorFactory>)> = None;
        for factory in &self.factories {
            let Some(priority) = factory.priority(task) else {
                continue;
            };
            if selected.is_none_or(|(best, _)| priority >= best) {
                selected = Some((priority, factory));
            }
        }
        match selected {
            Some((priority, factory)) => {
                debug!(
                    task = %task,
                    allocator = factory.name(),
                    priority,
                    "Resource allocator selected"
                );
                Some(factory)
            }
            None => {
                debug!(task = %task, "No resource allocator for task");
                None
            }
        }
    }
}

pub fn register_defaults(registry: &mut AllocatorRegistry) {
    registry.register(SequenceJobResourceAllocatorFactory);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAllocator;

    impl ClusterResourceAllocator for NullAllocator {
        fn max_request_cpus(&self, _job: &PipelineJob) -> Option<u32> {
            None
        }

        fn max_request_memory(&self, _job: &PipelineJob) -> Option<u32> {
            None
        }

        fn add_extra_submit_script_lines(
            &self,
            _job: &PipelineJob,
            _engine: EngineType,
            _lines: &mut Vec<String>,
        ) {
        }
    }

    struct Fixed {
        name: &'static str,
        priority: Option<i32>,
    }

    impl AllocatorFactory for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn allocator(&self) -> Box<dyn ClusterResourceAllocator> {
            Box::new(NullAllocator)
        }

        fn priority(&self, _task: &TaskId) -> Option<i32> {
            self.priority
        }
    }

    #[test]
    fn later_registration_wins_ties() {
        let mut registry = AllocatorRegistry::new();
        registry.register(Fixed {
            name: "A",
            priority: Some(5),
        });
        registry.register(Fixed {
            name: "B",
            priority: Some(5),
        });
        registry.register(Fixed {
            name: "C",
            priority: None,
        });

        let selected = registry.resolve(&TaskId::new("T")).map(|f| f.name());
        assert_eq!(selected, Some("B"));
    }

    #[test]
    fn higher_priority_beats_registration_order() {
        let mut registry = AllocatorRegistry::new();
        registry.register(Fixed {
            name: "high",
            priority: Some(10),
        });
        registry.register(Fixed {
            name: "low",
            priority: Some(-3),
        });

        let selected = registry.resolve(&TaskId::new("T")).map(|f| f.name());
        assert_eq!(selected, Some("high"));
    }

    #[test]
    fn no_opinion_yields_nothing() {
        let mut registry = AllocatorRegistry::new();
        registry.register(Fixed {
            name: "A",
            priority: None,
        });
        assert!(registry.resolve(&TaskId::new("U")).is_none());
        assert!(AllocatorRegistry::new().resolve(&TaskId::new("U")).is_none());
    }

    #[test]
    fn task_id_parses_optional_name() {
        let task: TaskId = "sequenceanalysis.pipeline.SequenceAlignmentTask:align"
            .parse()
            .unwrap();
        assert_eq!(task.simple_name(), "SequenceAlignmentTask");
        assert_eq!(task.name.as_deref(), Some("align"));
        assert!("  ".parse::<TaskId>().is_err());
    }
}
