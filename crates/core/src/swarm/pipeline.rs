//! # Pipeline Templates
//!
//! The closed set of pipelines a session can run. Each template names its
//! stages (one task each), the roles that own them, which stages validate
//! earlier work, and how workers are spawned.
//!
//! ```text
//! spec-only:       ANALYZE -> PLAN -> REVIEW                   (Stop-Wait)
//! impl-only:       PLAN -> IMPL -> TEST                        (Spawn-and-Stop)
//! full-lifecycle:  RESEARCH -> PLAN -> IMPL -> TEST | REVIEW   (Spawn-and-Stop)
//! ```

use std::collections::{BTreeSet, HashMap};

use crate::state::graph::{self, Supersession};
use crate::state::sessions::PipelineMode;
use crate::state::tasks::{task_id_for, NewTask, Task};

use super::workers::SpawnMode;

/// One stage of a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTemplate {
    pub subject: &'static str,
    pub role: &'static str,
    /// Subjects of the stages this one waits on
    pub after: &'static [&'static str],
    /// Stage produces a quality report that gates the pipeline
    pub validating: bool,
}

const fn stage(
    subject: &'static str,
    role: &'static str,
    after: &'static [&'static str],
    validating: bool,
) -> StageTemplate {
    StageTemplate {
        subject,
        role,
        after,
        validating,
    }
}

const SPEC_ONLY: &[StageTemplate] = &[
    stage("ANALYZE-001", "analyst", &[], false),
    stage("PLAN-001", "planner", &["ANALYZE-001"], false),
    stage("REVIEW-001", "reviewer", &["PLAN-001"], true),
];

const IMPL_ONLY: &[StageTemplate] = &[
    stage("PLAN-001", "planner", &[], false),
    stage("IMPL-001", "executor", &["PLAN-001"], false),
    stage("TEST-001", "tester", &["IMPL-001"], true),
];

const FULL_LIFECYCLE: &[StageTemplate] = &[
    stage("RESEARCH-001", "analyst", &[], false),
    stage("PLAN-001", "planner", &["RESEARCH-001"], false),
    stage("IMPL-001", "executor", &["PLAN-001"], false),
    stage("TEST-001", "tester", &["IMPL-001"], true),
    stage("REVIEW-001", "reviewer", &["IMPL-001"], true),
];

/// A pipeline mode's expected task graph
#[derive(Debug, Clone)]
pub struct PipelineTemplate {
    pub mode: PipelineMode,
    pub stages: &'static [StageTemplate],
    pub spawn_mode: SpawnMode,
    /// Role that receives remediation tasks from failed gates
    pub remediation_role: &'static str,
}

impl PipelineTemplate {
    pub fn for_mode(mode: PipelineMode) -> Self {
        match mode {
            PipelineMode::SpecOnly => Self {
                mode,
                stages: SPEC_ONLY,
                spawn_mode: SpawnMode::Sync,
                remediation_role: "planner",
            },
            PipelineMode::ImplOnly => Self {
                mode,
                stages: IMPL_ONLY,
                spawn_mode: SpawnMode::Async,
                remediation_role: "executor",
            },
            PipelineMode::FullLifecycle => Self {
                mode,
                stages: FULL_LIFECYCLE,
                spawn_mode: SpawnMode::Async,
                remediation_role: "executor",
            },
        }
    }

    /// Every role the pipeline may dispatch to, escalation aside
    pub fn roles(&self) -> BTreeSet<&'static str> {
        let mut roles: BTreeSet<&'static str> = self.stages.iter().map(|s| s.role).collect();
        roles.insert(self.remediation_role);
        roles
    }

    /// Tasks to create for a new session; the first stages carry the scope
    pub fn tasks(&self, scope: &str) -> Vec<NewTask> {
        self.stages
            .iter()
            .map(|s| {
                let task = NewTask::new(s.subject, s.role)
                    .with_deps(s.after.iter().map(|dep| task_id_for(dep)));
                if s.after.is_empty() {
                    task.with_context(scope)
                } else {
                    task
                }
            })
            .collect()
    }

    /// Whether the chain rooted at `root_id` is a validating stage
    pub fn is_validating(&self, root_id: &str) -> bool {
        self.stages
            .iter()
            .any(|s| s.validating && task_id_for(s.subject) == root_id)
    }

    /// Phases in pipeline order
    pub fn phases(&self) -> Vec<&'static str> {
        let mut phases = Vec::new();
        for s in self.stages {
            let phase = s.subject.split('-').next().unwrap_or(s.subject);
            if !phases.contains(&phase) {
                phases.push(phase);
            }
        }
        phases
    }
}

/// Phase of the oldest unresolved task, `None` once everything is done
pub fn current_phase(tasks: &[Task]) -> Option<String> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let chains = Supersession::build(tasks);

    tasks
        .iter()
        .filter(|t| !chains.is_superseded(&t.id))
        .filter(|t| !graph::is_resolved(t, &by_id, &chains))
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
        .map(|t| t.phase.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::graph::detect_cycle;
    use std::collections::BTreeMap;

    #[test]
    fn test_templates_are_acyclic() {
        for mode in PipelineMode::ALL {
            let template = PipelineTemplate::for_mode(mode);
            let edges: BTreeMap<_, _> = template
                .tasks("scope")
                .into_iter()
                .map(|t| (t.task_id(), t.deps))
                .collect();
            assert!(detect_cycle(&edges).is_none(), "{mode}");
        }
    }

    #[test]
    fn test_full_lifecycle_shape() {
        let template = PipelineTemplate::for_mode(PipelineMode::FullLifecycle);
        assert_eq!(template.spawn_mode, SpawnMode::Async);
        assert_eq!(
            template.phases(),
            vec!["RESEARCH", "PLAN", "IMPL", "TEST", "REVIEW"]
        );
        assert!(template.is_validating("test-001"));
        assert!(template.is_validating("review-001"));
        assert!(!template.is_validating("impl-001"));

        let tasks = template.tasks("checkout");
        assert_eq!(tasks[0].context_ref.as_deref(), Some("checkout"));
        assert!(tasks[4].deps.contains("impl-001"));
    }

    #[test]
    fn test_spec_only_is_stop_wait() {
        let template = PipelineTemplate::for_mode(PipelineMode::SpecOnly);
        assert_eq!(template.spawn_mode, SpawnMode::Sync);
        assert!(template.roles().contains("analyst"));
        assert!(!template.roles().contains("executor"));
    }
}
