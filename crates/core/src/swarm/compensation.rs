//! # Compensating Tasks
//!
//! Pure planning of the tasks the coordinator creates when work goes wrong.
//! Nothing is ever rewritten: a retry, an escalation or a re-validation is a
//! new task that `replaces` the newest link of a chain, and a remediation is a
//! fresh task the re-validation waits on.
//!
//! Subjects derive from the chain root, so a plan computed twice for the same
//! state names the same tasks:
//!
//! ```text
//! IMPL-001 -> IMPL-001-R1 -> IMPL-001-ESC1        retry, then escalation
//! TEST-001 -> TEST-001-RV1 -> TEST-001-RV2        re-validation per fix
//!             TEST-001-FIX1   TEST-001-FIX2       remediation feeding each one
//! ```

use std::collections::HashMap;

use crate::state::graph::Supersession;
use crate::state::tasks::{NewTask, Task, TaskKind};

/// Chain `task` belongs to, oldest first
pub fn chain_of<'a>(task: &'a Task, tasks: &'a [Task]) -> Vec<&'a Task> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let chains = Supersession::build(tasks);
    chains
        .chain(chains.root(&task.id))
        .into_iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect()
}

/// Subject of the first task in `task`'s chain
pub fn root_subject(task: &Task, tasks: &[Task]) -> String {
    chain_of(task, tasks)
        .first()
        .map(|t| t.subject.clone())
        .unwrap_or_else(|| task.subject.clone())
}

fn count_kind(chain: &[&Task], kind: TaskKind) -> u32 {
    chain.iter().filter(|t| t.kind == kind).count() as u32
}

/// What to do about a failed (or reported-failed) task
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPlan {
    Retry(NewTask),
    Escalate(NewTask),
    /// Retries and escalation used up; goes into the failure report
    Exhausted,
}

/// Plan the compensating task for `failed`, the newest link of its chain
pub fn plan_retry(
    failed: &Task,
    tasks: &[Task],
    max_retries: u32,
    escalation_role: Option<&str>,
) -> RetryPlan {
    let chain = chain_of(failed, tasks);
    let root = root_subject(failed, tasks);

    let retries = count_kind(&chain, TaskKind::Retry);
    if retries < max_retries && failed.kind != TaskKind::Escalation {
        let task = NewTask::new(format!("{}-R{}", root, retries + 1), failed.owner.clone())
            .with_deps(failed.blocked_by.iter().cloned())
            .replacing(failed.id.clone(), TaskKind::Retry);
        return RetryPlan::Retry(with_origin(task, failed));
    }

    plan_escalation(failed, tasks, escalation_role)
}

/// Hand `task` to the escalation role, once per chain
pub fn plan_escalation(task: &Task, tasks: &[Task], escalation_role: Option<&str>) -> RetryPlan {
    let Some(role) = escalation_role else {
        return RetryPlan::Exhausted;
    };
    let chain = chain_of(task, tasks);
    let escalations = count_kind(&chain, TaskKind::Escalation);
    if escalations > 0 {
        return RetryPlan::Exhausted;
    }

    let root = root_subject(task, tasks);
    let new = NewTask::new(format!("{}-ESC{}", root, escalations + 1), role)
        .with_deps(task.blocked_by.iter().cloned())
        .replacing(task.id.clone(), TaskKind::Escalation);
    RetryPlan::Escalate(with_origin(new, task))
}

fn with_origin(mut new: NewTask, origin: &Task) -> NewTask {
    new.context_ref = origin.context_ref.clone();
    new.phase = Some(origin.phase.clone());
    new
}

/// Next step of the Fix-Verify loop for a validator that found defects
#[derive(Debug, Clone, PartialEq)]
pub enum GapClosurePlan {
    Remediate {
        iteration: u32,
        fix: NewTask,
        revalidate: NewTask,
    },
    /// Cap reached: accept the work with a degraded verdict
    Exhausted { iterations: u32 },
}

/// Remediation iterations already run for the chain of `validator`
pub fn gap_closure_iterations(validator: &Task, tasks: &[Task]) -> u32 {
    count_kind(&chain_of(validator, tasks), TaskKind::Revalidation)
}

/// Plan the remediation and re-validation after `validator` reported defects.
/// `findings_ref` points the fix at the validator's report.
pub fn plan_gap_closure(
    validator: &Task,
    tasks: &[Task],
    remediation_role: &str,
    cap: u32,
    findings_ref: Option<&str>,
) -> GapClosurePlan {
    let done = gap_closure_iterations(validator, tasks);
    if done >= cap {
        return GapClosurePlan::Exhausted { iterations: done };
    }

    let iteration = done + 1;
    let root = root_subject(validator, tasks);
    let context = findings_ref
        .map(str::to_string)
        .or_else(|| validator.context_ref.clone());

    let mut fix = NewTask::new(format!("{root}-FIX{iteration}"), remediation_role);
    fix.kind = TaskKind::Remediation;
    fix.phase = Some(validator.phase.clone());
    fix.context_ref = context.clone();

    let mut revalidate = NewTask::new(format!("{root}-RV{iteration}"), validator.owner.clone())
        .with_deps([fix.task_id()])
        .replacing(validator.id.clone(), TaskKind::Revalidation);
    revalidate.phase = Some(validator.phase.clone());
    revalidate.context_ref = context;

    GapClosurePlan::Remediate {
        iteration,
        fix,
        revalidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tasks::{task_id_for, TaskStatus};
    use chrono::{Duration, Utc};

    fn task(subject: &str, owner: &str, status: TaskStatus, offset: i64) -> Task {
        let at = Utc::now() + Duration::milliseconds(offset);
        Task {
            id: task_id_for(subject),
            subject: subject.to_string(),
            owner: owner.to_string(),
            status,
            blocked_by: Default::default(),
            context_ref: None,
            phase: subject.split('-').next().unwrap_or_default().to_string(),
            kind: TaskKind::Work,
            replaces: None,
            created_at: at,
            updated_at: at,
            version: 1,
        }
    }

    fn materialise(new: &NewTask, status: TaskStatus, offset: i64) -> Task {
        let mut t = task(&new.subject, &new.owner, status, offset);
        t.kind = new.kind;
        t.replaces = new.replaces.clone();
        t.blocked_by = new.deps.clone();
        t
    }

    #[test]
    fn test_retry_then_escalate_then_exhausted() {
        let original = task("IMPL-001", "executor", TaskStatus::Failed, 0);
        let mut tasks = vec![original.clone()];

        let RetryPlan::Retry(retry) = plan_retry(&original, &tasks, 1, Some("lead")) else {
            panic!("expected a retry");
        };
        assert_eq!(retry.subject, "IMPL-001-R1");
        assert_eq!(retry.replaces.as_deref(), Some("impl-001"));

        let retried = materialise(&retry, TaskStatus::Failed, 1);
        tasks.push(retried.clone());
        let RetryPlan::Escalate(esc) = plan_retry(&retried, &tasks, 1, Some("lead")) else {
            panic!("expected an escalation");
        };
        assert_eq!(esc.subject, "IMPL-001-ESC1");
        assert_eq!(esc.owner, "lead");

        let escalated = materialise(&esc, TaskStatus::Failed, 2);
        tasks.push(escalated.clone());
        assert_eq!(
            plan_retry(&escalated, &tasks, 1, Some("lead")),
            RetryPlan::Exhausted
        );
    }

    #[test]
    fn test_no_escalation_role_exhausts() {
        let original = task("PLAN-001", "planner", TaskStatus::Failed, 0);
        assert_eq!(
            plan_retry(&original, &[original.clone()], 0, None),
            RetryPlan::Exhausted
        );
    }

    #[test]
    fn test_gap_closure_stops_at_cap() {
        let mut validator = task("TEST-001", "tester", TaskStatus::Completed, 0);
        let mut tasks = vec![validator.clone()];
        let mut subjects = Vec::new();

        for offset in 1.. {
            match plan_gap_closure(&validator, &tasks, "executor", 3, None) {
                GapClosurePlan::Remediate {
                    iteration,
                    fix,
                    revalidate,
                } => {
                    assert_eq!(iteration as i64, offset);
                    assert!(revalidate.deps.contains(&fix.task_id()));
                    subjects.push(revalidate.subject.clone());
                    tasks.push(materialise(&fix, TaskStatus::Completed, offset * 10));
                    validator = materialise(&revalidate, TaskStatus::Completed, offset * 10 + 1);
                    tasks.push(validator.clone());
                }
                GapClosurePlan::Exhausted { iterations } => {
                    assert_eq!(iterations, 3);
                    break;
                }
            }
        }
        assert_eq!(subjects, vec!["TEST-001-RV1", "TEST-001-RV2", "TEST-001-RV3"]);
        assert_eq!(gap_closure_iterations(&validator, &tasks), 3);
    }

    #[test]
    fn test_plans_are_deterministic() {
        let validator = task("REVIEW-001", "reviewer", TaskStatus::Completed, 0);
        let tasks = vec![validator.clone()];
        assert_eq!(
            plan_gap_closure(&validator, &tasks, "executor", 3, Some("reports/r1.md")),
            plan_gap_closure(&validator, &tasks, "executor", 3, Some("reports/r1.md"))
        );
    }
}
