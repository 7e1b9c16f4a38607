//! Workflow scheduling seam.
//!
//! The controller consults a scheduler for the set of tasks that
//! should start next given the invocation's current task statuses. The
//! default implementation schedules every task whose dependencies have
//! all succeeded and which has not itself been started.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{Invocation, TaskPhase, Workflow};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("task '{task}' requires unknown task '{requirement}'")]
    UnknownRequirement { task: String, requirement: String },
}

/// A task the scheduler wants started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub task_id: String,
}

/// The scheduler's answer for one invocation snapshot.
#[derive(Debug, Clone)]
pub struct SchedulingPlan {
    pub invocation_id: Uuid,
    pub tasks: Vec<ScheduledTask>,
}

pub trait WorkflowScheduler: Send + Sync {
    fn schedule(
        &self,
        invocation: &Invocation,
        workflow: &Workflow,
    ) -> Result<SchedulingPlan, ScheduleError>;
}

/// Dependency-readiness scheduler over the workflow task DAG.
#[derive(Default)]
pub struct DependencyScheduler;

impl DependencyScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl WorkflowScheduler for DependencyScheduler {
    fn schedule(
        &self,
        invocation: &Invocation,
        workflow: &Workflow,
    ) -> Result<SchedulingPlan, ScheduleError> {
        let mut task_ids: Vec<&String> = workflow.tasks.keys().collect();
        task_ids.sort();

        let mut tasks = Vec::new();
        for task_id in task_ids {
            if invocation.tasks.contains_key(task_id) {
                continue;
            }
            let spec = &workflow.tasks[task_id];
            let mut ready = true;
            for requirement in &spec.requires {
                if !workflow.tasks.contains_key(requirement) {
                    return Err(ScheduleError::UnknownRequirement {
                        task: task_id.clone(),
                        requirement: requirement.clone(),
                    });
                }
                let satisfied = invocation
                    .tasks
                    .get(requirement)
                    .is_some_and(|run| run.status == TaskPhase::Succeeded);
                if !satisfied {
                    ready = false;
                    break;
                }
            }
            if ready {
                tasks.push(ScheduledTask {
                    task_id: task_id.clone(),
                });
            }
        }

        Ok(SchedulingPlan {
            invocation_id: invocation.id,
            tasks,
        })
    }
}
