use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::saga::log::{SagaLog, SagaLogError};

pub mod log;

pub type SagaId = Uuid;

/// Opaque error raised by a step's forward or compensating action.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Status of a single step within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not reached yet.
    Pending,
    /// The forward action was started; whether it completed is unknown until
    /// the next checkpoint.
    Executing,
    /// The forward action completed.
    Done,
    /// The forward action failed; this step triggered compensation.
    CompensationNeeded,
    /// The compensating action was started.
    Compensating,
    /// The compensating action completed.
    Compensated,
    /// The compensating action failed. Terminal for the whole saga.
    Failed,
}

/// Status of a saga as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Running,
    /// Every step is `Done`.
    Completed,
    /// A forward action failed; compensations are running in reverse order.
    Compensating,
    /// Every previously completed step was compensated.
    Compensated,
    /// A compensating action failed. Terminal: requires operator
    /// intervention, compensations are never retried automatically.
    CompensationFailed,
}

/// Checkpointed status of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
}

/// One entry of the compensation log: a step whose compensating action
/// completed, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub step: String,
    pub compensated_on: DateTime<Utc>,
}

/// The persisted state of a saga: plain data, so restart logic and test
/// assertions operate on checkpoints rather than on suspended control flow.
///
/// Owned exclusively by the [`SagaCoordinator`] for its lifetime; removed
/// from the log on terminal success, kept on `Compensated` and
/// `CompensationFailed` for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: SagaId,
    pub name: String,
    pub status: SagaStatus,
    pub steps: Vec<StepRecord>,
    /// Index of the step currently being driven (or, once compensating, of
    /// the step whose forward action failed).
    pub current_step: usize,
    pub compensation_log: Vec<CompensationEntry>,
}

impl SagaInstance {
    fn new(name: &str, steps: &[Box<dyn SagaStep>]) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            status: SagaStatus::Running,
            steps: steps
                .iter()
                .map(|step| StepRecord {
                    name: step.name().to_owned(),
                    status: StepStatus::Pending,
                })
                .collect(),
            current_step: 0,
            compensation_log: vec![],
        }
    }

    fn matches(&self, steps: &[Box<dyn SagaStep>]) -> bool {
        self.steps.len() == steps.len()
            && self
                .steps
                .iter()
                .zip(steps)
                .all(|(record, step)| record.name == step.name())
    }
}

/// One step of a saga: a forward action and the compensating action that
/// undoes it.
///
/// Delivery is at-least-once: a step interrupted by a crash is re-executed on
/// resume, so both actions are expected to be idempotent.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Identifies the step within its saga; recorded in checkpoints and
    /// matched against them on resume.
    fn name(&self) -> &str;

    /// The forward action.
    async fn execute(&self) -> Result<(), StepError>;

    /// The compensating action, undoing a completed [`execute`](SagaStep::execute).
    async fn compensate(&self) -> Result<(), StepError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// A forward action failed and every previously completed step was
    /// compensated, in reverse order. The business transaction did not
    /// happen, but the system is consistent.
    #[error("saga {name} compensated: step {step} failed: {source}")]
    Compensated {
        name: String,
        step: String,
        source: StepError,
        instance: SagaInstance,
    },
    /// A compensating action failed. The saga is terminal and partial state
    /// is surfaced, not hidden: an operator has to intervene.
    #[error("saga {name} compensation failed at step {step}: {source}")]
    CompensationFailed {
        name: String,
        step: String,
        source: StepError,
        instance: SagaInstance,
    },
    /// A checkpoint could not be persisted. The saga halts where it is:
    /// forward progress is never made ahead of its checkpoint.
    #[error("saga checkpoint could not be persisted: {0}")]
    Checkpoint(#[source] SagaLogError),
    /// `resume` was asked for a saga the log does not know.
    #[error("saga {0} not found in the log")]
    NotFound(SagaId),
    /// The given step list does not match the checkpointed one.
    #[error("saga {name}: step list does not match its checkpoint")]
    StepMismatch { name: String },
}

impl SagaError {
    /// The checkpointed instance attached to a terminal failure, if any.
    pub fn instance(&self) -> Option<&SagaInstance> {
        match self {
            Self::Compensated { instance, .. } | Self::CompensationFailed { instance, .. } => {
                Some(instance)
            }
            _ => None,
        }
    }
}

/// The `SagaCoordinator` drives sagas: ordered steps across aggregates and
/// handlers, executed strictly in sequence, with the instance checkpointed
/// to a [`SagaLog`] after every state transition so that a crash mid-saga
/// resumes in the same state.
pub struct SagaCoordinator<L>
where
    L: SagaLog,
{
    log: L,
}

impl<L> SagaCoordinator<L>
where
    L: SagaLog,
{
    pub fn new(log: L) -> Self {
        Self { log }
    }

    /// Returns the internal saga log
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Creates a saga over `steps`, checkpoints it, and drives it to a
    /// terminal state.
    ///
    /// Returns the completed instance, or a [`SagaError::Compensated`] /
    /// [`SagaError::CompensationFailed`] carrying the checkpointed instance.
    #[tracing::instrument(skip_all, fields(saga = name))]
    pub async fn run(
        &self,
        name: &str,
        steps: &[Box<dyn SagaStep>],
    ) -> Result<SagaInstance, SagaError> {
        let instance = SagaInstance::new(name, steps);
        self.checkpoint(&instance).await?;
        self.drive(instance, steps).await
    }

    /// Resumes a saga from its last checkpoint, e.g. after a crash.
    ///
    /// The given steps must match the checkpointed step list. A step that
    /// was `Executing` when the checkpoint was written is re-executed;
    /// delivery is at-least-once and steps are expected idempotent. A saga
    /// already in a terminal state is returned as-is.
    #[tracing::instrument(skip_all, fields(saga = %id), err)]
    pub async fn resume(
        &self,
        id: SagaId,
        steps: &[Box<dyn SagaStep>],
    ) -> Result<SagaInstance, SagaError> {
        let instance = self
            .log
            .load(id)
            .await
            .map_err(SagaError::Checkpoint)?
            .ok_or(SagaError::NotFound(id))?;

        match instance.status {
            SagaStatus::Running => self.drive(instance, steps).await,
            SagaStatus::Compensating => {
                if !instance.matches(steps) {
                    return Err(SagaError::StepMismatch {
                        name: instance.name,
                    });
                }
                // The original failure was lost with the crashed process.
                let source: StepError = "saga interrupted while compensating".into();
                self.compensate(instance, steps, source).await
            }
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::CompensationFailed => {
                Ok(instance)
            }
        }
    }

    async fn drive(
        &self,
        mut instance: SagaInstance,
        steps: &[Box<dyn SagaStep>],
    ) -> Result<SagaInstance, SagaError> {
        if !instance.matches(steps) {
            return Err(SagaError::StepMismatch {
                name: instance.name,
            });
        }

        while instance.current_step < steps.len() {
            let index = instance.current_step;
            let step = &steps[index];

            instance.steps[index].status = StepStatus::Executing;
            self.checkpoint(&instance).await?;

            let span = tracing::debug_span!(
                "chorus.saga_step",
                saga = %instance.name,
                step = step.name()
            );

            match step.execute().instrument(span).await {
                Ok(()) => {
                    instance.steps[index].status = StepStatus::Done;
                    instance.current_step = index + 1;
                    self.checkpoint(&instance).await?;
                }
                Err(source) => {
                    tracing::error!(
                        saga = %instance.name,
                        step = step.name(),
                        error = ?source,
                        "saga step failed, compensating completed steps"
                    );
                    instance.steps[index].status = StepStatus::CompensationNeeded;
                    instance.status = SagaStatus::Compensating;
                    self.checkpoint(&instance).await?;
                    return self.compensate(instance, steps, source).await;
                }
            }
        }

        instance.status = SagaStatus::Completed;
        self.checkpoint(&instance).await?;
        // Terminal success destroys the checkpoint.
        self.log.remove(instance.id).await.map_err(SagaError::Checkpoint)?;
        Ok(instance)
    }

    /// Runs the compensating actions of every completed step, in strict
    /// reverse order, checkpointing each transition.
    async fn compensate(
        &self,
        mut instance: SagaInstance,
        steps: &[Box<dyn SagaStep>],
        source: StepError,
    ) -> Result<SagaInstance, SagaError> {
        let failed_step: String = instance.steps[instance.current_step].name.clone();

        for index in (0..instance.current_step).rev() {
            match instance.steps[index].status {
                // `Compensating` happens on resume: the compensation was
                // interrupted mid-flight and is re-run.
                StepStatus::Done | StepStatus::Compensating => {}
                _ => continue,
            }

            instance.steps[index].status = StepStatus::Compensating;
            self.checkpoint(&instance).await?;

            match steps[index].compensate().await {
                Ok(()) => {
                    instance.steps[index].status = StepStatus::Compensated;
                    instance.compensation_log.push(CompensationEntry {
                        step: instance.steps[index].name.clone(),
                        compensated_on: Utc::now(),
                    });
                    self.checkpoint(&instance).await?;
                }
                Err(compensation_source) => {
                    tracing::error!(
                        saga = %instance.name,
                        step = steps[index].name(),
                        error = ?compensation_source,
                        "saga compensation failed, operator intervention required"
                    );
                    instance.steps[index].status = StepStatus::Failed;
                    instance.status = SagaStatus::CompensationFailed;
                    self.checkpoint(&instance).await?;
                    return Err(SagaError::CompensationFailed {
                        name: instance.name.clone(),
                        step: instance.steps[index].name.clone(),
                        source: compensation_source,
                        instance,
                    });
                }
            }
        }

        instance.status = SagaStatus::Compensated;
        self.checkpoint(&instance).await?;
        Err(SagaError::Compensated {
            name: instance.name.clone(),
            step: failed_step,
            source,
            instance,
        })
    }

    async fn checkpoint(&self, instance: &SagaInstance) -> Result<(), SagaError> {
        self.log.persist(instance).await.map_err(SagaError::Checkpoint)
    }
}
