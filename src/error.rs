use std::sync::Arc;

use thiserror::Error;

/// The error a task's own work failed with.
///
/// The original [`anyhow::Error`] is kept untouched behind an [`Arc`], so the
/// same failure can be handed to every task waiting on the shared outcome.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct TaskError(#[from] pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The error exactly as the task produced it.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the original error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

/// A callback task let go of its [`Completion`](crate::Completion) without
/// ever signalling it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Task completion was dropped without being signalled")]
pub struct CompletionDropped;

#[derive(Debug, Error, Clone)]
pub enum RunnerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("A run is already in progress")]
    RunInProgress,

    #[error("Task '{0}' already exists")]
    AlreadyExists(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Cycle detected at task '{0}'")]
    CycleDetected(String),

    #[error("Task '{0}':\n{1}")]
    Task(String, #[source] TaskError),

    /// The run was torn down before the task could settle.
    #[error("Task '{0}' was abandoned before it settled")]
    Abandoned(String),
}

impl RunnerError {
    /// The name of the task this error is about, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            RunnerError::AlreadyExists(name)
            | RunnerError::TaskNotFound(name)
            | RunnerError::CycleDetected(name)
            | RunnerError::Task(name, _)
            | RunnerError::Abandoned(name) => Some(name),
            RunnerError::InvalidArgument(_) | RunnerError::RunInProgress => None,
        }
    }

    /// The error raised by the task's own work, when that is what failed.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            RunnerError::Task(_, err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn task_error_keeps_original() {
        let err = RunnerError::Task("x".into(), TaskError::new(Boom));

        assert_eq!(err.task(), Some("x"));
        assert!(err.task_error().unwrap().downcast_ref::<Boom>().is_some());
        assert_eq!(err.to_string(), "Task 'x':\nboom");
    }

    #[test]
    fn clones_share_the_same_error() {
        let err = TaskError::new(anyhow::anyhow!("shared"));
        let copy = err.clone();

        assert!(Arc::ptr_eq(&err.0, &copy.0));
    }

    #[test]
    fn gate_errors_have_no_task() {
        assert_eq!(RunnerError::RunInProgress.task(), None);
        assert_eq!(RunnerError::InvalidArgument("name").task(), None);
        assert_eq!(RunnerError::Abandoned("t".into()).task(), Some("t"));
    }
}
