use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::Runner;
use crate::error::TaskError;

pub type StartHook = Arc<dyn Fn(&str, &[String]) + Send + Sync>;
pub type TaskHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type FailHook = Arc<dyn Fn(&str, &TaskError) + Send + Sync>;

/// Construction-time configuration of a [`Runner`].
///
/// The observers are plain notifications, invoked synchronously at the
/// matching point of a task's lifecycle. They cannot change how a run goes.
#[derive(Clone)]
pub struct Options {
    /// Reject adding a task under a name that is already registered. When
    /// `false`, the old task is silently replaced.
    pub throw_on_overwrite: bool,
    /// A task was reached by a run; receives its dependency names.
    pub on_task_start: Option<StartHook>,
    /// A task finished its work successfully.
    pub on_task_end: Option<TaskHook>,
    /// A task's own work failed.
    pub on_task_fail: Option<FailHook>,
    /// A task was skipped because one of its dependencies failed.
    pub on_task_cancel: Option<TaskHook>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            throw_on_overwrite: true,
            on_task_start: None,
            on_task_end: None,
            on_task_fail: None,
            on_task_cancel: None,
        }
    }
}

impl Debug for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("throw_on_overwrite", &self.throw_on_overwrite)
            .field("on_task_start", &self.on_task_start.is_some())
            .field("on_task_end", &self.on_task_end.is_some())
            .field("on_task_fail", &self.on_task_fail.is_some())
            .field("on_task_cancel", &self.on_task_cancel.is_some())
            .finish()
    }
}

impl Options {
    pub(crate) fn notify_start(&self, name: &str, dependencies: &[String]) {
        if let Some(hook) = &self.on_task_start {
            hook(name, dependencies);
        }
    }

    pub(crate) fn notify_end(&self, name: &str) {
        if let Some(hook) = &self.on_task_end {
            hook(name);
        }
    }

    pub(crate) fn notify_fail(&self, name: &str, err: &TaskError) {
        if let Some(hook) = &self.on_task_fail {
            hook(name, err);
        }
    }

    pub(crate) fn notify_cancel(&self, name: &str) {
        if let Some(hook) = &self.on_task_cancel {
            hook(name);
        }
    }
}

/// Step-by-step construction of a [`Runner`].
///
/// # Example
///
/// ```rust
/// use tasuki::Runner;
///
/// let runner = Runner::builder()
///     .throw_on_overwrite(false)
///     .on_task_start(|name, deps| println!("{name} <- {deps:?}"))
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct RunnerBuilder {
    options: Options,
}

impl RunnerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throw_on_overwrite(mut self, value: bool) -> Self {
        self.options.throw_on_overwrite = value;
        self
    }

    pub fn on_task_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &[String]) + Send + Sync + 'static,
    {
        self.options.on_task_start = Some(Arc::new(hook));
        self
    }

    pub fn on_task_end<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.options.on_task_end = Some(Arc::new(hook));
        self
    }

    pub fn on_task_fail<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &TaskError) + Send + Sync + 'static,
    {
        self.options.on_task_fail = Some(Arc::new(hook));
        self
    }

    pub fn on_task_cancel<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.options.on_task_cancel = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Runner {
        Runner::with_options(self.options)
    }
}
