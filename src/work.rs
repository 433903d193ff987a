//! Adapting user task functions into one uniform asynchronous contract.
//!
//! A task can finish in three ways: it can return a value right away, return a
//! future, or be handed a [`Completion`] which it signals whenever it is done.
//! Each of those is tagged exactly once, when the [`Work`] is constructed, and
//! erased into the same shape: `Results -> BoxFuture<Result<Output, TaskError>>`.
//! The engine never looks at the shape again after registration.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::oneshot;

use crate::error::{CompletionDropped, TaskError};

pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// The type-erased value produced by a task.
///
/// Cloning is cheap, every clone points at the same value.
#[derive(Clone)]
pub struct Output(pub(crate) Dynamic);

impl Output {
    pub fn new<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self(Arc::new(value))
    }

    /// The value of a task that produced nothing.
    pub fn unit() -> Self {
        Self::new(())
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Recovers the concrete value, handing the output back on type mismatch.
    pub fn downcast<T>(self) -> Result<Arc<T>, Self>
    where
        T: Send + Sync + 'static,
    {
        self.0.downcast::<T>().map_err(Self)
    }
}

impl Debug for Output {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is::<()>() {
            f.write_str("Output(())")
        } else {
            f.write_str("Output(..)")
        }
    }
}

/// The outputs of the dependencies a task declared, keyed by task name.
#[derive(Clone, Default)]
pub struct Results {
    map: HashMap<String, Output>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn single(name: impl Into<String>, output: Output) -> Self {
        let mut map = HashMap::with_capacity(1);
        map.insert(name.into(), output);
        Self { map }
    }

    /// Folds another mapping into this one, later entries win on collision.
    pub(crate) fn merge(&mut self, other: Results) {
        self.map.extend(other.map);
    }

    pub(crate) fn take(mut self, name: &str) -> Option<Output> {
        self.map.remove(name)
    }

    /// Typed access to the output of dependency `name`.
    ///
    /// Returns `None` both when there is no such dependency and when its output
    /// has a different type.
    pub fn get<T: 'static>(&self, name: &str) -> Option<&T> {
        self.map
            .get(name)
            .and_then(|output| output.downcast_ref::<T>())
    }

    pub fn output(&self, name: &str) -> Option<&Output> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Debug for Results {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Results").field("names", &names).finish()
    }
}

/// Lets a callback-style task report when it is done.
///
/// Signalling consumes the handle, so a task completes at most once. Dropping
/// it without signalling fails the task with [`CompletionDropped`].
pub struct Completion<T = ()> {
    sender: oneshot::Sender<Result<Output, TaskError>>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> Completion<T>
where
    T: Send + Sync + 'static,
{
    fn new(sender: oneshot::Sender<Result<Output, TaskError>>) -> Self {
        Self {
            sender,
            _phantom: PhantomData,
        }
    }

    /// Error-first completion: any error fails the task, otherwise it resolves
    /// with `value`, or with `()` when there is none.
    pub fn done(self, error: Option<anyhow::Error>, value: Option<T>) {
        let outcome = match (error, value) {
            (Some(err), _) => Err(TaskError::from(err)),
            (None, Some(value)) => Ok(Output::new(value)),
            (None, None) => Ok(Output::unit()),
        };

        // The receiver is only gone when nobody awaits this task anymore.
        let _ = self.sender.send(outcome);
    }

    pub fn ok(self, value: T) {
        self.done(None, Some(value))
    }

    pub fn fail(self, err: impl Into<anyhow::Error>) {
        self.done(Some(err.into()), None)
    }

    /// Completes without producing a value.
    pub fn finish(self) {
        self.done(None, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Noop,
    Plain,
    Future,
    Callback,
}

type WorkFn = dyn Fn(Results) -> BoxFuture<'static, Result<Output, TaskError>> + Send + Sync;

/// The adapted body of a task.
#[derive(Clone)]
pub struct Work {
    shape: Shape,
    call: Arc<WorkFn>,
}

impl Work {
    /// A task that does nothing and resolves with `()`.
    pub fn noop() -> Self {
        Self {
            shape: Shape::Noop,
            call: Arc::new(|_: Results| {
                future::ready(Ok::<_, TaskError>(Output::unit())).boxed()
            }),
        }
    }

    /// A task computing its value synchronously.
    ///
    /// Returning `Err` fails the task, and so does a panic.
    pub fn from_fn<F, T>(f: F) -> Self
    where
        F: Fn(&Results) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let call = move |results: Results| {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f(&results))) {
                Ok(Ok(value)) => Ok(Output::new(value)),
                Ok(Err(err)) => Err(TaskError::from(err)),
                Err(panic) => Err(panicked(panic)),
            };

            future::ready(outcome).boxed()
        };

        Self {
            shape: Shape::Plain,
            call: Arc::new(call),
        }
    }

    /// A task returning a future; its resolution and failure pass through as-is.
    pub fn from_future<F, Fut, T>(f: F) -> Self
    where
        F: Fn(Results) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let call = move |results: Results| {
            let fut = match panic::catch_unwind(AssertUnwindSafe(|| f(results))) {
                Ok(fut) => fut,
                Err(panic) => return future::ready(Err(panicked(panic))).boxed(),
            };

            AssertUnwindSafe(fut)
                .catch_unwind()
                .map(|outcome| match outcome {
                    Ok(Ok(value)) => Ok(Output::new(value)),
                    Ok(Err(err)) => Err(TaskError::from(err)),
                    Err(panic) => Err(panicked(panic)),
                })
                .boxed()
        };

        Self {
            shape: Shape::Future,
            call: Arc::new(call),
        }
    }

    /// A task that signals completion through the [`Completion`] it is given.
    ///
    /// The completion may be moved anywhere, e.g. into a spawned thread, and
    /// signalled later.
    pub fn from_callback<F, T>(f: F) -> Self
    where
        F: Fn(Results, Completion<T>) + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let call = move |results: Results| {
            let (sender, receiver) = oneshot::channel();
            let completion = Completion::new(sender);

            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| f(results, completion))) {
                return future::ready(Err(panicked(panic))).boxed();
            }

            receiver
                .map(|outcome| outcome.unwrap_or_else(|_| Err(TaskError::new(CompletionDropped))))
                .boxed()
        };

        Self {
            shape: Shape::Callback,
            call: Arc::new(call),
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub(crate) fn call(&self, results: Results) -> BoxFuture<'static, Result<Output, TaskError>> {
        (self.call)(results)
    }
}

impl Default for Work {
    fn default() -> Self {
        Self::noop()
    }
}

impl From<()> for Work {
    fn from(_: ()) -> Self {
        Self::noop()
    }
}

impl From<Option<Work>> for Work {
    fn from(work: Option<Work>) -> Self {
        work.unwrap_or_default()
    }
}

impl Debug for Work {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work").field("shape", &self.shape).finish()
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> TaskError {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    };

    TaskError::new(anyhow::anyhow!(msg))
}
