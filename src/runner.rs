use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::error::RunnerError;
use crate::graph::{Dependencies, Graph, Outcome, Settled};
use crate::options::{Options, RunnerBuilder};
use crate::plan::Mermaid;
use crate::work::{Output, Results, Work};

/// A named task graph together with the machinery to run it.
///
/// `Runner` is a cheap handle, clones share the same graph. The graph can only
/// be changed while no run is in progress, and only one run can be in flight
/// at a time. Both rules hold across all clones.
///
/// # Example
///
/// ```rust
/// use tasuki::{Runner, Work};
///
/// # futures::executor::block_on(async {
/// let runner = Runner::new();
/// runner.add("compile", (), Work::from_fn(|_| Ok("c")))?;
/// runner.add("bundle", "compile", Work::from_fn(|results| {
///     let compiled = results.get::<&str>("compile").copied().unwrap_or_default();
///     Ok(format!("{compiled}+b"))
/// }))?;
///
/// let output = runner.run("bundle").await?;
/// assert_eq!(output.downcast_ref::<String>().unwrap(), "c+b");
/// # Ok::<(), tasuki::RunnerError>(())
/// # }).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct Runner {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    graph: Mutex<Graph>,
    running: AtomicBool,
    options: Options,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph: Mutex::default(),
                running: AtomicBool::new(false),
                options,
            }),
        }
    }

    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::new()
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Registers a task.
    ///
    /// `dependencies` may be `()`, a single name, or a sequence of names, the
    /// names don't have to be registered yet. `work` may be `()` for a task that
    /// only groups its dependencies.
    pub fn add(
        &self,
        name: &str,
        dependencies: impl Into<Dependencies>,
        work: impl Into<Work>,
    ) -> Result<(), RunnerError> {
        check_name(name)?;
        let overwrite = !self.inner.options.throw_on_overwrite;

        let mut graph = self.inner.idle_graph()?;
        graph.insert(name, dependencies.into(), work.into(), overwrite)?;
        tracing::debug!(task = name, "added task");

        Ok(())
    }

    /// Removes a task if present. Other tasks keep their edges to it.
    pub fn remove(&self, name: &str) -> Result<(), RunnerError> {
        check_name(name)?;

        let mut graph = self.inner.idle_graph()?;
        if graph.remove(name) {
            tracing::debug!(task = name, "removed task");
        }

        Ok(())
    }

    pub fn add_dependencies(
        &self,
        name: &str,
        dependencies: impl Into<Dependencies>,
    ) -> Result<(), RunnerError> {
        check_name(name)?;
        let dependencies = check_dependencies(dependencies.into())?;

        let mut graph = self.inner.idle_graph()?;
        graph.add_dependencies(name, dependencies)
    }

    /// Strips edges from a task. Does nothing if the task doesn't exist.
    pub fn remove_dependencies(
        &self,
        name: &str,
        dependencies: impl Into<Dependencies>,
    ) -> Result<(), RunnerError> {
        check_name(name)?;
        let dependencies = check_dependencies(dependencies.into())?;

        let mut graph = self.inner.idle_graph()?;
        graph.remove_dependencies(name, &dependencies);

        Ok(())
    }

    /// Every registered task with its dependencies. Allowed during a run.
    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.graph().list()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.graph().contains(name)
    }

    pub fn len(&self) -> usize {
        self.inner.graph().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The tasks `run(name)` would execute, dependencies first, without
    /// executing anything. Fails the same way a run would on missing tasks
    /// and cycles.
    pub fn plan(&self, name: &str) -> Result<Vec<String>, RunnerError> {
        check_name(name)?;
        self.inner.graph().plan(name)
    }

    /// Renders the whole graph as a Mermaid flowchart.
    pub fn render_mermaid(&self) -> String {
        Mermaid(self.list()).to_string()
    }

    /// Runs task `name` after its whole dependency closure, and resolves with
    /// the task's own output.
    ///
    /// The gate checks and the traversal of the graph happen right away, before
    /// the returned future is first polled. A missing argument or a run already
    /// in flight is reported by the future without any task being started.
    ///
    /// Within one run, every task executes at most once no matter how many
    /// tasks depend on it, and never before all of its dependencies succeeded.
    pub fn run(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Output, RunnerError>> + Send + use<> {
        let span = tracing::info_span!("run", task = name);
        let started = span.in_scope(|| self.start(name));
        let name = name.to_string();

        async move {
            let (guard, mut tasks, outcome) = started?;
            while tasks.next().await.is_some() {}

            let settled = outcome
                .await
                .unwrap_or_else(|_| Err(RunnerError::Abandoned(name.clone())));
            drop(guard);

            match settled {
                Ok(results) => {
                    tracing::debug!("run finished");
                    results
                        .take(&name)
                        .ok_or(RunnerError::TaskNotFound(name))
                }
                Err(err) => {
                    tracing::debug!(error = %err, "run failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
    }

    fn start(&self, name: &str) -> Result<(RunGuard, Tasks, Outcome), RunnerError> {
        check_name(name)?;

        {
            let _graph = self.inner.graph();
            if self.inner.running.swap(true, Ordering::AcqRel) {
                return Err(RunnerError::RunInProgress);
            }
        }

        let guard = RunGuard {
            inner: self.inner.clone(),
        };
        let mut tasks = Tasks::new();
        let outcome = self.inner.schedule(name, &mut tasks)?;

        Ok((guard, tasks, outcome))
    }
}

/// The resolutions queued by one run, all polled from the run's own future.
type Tasks = FuturesUnordered<BoxFuture<'static, ()>>;

/// A task whose dependencies are still being wired.
struct Frame {
    name: String,
    work: Work,
    remaining: std::vec::IntoIter<String>,
    pending: Vec<Outcome>,
}

enum Visit {
    /// Already wired earlier in this run.
    Wired(Outcome),
    Entered(Frame),
}

impl Inner {
    fn graph(&self) -> MutexGuard<'_, Graph> {
        // User code never runs under this lock.
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_graph(&self) -> Result<MutexGuard<'_, Graph>, RunnerError> {
        let graph = self.graph();
        if self.running.load(Ordering::Acquire) {
            return Err(RunnerError::RunInProgress);
        }
        Ok(graph)
    }

    /// Eagerly walks the graph from `name`, wiring up one shared outcome per
    /// reachable task and queueing its resolution in `tasks`.
    ///
    /// The walk is depth first with an explicit stack, so graph depth is bound
    /// by memory only. A task already wired in this run hands out its existing
    /// outcome. A task met again while its own dependencies are still being
    /// wired is on the active path, which means a cycle.
    fn schedule(self: &Arc<Self>, name: &str, tasks: &mut Tasks) -> Result<Outcome, RunnerError> {
        let mut frame = match self.visit(name)? {
            Visit::Wired(outcome) => return Ok(outcome),
            Visit::Entered(frame) => frame,
        };
        let mut stack = Vec::new();

        loop {
            if let Some(dep) = frame.remaining.next() {
                match self.visit(&dep) {
                    Ok(Visit::Entered(child)) => stack.push(mem::replace(&mut frame, child)),
                    Ok(Visit::Wired(outcome)) => frame.pending.push(outcome),
                    // A dependency that can't even be scheduled still counts as
                    // a settled failure, its siblings get scheduled regardless.
                    Err(err) => frame.pending.push(settled(Err(err))),
                }
                continue;
            }

            let outcome = self.wire(frame, tasks);
            match stack.pop() {
                Some(parent) => {
                    frame = parent;
                    frame.pending.push(outcome);
                }
                None => return Ok(outcome),
            }
        }
    }

    fn visit(&self, name: &str) -> Result<Visit, RunnerError> {
        let (dependencies, work) = {
            let mut graph = self.graph();
            let node = graph
                .get_mut(name)
                .ok_or_else(|| RunnerError::TaskNotFound(name.to_string()))?;

            if let Some(outcome) = &node.in_flight {
                tracing::trace!(task = name, "reusing in-flight outcome");
                return Ok(Visit::Wired(outcome.clone()));
            }

            if node.visiting {
                return Err(RunnerError::CycleDetected(name.to_string()));
            }

            node.visiting = true;
            (node.dependencies.clone(), node.work.clone())
        };

        tracing::trace!(task = name, ?dependencies, "starting task");
        self.options.notify_start(name, &dependencies);

        Ok(Visit::Entered(Frame {
            name: name.to_string(),
            work,
            pending: Vec::with_capacity(dependencies.len()),
            remaining: dependencies.into_iter(),
        }))
    }

    /// Queues the resolution of a task whose dependencies are all wired and
    /// installs its outcome as the in-flight one.
    fn wire(self: &Arc<Self>, frame: Frame, tasks: &mut Tasks) -> Outcome {
        let Frame {
            name,
            work,
            pending,
            ..
        } = frame;

        let (sender, receiver) = oneshot::channel();
        let outcome = receiver.shared();

        if let Some(node) = self.graph().get_mut(&name) {
            node.visiting = false;
            node.in_flight = Some(outcome.clone());
        }

        let span = tracing::info_span!("task", task = name.as_str());
        let inner = self.clone();
        let task = async move {
            let settled = inner.resolve(name, pending, work).await;
            // Nobody is left to tell once the run itself is gone.
            let _ = sender.send(settled);
        };
        tasks.push(task.instrument(span).boxed());

        outcome
    }

    async fn resolve(self: Arc<Self>, name: String, pending: Vec<Outcome>, work: Work) -> Settled {
        let mut results = Results::new();
        let mut failure = None;

        for settled in future::join_all(pending).await {
            let settled = settled.unwrap_or_else(|_| Err(RunnerError::Abandoned(name.clone())));
            match settled {
                Ok(dep) => results.merge(dep),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            self.settle(&name);
            tracing::debug!(error = %err, "dependency failed, task cancelled");
            self.options.notify_cancel(&name);
            return Err(err);
        }

        let outcome = work.call(results).await;
        self.settle(&name);

        match outcome {
            Ok(output) => {
                tracing::trace!("task finished");
                self.options.notify_end(&name);
                Ok(Results::single(name, output))
            }
            Err(err) => {
                tracing::debug!(error = %err, "task failed");
                self.options.notify_fail(&name, &err);
                Err(RunnerError::Task(name, err))
            }
        }
    }

    fn settle(&self, name: &str) {
        if let Some(node) = self.graph().get_mut(name) {
            node.in_flight = None;
        }
    }
}

/// An outcome that is settled from the start.
fn settled(result: Settled) -> Outcome {
    let (sender, receiver) = oneshot::channel();
    let _ = sender.send(result);
    receiver.shared()
}

/// Ends a run, however it ends: success, failure, or the run future being
/// dropped half-way.
struct RunGuard {
    inner: Arc<Inner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut graph = self.inner.graph();
        graph.reset_markers();
        self.inner.running.store(false, Ordering::Release);
    }
}

fn check_name(name: &str) -> Result<(), RunnerError> {
    if name.is_empty() {
        return Err(RunnerError::InvalidArgument("task name must not be empty"));
    }
    Ok(())
}

fn check_dependencies(dependencies: Dependencies) -> Result<Dependencies, RunnerError> {
    if dependencies.is_empty() {
        return Err(RunnerError::InvalidArgument("dependencies must not be empty"));
    }
    Ok(dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn markers_rest_after_success() {
        let runner = Runner::new();
        runner.add("a", (), ()).unwrap();
        runner.add("b", "a", ()).unwrap();
        runner.add("c", ["a", "b"], ()).unwrap();

        runner.run("c").await.unwrap();

        assert!(!runner.is_running());
        assert!(runner.inner.graph().is_at_rest());
    }

    #[tokio::test]
    async fn markers_rest_after_cycle() {
        let runner = Runner::new();
        runner.add("a", "b", ()).unwrap();
        runner.add("b", "c", ()).unwrap();
        runner.add("c", "a", ()).unwrap();

        let err = runner.run("a").await.unwrap_err();

        assert!(matches!(err, RunnerError::CycleDetected(_)));
        assert!(runner.inner.graph().is_at_rest());
    }

    #[tokio::test]
    async fn markers_rest_when_run_is_dropped() {
        let runner = Runner::new();
        runner
            .add(
                "slow",
                (),
                Work::from_future(|_| future::pending::<anyhow::Result<()>>()),
            )
            .unwrap();

        let run = runner.run("slow");
        assert!(runner.is_running());
        assert!(!runner.inner.graph().is_at_rest());

        drop(run);
        assert!(!runner.is_running());
        assert!(runner.inner.graph().is_at_rest());
    }

    #[test]
    fn deep_chain_is_wired_without_recursion() {
        let runner = Runner::new();
        runner.add("t0", (), ()).unwrap();
        for i in 1..20_000 {
            runner
                .add(&format!("t{i}"), format!("t{}", i - 1), ())
                .unwrap();
        }

        let run = runner.run("t19999");
        assert!(runner.is_running());

        drop(run);
        assert!(runner.inner.graph().is_at_rest());
    }

    #[test]
    fn introspection_follows_mutations() {
        let runner = Runner::builder().throw_on_overwrite(false).build();
        assert!(runner.is_empty());
        assert!(!runner.options().throw_on_overwrite);

        runner.add("a", (), ()).unwrap();
        runner.add("b", "a", ()).unwrap();
        runner.add("b", (), ()).unwrap();
        assert_eq!(runner.len(), 2);
        assert!(runner.contains("b"));

        runner.remove("a").unwrap();
        assert_eq!(runner.len(), 1);
        assert!(!runner.contains("a"));
        assert!(!runner.is_empty());
        assert!(Runner::new().options().throw_on_overwrite);
    }

    #[tokio::test]
    async fn shared_dependency_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let runner = Runner::new();
        runner
            .add(
                "base",
                (),
                Work::from_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        runner.add("left", "base", ()).unwrap();
        runner.add("right", "base", ()).unwrap();
        runner.add("top", ["left", "right", "base"], ()).unwrap();

        runner.run("top").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_arguments_are_rejected() {
        let runner = Runner::new();

        assert!(matches!(
            runner.add("", (), ()),
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(matches!(runner.remove(""), Err(RunnerError::InvalidArgument(_))));
        assert!(matches!(
            runner.add_dependencies("a", ()),
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(matches!(
            runner.remove_dependencies("a", ()),
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(matches!(
            runner.run("").await,
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(!runner.is_running());
    }
}
