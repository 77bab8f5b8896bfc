#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Generic concurrent task-processing substrate.
//!
//! Orchestrators push tasks onto a shared [`WorkingStack`] and a pool of
//! [`TaskProcessor`] loops drains it in LIFO order. The substrate is generic
//! over the task type: concrete task kinds live in the orchestrator crates as
//! tagged enums, so a processor never needs to know what it is executing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, error};

/// Interval a long-running processor sleeps for when the stack is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A unit of work with a human-readable description.
///
/// A task executes at most once; once popped from a [`WorkingStack`] it is
/// owned exclusively by the processor running it.
#[async_trait]
pub trait Task: Send + 'static {
    /// Human-readable description used in logs.
    fn description(&self) -> String;

    /// Execute the task, consuming it.
    async fn execute(self) -> anyhow::Result<()>;
}

/// Shared in-memory LIFO task queue.
///
/// Producers append with [`WorkingStack::add`]; consumers pop with
/// [`WorkingStack::get`], which returns `None` as the defined "no more work
/// right now" signal. No ordering fairness is guaranteed between producers.
pub struct WorkingStack<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for WorkingStack<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkingStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkingStack<T> {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append tasks to the top of the stack.
    pub fn add(&self, tasks: Vec<T>) {
        self.lock().extend(tasks);
    }

    /// Pop the most recently added task, if any.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Whether the stack currently holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of tasks currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observable state of one processor loop.
///
/// `Fetching` covers the window between observing the stack and settling on
/// either `Busy` or `Idle`, so aggregate idleness cannot be observed "true"
/// while a pop is mid-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// A fetch from the stack is in flight.
    Fetching,
    /// A task is executing.
    Busy,
    /// The last fetch returned nothing.
    Idle,
}

#[derive(Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ProcessorState::Idle as u8)))
    }

    fn set(&self, state: ProcessorState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn get(&self) -> ProcessorState {
        match self.0.load(Ordering::SeqCst) {
            0 => ProcessorState::Fetching,
            1 => ProcessorState::Busy,
            _ => ProcessorState::Idle,
        }
    }
}

/// One worker loop: repeatedly pulls a task, runs it, and swallows its errors.
///
/// A single task's failure never kills the worker; it is logged and the loop
/// continues. When the stack is empty the processor either returns
/// (`exit_on_completion`) or idles for `poll_interval` before retrying.
pub struct TaskProcessor<T> {
    stack: WorkingStack<T>,
    exit_on_completion: bool,
    poll_interval: Duration,
    state: StateCell,
}

impl<T: Task> TaskProcessor<T> {
    fn new(
        stack: WorkingStack<T>,
        exit_on_completion: bool,
        poll_interval: Duration,
        state: StateCell,
    ) -> Self {
        Self {
            stack,
            exit_on_completion,
            poll_interval,
            state,
        }
    }

    async fn run(self) {
        loop {
            self.state.set(ProcessorState::Fetching);
            match self.stack.get() {
                Some(task) => {
                    self.state.set(ProcessorState::Busy);
                    let description = task.description();
                    debug!(task = %description, "executing task");
                    if let Err(err) = task.execute().await {
                        error!(error = %err, task = %description, "task failed");
                    }
                }
                None => {
                    self.state.set(ProcessorState::Idle);
                    if self.exit_on_completion {
                        return;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// Runs N processor loops concurrently against one [`WorkingStack`].
pub struct TaskProcessorSpawner<T> {
    stack: WorkingStack<T>,
    exit_on_completion: bool,
    poll_interval: Duration,
    states: Vec<StateCell>,
}

impl<T: Task> TaskProcessorSpawner<T> {
    /// Create a spawner for `workers_num` processors.
    ///
    /// With `exit_on_completion` each processor returns the first time it
    /// observes an empty stack, so [`TaskProcessorSpawner::process`] settles
    /// once the current batch is drained. Without it the processors poll
    /// forever and the caller watches [`TaskProcessorSpawner::is_idle`].
    #[must_use]
    pub fn new(stack: WorkingStack<T>, workers_num: usize, exit_on_completion: bool) -> Self {
        Self {
            stack,
            exit_on_completion,
            poll_interval: DEFAULT_POLL_INTERVAL,
            states: (0..workers_num).map(|_| StateCell::new()).collect(),
        }
    }

    /// Override the empty-stack poll interval of long-running processors.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run all processor loops; resolves only once every loop has settled.
    ///
    /// In long-running mode this never resolves under normal operation.
    pub async fn process(&self) {
        let workers: Vec<_> = self
            .states
            .iter()
            .map(|state| {
                TaskProcessor::new(
                    self.stack.clone(),
                    self.exit_on_completion,
                    self.poll_interval,
                    state.clone(),
                )
                .run()
            })
            .collect();
        join_all(workers).await;
    }

    /// Whether the stack is empty and every processor reports idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
            && self
                .states
                .iter()
                .all(|state| state.get() == ProcessorState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    struct RecordingTask {
        label: u32,
        executed: Arc<Mutex<Vec<u32>>>,
        fail: bool,
    }

    #[async_trait]
    impl Task for RecordingTask {
        fn description(&self) -> String {
            format!("recording task {}", self.label)
        }

        async fn execute(self) -> anyhow::Result<()> {
            self.executed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.label);
            if self.fail {
                return Err(anyhow!("task {} failed on purpose", self.label));
            }
            Ok(())
        }
    }

    fn recording_tasks(
        labels: &[u32],
        executed: &Arc<Mutex<Vec<u32>>>,
        fail: bool,
    ) -> Vec<RecordingTask> {
        labels
            .iter()
            .map(|&label| RecordingTask {
                label,
                executed: Arc::clone(executed),
                fail,
            })
            .collect()
    }

    #[test]
    fn stack_pops_in_lifo_order() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let stack = WorkingStack::new();
        stack.add(recording_tasks(&[1, 2, 3], &executed, false));

        let order: Vec<u32> = std::iter::from_fn(|| stack.get().map(|task| task.label)).collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert!(stack.get().is_none());
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn bounded_spawner_drains_the_stack() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let stack = WorkingStack::new();
        stack.add(recording_tasks(&[1, 2, 3, 4, 5], &executed, false));

        let spawner = TaskProcessorSpawner::new(stack.clone(), 2, true);
        spawner.process().await;

        assert!(stack.is_empty());
        assert!(spawner.is_idle());
        let mut labels = executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        labels.sort_unstable();
        assert_eq!(labels, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn single_worker_executes_in_lifo_order() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let stack = WorkingStack::new();
        stack.add(recording_tasks(&[1, 2, 3], &executed, false));

        TaskProcessorSpawner::new(stack, 1, true).process().await;

        let labels = executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert_eq!(labels, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn task_failure_does_not_kill_the_worker() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let stack = WorkingStack::new();
        stack.add(recording_tasks(&[1, 2, 3], &executed, true));

        let spawner = TaskProcessorSpawner::new(stack, 1, true);
        spawner.process().await;

        assert_eq!(
            executed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            3
        );
        assert!(spawner.is_idle());
    }

    #[tokio::test]
    async fn long_running_spawner_reports_idleness() {
        struct SlowTask {
            release: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Task for SlowTask {
            fn description(&self) -> String {
                "slow task".to_string()
            }

            async fn execute(self) -> anyhow::Result<()> {
                while self.release.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            }
        }

        let release = Arc::new(AtomicUsize::new(0));
        let stack = WorkingStack::new();
        stack.add(vec![SlowTask {
            release: Arc::clone(&release),
        }]);

        let spawner = Arc::new(
            TaskProcessorSpawner::new(stack, 1, false)
                .with_poll_interval(Duration::from_millis(5)),
        );
        let runner = Arc::clone(&spawner);
        let handle = tokio::spawn(async move { runner.process().await });

        // Busy while the task is held open.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!spawner.is_idle());

        release.store(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(spawner.is_idle());

        handle.abort();
    }
}
