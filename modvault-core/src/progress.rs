/*!
Progress reporting and background execution for long-running operations.

Installs, backups and restores hand their work to a [`BackgroundTask`], which
the caller either runs inline or starts on its own thread and joins later.
Progress flows through a [`ProgressSink`]; the [`ProgressTracker`] in front of
it guarantees the reported percentages never decrease and that 100 is
reported exactly once, when the work is complete.
*/

use crate::{Result, VaultError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

/// Receiver of percentage updates (0..=100)
///
/// Implementations may be called from any thread.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

/// Sink that discards every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8) {}
}

/// Sink that stores the latest value for UIs that poll
#[derive(Debug, Default)]
pub struct AtomicProgress {
    value: AtomicU8,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest reported percentage
    pub fn get(&self) -> u8 {
        self.value.load(Ordering::Acquire)
    }
}

impl ProgressSink for AtomicProgress {
    fn report(&self, percent: u8) {
        self.value.store(percent, Ordering::Release);
    }
}

/// Sink that forwards updates over a channel; a dropped receiver is ignored
pub struct ChannelProgress {
    sender: Mutex<mpsc::Sender<u8>>,
}

impl ChannelProgress {
    pub fn new(sender: mpsc::Sender<u8>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, percent: u8) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(percent);
        }
    }
}

/// Converts units of work into monotonic percentages
///
/// While work is in flight the reported value is capped at 99; only
/// [`ProgressTracker::finish`] reports 100. Repeated values are suppressed.
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    total: u64,
    done: u64,
    last: Option<u8>,
    finished: bool,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn ProgressSink>, total: u64) -> Self {
        Self {
            sink,
            total,
            done: 0,
            last: None,
            finished: false,
        }
    }

    /// Report 0% if nothing has been reported yet
    pub fn start(&mut self) {
        if self.last.is_none() {
            self.emit(0);
        }
    }

    /// Record `units` of completed work
    pub fn advance(&mut self, units: u64) {
        if self.finished {
            return;
        }
        self.done = self.done.saturating_add(units);
        let percent = if self.total == 0 {
            0
        } else {
            ((self.done.min(self.total) as u128 * 100) / self.total as u128) as u8
        };
        self.emit(percent.min(99));
    }

    /// Report 100%; later calls are no-ops
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(100);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn emit(&mut self, percent: u8) {
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            self.sink.report(percent);
        }
    }
}

/// Lifecycle of a background operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running(u8),
    Completed,
    Failed(String),
}

type Work<T> = Box<dyn FnOnce(Arc<dyn ProgressSink>) -> Result<T> + Send + 'static>;

/// A unit of work the caller can run inline or start on a dedicated thread
pub struct BackgroundTask<T> {
    name: String,
    work: Work<T>,
    sink: Arc<dyn ProgressSink>,
    state: Arc<Mutex<TaskState>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    /// Wrap `work`; it receives the sink to report progress through
    pub fn new<F>(name: impl Into<String>, sink: Arc<dyn ProgressSink>, work: F) -> Self
    where
        F: FnOnce(Arc<dyn ProgressSink>) -> Result<T> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Box::new(work),
            sink,
            state: Arc::new(Mutex::new(TaskState::Idle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        read_state(&self.state)
    }

    /// Run on the current thread
    pub fn run(self) -> Result<T> {
        let BackgroundTask {
            name,
            work,
            sink,
            state,
        } = self;
        execute(&name, work, sink, &state)
    }

    /// Start on a new thread and return a handle to join it
    pub fn start(self) -> Result<TaskHandle<T>> {
        let BackgroundTask {
            name,
            work,
            sink,
            state,
        } = self;
        let thread_state = Arc::clone(&state);
        let thread_name = name.clone();

        let join = thread::Builder::new()
            .name(format!("modvault-{name}"))
            .spawn(move || execute(&thread_name, work, sink, &thread_state))
            .map_err(|e| VaultError::io(format!("<thread modvault-{name}>"), e))?;

        Ok(TaskHandle { name, join, state })
    }
}

/// Handle to a started [`BackgroundTask`]
pub struct TaskHandle<T> {
    name: String,
    join: thread::JoinHandle<Result<T>>,
    state: Arc<Mutex<TaskState>>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        read_state(&self.state)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task and return its result
    pub fn join(self) -> Result<T> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(VaultError::integrity(format!(
                "background task '{}' panicked",
                self.name
            ))),
        }
    }
}

fn read_state(state: &Mutex<TaskState>) -> TaskState {
    match state.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_state(state: &Mutex<TaskState>, next: TaskState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

/// Sink wrapper that mirrors percentages into the task state
struct StateMirror {
    inner: Arc<dyn ProgressSink>,
    state: Arc<Mutex<TaskState>>,
}

impl ProgressSink for StateMirror {
    fn report(&self, percent: u8) {
        write_state(&self.state, TaskState::Running(percent));
        self.inner.report(percent);
    }
}

fn execute<T>(
    name: &str,
    work: Work<T>,
    sink: Arc<dyn ProgressSink>,
    state: &Arc<Mutex<TaskState>>,
) -> Result<T> {
    write_state(state, TaskState::Running(0));
    debug!(task = name, "background task started");

    let mirror: Arc<dyn ProgressSink> = Arc::new(StateMirror {
        inner: sink,
        state: Arc::clone(state),
    });

    let result = work(mirror);
    match &result {
        Ok(_) => {
            write_state(state, TaskState::Completed);
            debug!(task = name, "background task completed");
        }
        Err(e) => {
            write_state(state, TaskState::Failed(e.to_string()));
            debug!(task = name, error = %e, "background task failed");
        }
    }
    result
}
