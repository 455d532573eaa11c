// src/network/task.rs

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Runtime};

use crate::constants::WORKER_GROWTH_FACTOR;
use crate::events::LogLevel;
use crate::network::connection::Connection;
use crate::network::events::emit_task_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Connect,
    Disconnect,
    Data,
    ConnectFailed,
    Other,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Connect => "connect",
            TaskType::Disconnect => "disconnect",
            TaskType::Data => "data",
            TaskType::ConnectFailed => "connect_failed",
            TaskType::Other => "other",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work handed to the worker pool. Immutable once built.
#[derive(Debug, Clone)]
pub struct Task {
    kind: TaskType,
    connection: Arc<Connection>,
    payload: Option<Vec<u8>>,
}

impl Task {
    pub fn new(kind: TaskType, connection: Arc<Connection>, payload: Option<Vec<u8>>) -> Self {
        Self {
            kind,
            connection,
            payload,
        }
    }

    pub fn connect(connection: Arc<Connection>) -> Self {
        Self::new(TaskType::Connect, connection, None)
    }

    pub fn disconnect(connection: Arc<Connection>) -> Self {
        Self::new(TaskType::Disconnect, connection, None)
    }

    pub fn data(connection: Arc<Connection>, payload: Vec<u8>) -> Self {
        Self::new(TaskType::Data, connection, Some(payload))
    }

    pub fn kind(&self) -> TaskType {
        self.kind
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn into_payload(self) -> Option<Vec<u8>> {
        self.payload
    }
}

/// Executable unit produced by a [`HandlerFactory`].
pub trait TaskHandler: Send {
    fn run(self: Box<Self>) -> anyhow::Result<()>;
}

/// Turns tasks into handlers. `create` is called on the dispatching thread in
/// dispatch order; only `run` happens on a worker.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, task: Task) -> Box<dyn TaskHandler>;
}

/// Wrap a closure as a [`HandlerFactory`].
pub fn handler_fn<F>(f: F) -> Arc<dyn HandlerFactory>
where
    F: Fn(Task) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnFactory(Arc::new(f)))
}

struct FnFactory<F>(Arc<F>);

struct FnHandler<F> {
    f: Arc<F>,
    task: Task,
}

impl<F> HandlerFactory for FnFactory<F>
where
    F: Fn(Task) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn create(&self, task: Task) -> Box<dyn TaskHandler> {
        Box::new(FnHandler {
            f: self.0.clone(),
            task,
        })
    }
}

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn run(self: Box<Self>) -> anyhow::Result<()> {
        (self.f)(self.task)
    }
}

thread_local! {
    static IN_POOL: Cell<bool> = const { Cell::new(false) };
}

/// Grace period `shutdown` grants jobs that are still queued or running.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Growable thread pool backed by a dedicated tokio runtime's blocking pool.
///
/// Jobs queue without bound; threads are started on demand up to
/// `max_threads` and reaped after `keep_alive` idle time.
pub struct WorkerPool {
    name: String,
    max_threads: usize,
    runtime: Mutex<Option<Runtime>>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("max_threads", &self.max_threads)
            .field("in_flight", &*self.in_flight.0.lock())
            .finish()
    }
}

impl WorkerPool {
    /// Pool for dispatched tasks: `workers` base size, growing to `workers * 5`.
    pub fn new(name: &str, workers: usize, keep_alive: Duration) -> std::io::Result<Self> {
        Self::with_max_threads(name, workers.max(1) * WORKER_GROWTH_FACTOR, keep_alive)
    }

    /// Cached pool with a hard thread cap, used for handshakes.
    pub fn cached(name: &str, max_threads: usize, keep_alive: Duration) -> std::io::Result<Self> {
        Self::with_max_threads(name, max_threads.max(1), keep_alive)
    }

    fn with_max_threads(name: &str, max_threads: usize, keep_alive: Duration) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads)
            .thread_keep_alive(keep_alive)
            .thread_name(name)
            .build()?;
        Ok(Self {
            name: name.to_string(),
            max_threads,
            runtime: Mutex::new(Some(runtime)),
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Queue a job. Returns false once the pool has been shut down.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.runtime.lock();
        let Some(runtime) = guard.as_ref() else {
            return false;
        };
        *self.in_flight.0.lock() += 1;
        let in_flight = self.in_flight.clone();
        runtime.spawn_blocking(move || {
            let _done = InFlightGuard(in_flight);
            IN_POOL.with(|f| f.set(true));
            job();
        });
        true
    }

    /// Build a handler for `task` and run it on the pool. Errors and panics are
    /// logged and go no further.
    pub fn execute(&self, factory: &dyn HandlerFactory, task: Task) {
        let kind = task.kind();
        let peer = task.connection().peer_addr();
        let handler = factory.create(task);
        let accepted = self.spawn(move || {
            match catch_unwind(AssertUnwindSafe(move || handler.run())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => emit_task_event(
                    LogLevel::Warn,
                    "task_failed",
                    kind.as_str(),
                    Some(peer),
                    Some(format!("{:#}", e)),
                ),
                Err(panic) => emit_task_event(
                    LogLevel::Error,
                    "task_panicked",
                    kind.as_str(),
                    Some(peer),
                    panic_message(panic.as_ref()),
                ),
            }
        });
        if !accepted {
            emit_task_event(
                LogLevel::Debug,
                "task_rejected",
                kind.as_str(),
                Some(peer),
                Some(format!("pool {} is shut down", self.name)),
            );
        }
    }

    /// Stop accepting jobs, give queued ones a short grace period, then
    /// release the runtime without blocking on stragglers.
    pub fn shutdown(&self) {
        if !IN_POOL.with(|f| f.get()) {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            let (count, idle) = &*self.in_flight;
            let mut n = count.lock();
            while *n > 0 {
                if idle.wait_until(&mut n, deadline).timed_out() {
                    break;
                }
            }
        }
        self.shutdown_now();
    }

    /// Release the runtime at once; running jobs finish on detached threads
    /// and queued ones are dropped.
    pub fn shutdown_now(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

struct InFlightGuard(Arc<(Mutex<usize>, Condvar)>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let (count, idle) = &*self.0;
        let mut n = count.lock();
        *n = n.saturating_sub(1);
        if *n == 0 {
            idle.notify_all();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> Option<String> {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
}
