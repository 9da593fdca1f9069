//! Worker Pool Implementation
//!
//! A fixed set of long-lived tokio workers draining a [`GroupedQueue`].
//! Unlike a generic executor, the pool knows which task every worker is
//! running, which is what lets a member report in-flight work (for lost-task
//! detection) and hand it back on a forced shutdown.
//!
//! ## Lifecycle
//! `Running -> ShuttingDown -> Terminated` (graceful: stop accepting, drain the
//! queue, wake only idle workers) or `Running|ShuttingDown -> Stopping ->
//! Terminated` (forced: wake and cancel everyone, return undone work).
//! Transitions only move forward.

use super::listener::ListenerChain;
use super::queue::GroupedQueue;
use super::registry::TaskHandlerRegistry;
use super::types::*;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pool-wide run state. Ordered: a pool never moves to a smaller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunState {
    Running,
    ShuttingDown,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Parked waiting for work; safe to interrupt.
    Idle,
    /// Between claiming a task and finishing its bookkeeping.
    Busy,
    Exited,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub completed: u64,
}

struct WorkerSlot {
    status: WorkerStatus,
    current: Option<Task>,
    completed: u64,
    /// Interrupts the worker while it waits for work.
    wake: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct PoolState {
    run_state: RunState,
    started: bool,
    workers: Vec<WorkerSlot>,
}

enum Claim {
    Task(Task),
    Wait,
    Exit,
}

pub struct WorkerPool {
    queue: Arc<GroupedQueue>,
    registry: Arc<TaskHandlerRegistry>,
    listeners: Arc<ListenerChain>,
    worker_count: usize,
    /// Guards the run state and every worker slot.
    state: Mutex<PoolState>,
    state_tx: watch::Sender<RunState>,
    /// Handed to task bodies; fired only by a forced shutdown.
    abort: CancellationToken,
    completed: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<GroupedQueue>,
        registry: Arc<TaskHandlerRegistry>,
        listeners: Arc<ListenerChain>,
        worker_count: usize,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(RunState::Running);
        Arc::new(Self {
            queue,
            registry,
            listeners,
            worker_count,
            state: Mutex::new(PoolState {
                run_state: RunState::Running,
                started: false,
                workers: Vec::with_capacity(worker_count),
            }),
            state_tx,
            abort: CancellationToken::new(),
            completed: AtomicU64::new(0),
        })
    }

    /// Spawns the workers. Calling it twice, or once the pool is stopping,
    /// does nothing. A pool shut down gracefully before it started still
    /// spawns workers so the queued tasks are drained.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.started || state.run_state >= RunState::Stopping {
            return;
        }
        state.started = true;

        tracing::info!("Starting {} task workers", self.worker_count);

        for index in 0..self.worker_count {
            let wake = CancellationToken::new();
            let pool = self.clone();
            let worker_wake = wake.clone();
            let handle = tokio::spawn(async move {
                pool.worker_loop(index, worker_wake).await;
            });

            state.workers.push(WorkerSlot {
                status: WorkerStatus::Idle,
                current: None,
                completed: 0,
                wake,
                handle: Some(handle),
            });
        }
    }

    /// The main loop for a single worker.
    ///
    /// 1. Claims the next task (under the pool lock, so shutdown sees it).
    /// 2. Runs it with the listener chain around the body.
    /// 3. Parks when the queue is empty, until new work or an interrupt.
    async fn worker_loop(self: Arc<Self>, index: usize, wake: CancellationToken) {
        tracing::debug!("Worker {} started", index);

        loop {
            match self.claim(index) {
                Claim::Task(task) => self.run_task(index, task).await,
                Claim::Exit => break,
                Claim::Wait => {
                    tokio::select! {
                        _ = wake.cancelled() => {}
                        _ = self.queue.wait_available() => {}
                    }
                }
            }
        }

        tracing::debug!("Worker {} exiting", index);
        self.worker_exited(index);
    }

    fn claim(&self, index: usize) -> Claim {
        let mut state = self.state.lock();
        if state.run_state >= RunState::Stopping {
            return Claim::Exit;
        }

        if let Some(task) = self.queue.poll() {
            if let Some(slot) = state.workers.get_mut(index) {
                slot.status = WorkerStatus::Busy;
                slot.current = Some(task.clone());
            }
            return Claim::Task(task);
        }

        match state.run_state {
            RunState::Running => Claim::Wait,
            _ => Claim::Exit,
        }
    }

    async fn run_task(&self, index: usize, mut task: Task) {
        self.listeners.before_execute(&task).await;

        match self.execute_body(&task).await {
            Ok(result) => task.result = result,
            Err(error) => {
                tracing::warn!("Task {} failed: {}", task.id, error);
                task.error = Some(error);
            }
        }

        self.listeners
            .after_execute(&task, task.error.as_deref())
            .await;

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.workers.get_mut(index) {
                slot.current = None;
                slot.status = WorkerStatus::Idle;
                slot.completed += 1;
            }
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs the body on its own tokio task so a panic is contained and
    /// reported like any other execution error.
    async fn execute_body(&self, task: &Task) -> Result<Option<serde_json::Value>, String> {
        let registry = self.registry.clone();
        let owned = task.clone();
        let abort = self.abort.clone();
        let body = tokio::spawn(async move { registry.execute(&owned, abort).await });
        match body.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) if e.is_panic() => Err(format!("Task {} panicked", task.id)),
            Err(e) => Err(format!("Task {} was cancelled: {}", task.id, e)),
        }
    }

    fn worker_exited(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(slot) = state.workers.get_mut(index) {
            slot.status = WorkerStatus::Exited;
            slot.current = None;
        }
        self.try_terminate(&mut state);
    }

    /// Moves to `Terminated` once every worker is gone and, on the graceful
    /// path, the queue is empty. Call only while holding the pool lock.
    fn try_terminate(&self, state: &mut PoolState) {
        let all_exited = state
            .workers
            .iter()
            .all(|slot| slot.status == WorkerStatus::Exited);
        if !all_exited {
            return;
        }

        let ready = match state.run_state {
            RunState::Stopping => true,
            RunState::ShuttingDown => self.queue.is_empty(),
            _ => false,
        };

        if ready {
            state.run_state = RunState::Terminated;
            self.state_tx.send_replace(RunState::Terminated);
            tracing::info!(
                "Worker pool terminated after {} tasks",
                self.completed.load(Ordering::Relaxed)
            );
        }
    }

    /// Graceful shutdown: stop accepting work, let workers drain the queue and
    /// finish what they run, interrupt only the idle ones.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.run_state >= RunState::ShuttingDown {
            return;
        }

        state.run_state = RunState::ShuttingDown;
        self.state_tx.send_replace(RunState::ShuttingDown);
        self.queue.close();

        for slot in state
            .workers
            .iter()
            .filter(|slot| slot.status == WorkerStatus::Idle)
        {
            slot.wake.cancel();
        }

        tracing::info!("Worker pool shutting down");
        self.try_terminate(&mut state);
    }

    /// Forced shutdown: interrupt every worker and return the queued tasks plus
    /// every task still in flight. In-flight bodies observe the cancellation
    /// token and are expected to unwind; they are not killed.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let mut state = self.state.lock();
        if state.run_state >= RunState::Stopping {
            return Vec::new();
        }

        state.run_state = RunState::Stopping;
        self.state_tx.send_replace(RunState::Stopping);
        self.queue.close();
        self.abort.cancel();

        for slot in &state.workers {
            slot.wake.cancel();
        }

        let mut undone = self.queue.drain_all();
        undone.extend(state.workers.iter().filter_map(|slot| slot.current.clone()));

        tracing::info!("Worker pool stopping, {} tasks not done", undone.len());
        self.try_terminate(&mut state);
        undone
    }

    pub fn run_state(&self) -> RunState {
        self.state.lock().run_state
    }

    pub fn is_shutdown(&self) -> bool {
        self.run_state() != RunState::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.run_state() == RunState::Terminated
    }

    /// Waits until the pool reaches `Terminated`. Returns `false` on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == RunState::Terminated))
                .await,
            Ok(Ok(_))
        )
    }

    /// Awaits every worker task spawned by [`start`](Self::start).
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock();
            state
                .workers
                .iter_mut()
                .filter_map(|slot| slot.handle.take())
                .collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task ended abnormally: {}", e);
            }
        }
    }

    /// Best-effort snapshot of what every worker is running. Racy with
    /// completion by nature; good for staleness detection only.
    pub fn tasks_in_progress(&self) -> Vec<Task> {
        self.state
            .lock()
            .workers
            .iter()
            .filter_map(|slot| slot.current.clone())
            .collect()
    }

    pub fn is_in_progress(&self, task_id: &TaskId) -> bool {
        self.state
            .lock()
            .workers
            .iter()
            .any(|slot| slot.current.as_ref().is_some_and(|task| &task.id == task_id))
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.state
            .lock()
            .workers
            .iter()
            .enumerate()
            .map(|(index, slot)| WorkerSnapshot {
                index,
                status: slot.status,
                current_task: slot.current.as_ref().map(|task| task.id.clone()),
                completed: slot.completed,
            })
            .collect()
    }

    pub fn completed_task_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Fires when a forced shutdown begins.
    pub fn abort_signal(&self) -> CancellationToken {
        self.abort.clone()
    }
}
