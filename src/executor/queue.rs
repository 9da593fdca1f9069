//! Grouped Fair Queue
//!
//! Holds one FIFO sub-queue per [`GroupKey`] and serves them round-robin, so a
//! group with ten thousand queued tasks gets the same per-round service as a
//! group with one.
//!
//! ## Responsibilities
//! - **Routing**: a cursor walks the group keys; each served task advances it,
//!   empty groups are skipped without consuming a turn.
//! - **Age tracking**: the oldest `created_at` among resident tasks is kept in an
//!   ordered multiset so it is available without traversing the queue.
//! - **Steal support**: proportional draining from the front of every group.

use super::types::*;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct GroupedQueue {
    state: Mutex<QueueState>,
    /// Signalled once per added task; idle workers park on it.
    available: Notify,
}

#[derive(Default)]
struct QueueState {
    groups: HashMap<GroupKey, VecDeque<Task>>,
    /// Every group key ever seen, in first-seen order. Groups are never removed,
    /// a drained group simply stays empty.
    order: Vec<GroupKey>,
    /// Index into `order` of the next group to serve.
    cursor: usize,
    len: usize,
    /// `created_at` -> number of resident tasks with that timestamp.
    created: BTreeMap<u64, usize>,
    resident: HashSet<TaskId>,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, task: Task) {
        if !self.groups.contains_key(&task.group) {
            self.order.push(task.group.clone());
        }
        *self.created.entry(task.created_at).or_insert(0) += 1;
        self.resident.insert(task.id.clone());
        self.len += 1;
        self.groups
            .entry(task.group.clone())
            .or_default()
            .push_back(task);
    }

    fn forget(&mut self, task: &Task) {
        self.len -= 1;
        self.resident.remove(&task.id);
        if let Some(count) = self.created.get_mut(&task.created_at) {
            *count -= 1;
            if *count == 0 {
                self.created.remove(&task.created_at);
            }
        }
    }

    fn pop_group(&mut self, idx: usize) -> Option<Task> {
        let popped = self
            .groups
            .get_mut(&self.order[idx])
            .and_then(VecDeque::pop_front);
        if let Some(task) = &popped {
            self.forget(task);
        }
        popped
    }

    fn group_len(&self, idx: usize) -> usize {
        self.groups.get(&self.order[idx]).map_or(0, VecDeque::len)
    }

    /// Round-robin router: first non-empty group at or after the cursor.
    fn next_task(&mut self) -> Option<Task> {
        let groups = self.order.len();
        if self.len == 0 || groups == 0 {
            return None;
        }

        for offset in 0..groups {
            let idx = (self.cursor + offset) % groups;
            if let Some(task) = self.pop_group(idx) {
                self.cursor = (idx + 1) % groups;
                return Some(task);
            }
        }

        None
    }
}

impl GroupedQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Appends the task to its group's sub-queue, creating the group if needed.
    ///
    /// Returns `false` once the queue has been closed by a pool shutdown.
    pub fn add(&self, task: Task) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.push(task);
        }
        self.available.notify_one();
        true
    }

    /// Removes one task chosen by the router without blocking.
    pub fn poll(&self) -> Option<Task> {
        self.state.lock().next_task()
    }

    /// Blocks until a task is available or `cancel` fires.
    ///
    /// Consumer API for callers outside the worker pool. Pool workers claim
    /// through [`poll`](Self::poll) under the pool lock and park on
    /// [`wait_available`](Self::wait_available), so a forced shutdown always
    /// sees a claimed task as in flight.
    pub async fn take(&self, cancel: &CancellationToken) -> Option<Task> {
        loop {
            if let Some(task) = self.poll() {
                return Some(task);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.wait_available() => {}
            }
        }
    }

    /// Resolves when the queue may hold a task. Spurious wake-ups are possible,
    /// callers must poll again.
    pub async fn wait_available(&self) {
        if !self.is_empty() {
            return;
        }
        // notify_one stores a permit when nobody waits yet, so an add racing
        // with the emptiness check above is not lost.
        self.available.notified().await;
    }

    pub fn size(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sizes of every known group, including drained ones.
    pub fn size_by_group(&self) -> HashMap<GroupKey, usize> {
        let state = self.state.lock();
        state
            .groups
            .iter()
            .map(|(group, queue)| (group.clone(), queue.len()))
            .collect()
    }

    pub fn groups(&self) -> Vec<GroupKey> {
        self.state.lock().order.clone()
    }

    /// Minimum `created_at` across resident tasks.
    pub fn oldest_creation_time(&self) -> Option<u64> {
        self.state.lock().created.keys().next().copied()
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.state.lock().resident.contains(task_id)
    }

    /// Removes up to `requested` tasks, taking from each non-empty group a share
    /// proportional to its size (rounded to the nearest integer), oldest first.
    ///
    /// May return fewer tasks than requested; never more.
    pub fn drain_proportional(&self, requested: usize) -> Vec<Task> {
        let mut state = self.state.lock();
        if requested == 0 || state.len == 0 {
            return Vec::new();
        }

        let total = state.len as f64;
        let shares: Vec<(usize, usize)> = (0..state.order.len())
            .filter_map(|idx| {
                let size = state.group_len(idx);
                if size == 0 {
                    return None;
                }
                let share = (requested as f64 * (size as f64 / total)).round() as usize;
                Some((idx, share.min(size)))
            })
            .collect();

        let mut drained = Vec::with_capacity(requested.min(state.len));
        'groups: for (idx, share) in shares {
            for _ in 0..share {
                if drained.len() >= requested {
                    break 'groups;
                }
                match state.pop_group(idx) {
                    Some(task) => drained.push(task),
                    None => break,
                }
            }
        }

        drained
    }

    /// Removes every resident task, in routing order.
    pub fn drain_all(&self) -> Vec<Task> {
        let mut state = self.state.lock();
        let mut drained = Vec::with_capacity(state.len);
        while let Some(task) = state.next_task() {
            drained.push(task);
        }
        drained
    }

    /// Stops accepting new tasks. Resident tasks stay available to `poll`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        // Wake every parked waiter so it can observe the pool state.
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for GroupedQueue {
    fn default() -> Self {
        Self::new()
    }
}
