//! Executor Module Tests
//!
//! This module contains unit tests for the local execution engine.
//!
//! ## Test Scopes
//! - **Registry**: Verifies handler registration, lookup, and execution mechanics.
//! - **Queue**: Group fairness, FIFO order, proportional draining, age tracking.
//! - **Pool**: Graceful and forced shutdown, failure isolation, listeners.
//! - **Local Service**: Accept path, duplicates, steals and member calls.

#[cfg(test)]
mod tests {
    use crate::cluster::{CallHandler, MemberCall, MemberReply, ShutdownMode};
    use crate::executor::listener::{ExecutorListener, ListenerChain, OutcomeListener};
    use crate::executor::local::LocalExecutorService;
    use crate::executor::pool::{RunState, WorkerPool, WorkerStatus};
    use crate::executor::queue::GroupedQueue;
    use crate::executor::registry::TaskHandlerRegistry;
    use crate::executor::types::{GroupKey, Task, TaskBody, TaskId};

    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn task(group: &str, handler: &str) -> Task {
        Task::new(
            TaskId::new(),
            GroupKey::from(group),
            TaskBody::new(handler, serde_json::json!({})),
        )
    }

    fn task_created_at(group: &str, created_at: u64) -> Task {
        let mut task = task(group, "noop");
        task.created_at = created_at;
        task
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Registry with the handlers the pool tests rely on.
    fn test_registry() -> Arc<TaskHandlerRegistry> {
        let registry = TaskHandlerRegistry::new();
        registry.register("noop", |_task, _cancel| async { Ok(None) });
        registry.register("echo", |task, _cancel| async move {
            Ok(Some(task.body.payload.clone()))
        });
        registry.register("fail", |_task, _cancel| async {
            Err(anyhow::anyhow!("Intentional error"))
        });
        registry.register("panic", |task: Task, _cancel| async move {
            if task.submission_count > 0 {
                panic!("handler blew up");
            }
            Ok(None)
        });
        registry.register("sleep", |_task, _cancel| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(None)
        });
        registry.register("block", |_task, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(anyhow::anyhow!("cancelled"))
        });
        registry
    }

    fn test_pool(workers: usize) -> (Arc<GroupedQueue>, Arc<ListenerChain>, Arc<WorkerPool>) {
        let queue = Arc::new(GroupedQueue::new());
        let listeners = Arc::new(ListenerChain::new());
        let pool = WorkerPool::new(queue.clone(), test_registry(), listeners.clone(), workers);
        (queue, listeners, pool)
    }

    // ============================================================
    // TEST 1: TaskHandlerRegistry
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        // ARRANGE
        let registry = TaskHandlerRegistry::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        // ACT
        registry.register("count", move |_task, _cancel| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(Some(serde_json::json!(42)))
            }
        });

        // ASSERT
        assert_eq!(registry.list_handlers(), vec!["count".to_string()]);

        let result = registry
            .execute(&task("g", "count"), CancellationToken::new())
            .await;
        assert_eq!(result.unwrap(), Some(serde_json::json!(42)));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_unknown_handler_returns_error() {
        let registry = TaskHandlerRegistry::new();

        let result = registry
            .execute(&task("g", "missing"), CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unknown task handler"));
    }

    #[test]
    fn test_registry_list_handlers() {
        let registry = test_registry();
        let mut names = registry.list_handlers();
        names.sort();
        assert_eq!(names, vec!["block", "echo", "fail", "noop", "panic", "sleep"]);
    }

    // ============================================================
    // TEST 2: Task bookkeeping
    // ============================================================

    #[test]
    fn test_task_resubmission_counts() {
        let mut t = task_created_at("g", 1);
        assert_eq!(t.submission_count, 1);

        t.mark_stolen();
        assert_eq!(t.submission_count, 2);
        assert_eq!(t.created_at, 1, "a steal keeps the creation time");

        t.mark_resubmitted();
        assert_eq!(t.submission_count, 3);
        assert!(t.created_at > 1, "a resubmission refreshes the creation time");
    }

    #[test]
    fn test_task_serialization() {
        let t = task("images", "echo");
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, t.id);
        assert_eq!(back.group, t.group);
        assert_eq!(back.body, t.body);
        assert!(back.result.is_none());
    }

    // ============================================================
    // TEST 3: GroupedQueue
    // ============================================================

    #[test]
    fn test_queue_small_group_not_starved() {
        // ARRANGE: group A bursts 100 tasks, B submits one after A's first
        let queue = GroupedQueue::new();
        queue.add(task("A", "noop"));
        let b = task("B", "noop");
        let b_id = b.id.clone();
        queue.add(b);
        for _ in 0..99 {
            queue.add(task("A", "noop"));
        }

        // ACT
        let first = queue.poll().unwrap();
        let second = queue.poll().unwrap();

        // ASSERT: B is served within the first round
        assert_eq!(first.group, GroupKey::from("A"));
        assert_eq!(second.id, b_id);
        assert_eq!(queue.size(), 99);
    }

    #[test]
    fn test_queue_group_added_after_burst_served_next_round() {
        let queue = GroupedQueue::new();
        for _ in 0..100 {
            queue.add(task("A", "noop"));
        }
        queue.add(task("B", "noop"));

        let served: Vec<GroupKey> = (0..2).map(|_| queue.poll().unwrap().group).collect();
        assert!(served.contains(&GroupKey::from("B")));
    }

    #[test]
    fn test_queue_fifo_within_group() {
        let queue = GroupedQueue::new();
        let tasks: Vec<Task> = (0..3).map(|_| task("g", "noop")).collect();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        for t in tasks {
            queue.add(t);
        }
        // Interleave another group; it must not reorder "g".
        queue.add(task("other", "noop"));

        let served: Vec<TaskId> = std::iter::from_fn(|| queue.poll())
            .filter(|t| t.group == GroupKey::from("g"))
            .map(|t| t.id)
            .collect();

        assert_eq!(served, ids);
    }

    #[test]
    fn test_queue_empty_groups_kept_and_skipped() {
        let queue = GroupedQueue::new();
        queue.add(task("a", "noop"));
        queue.add(task("b", "noop"));
        queue.poll();
        queue.poll();
        queue.add(task("b", "noop"));

        assert_eq!(queue.groups().len(), 2);
        assert_eq!(queue.size_by_group()[&GroupKey::from("a")], 0);
        assert_eq!(queue.poll().unwrap().group, GroupKey::from("b"));
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_queue_drain_proportional() {
        // ARRANGE: {g1: 30, g2: 10}
        let queue = GroupedQueue::new();
        for _ in 0..30 {
            queue.add(task("g1", "noop"));
        }
        for _ in 0..10 {
            queue.add(task("g2", "noop"));
        }

        // ACT
        let drained = queue.drain_proportional(20);

        // ASSERT: round(20*30/40) = 15 and round(20*10/40) = 5
        let from_g1 = drained.iter().filter(|t| t.group == GroupKey::from("g1")).count();
        let from_g2 = drained.iter().filter(|t| t.group == GroupKey::from("g2")).count();
        assert_eq!(from_g1, 15);
        assert_eq!(from_g2, 5);
        assert_eq!(queue.size(), 20);
    }

    #[test]
    fn test_queue_drain_takes_oldest_first() {
        let queue = GroupedQueue::new();
        let first = task("g", "noop");
        let first_id = first.id.clone();
        queue.add(first);
        queue.add(task("g", "noop"));

        let drained = queue.drain_proportional(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, first_id);
    }

    #[test]
    fn test_queue_drain_never_exceeds_request() {
        let queue = GroupedQueue::new();
        for group in ["a", "b", "c"] {
            queue.add(task(group, "noop"));
        }

        // Each group rounds 2/3 up to 1, which would total 3.
        let drained = queue.drain_proportional(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_queue_oldest_creation_time() {
        let queue = GroupedQueue::new();
        assert_eq!(queue.oldest_creation_time(), None);

        queue.add(task_created_at("a", 300));
        queue.add(task_created_at("b", 100));
        queue.add(task_created_at("a", 200));
        assert_eq!(queue.oldest_creation_time(), Some(100));

        // Serve "a" (300), then "b" (100).
        queue.poll();
        queue.poll();
        assert_eq!(queue.oldest_creation_time(), Some(200));

        queue.poll();
        assert_eq!(queue.oldest_creation_time(), None);
    }

    #[test]
    fn test_queue_closed_refuses_but_serves_resident() {
        let queue = GroupedQueue::new();
        queue.add(task("g", "noop"));
        queue.close();

        assert!(!queue.add(task("g", "noop")));
        assert!(queue.is_closed());
        assert!(queue.poll().is_some());
    }

    #[tokio::test]
    async fn test_queue_take_waits_for_work() {
        let queue = Arc::new(GroupedQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.take(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let t = task("g", "noop");
        let id = t.id.clone();
        queue.add(t);

        let taken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.map(|t| t.id), Some(id));
    }

    #[tokio::test]
    async fn test_queue_take_returns_none_when_cancelled() {
        let queue = GroupedQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(queue.take(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_queue_wait_available_wakes_on_add() {
        let queue = Arc::new(GroupedQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_available().await;
                queue.poll()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let t = task("g", "noop");
        let id = t.id.clone();
        queue.add(t);

        let taken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.map(|t| t.id), Some(id));
    }

    #[tokio::test]
    async fn test_queue_wait_available_returns_at_once_when_not_empty() {
        let queue = GroupedQueue::new();
        queue.add(task("g", "noop"));

        tokio::time::timeout(Duration::from_millis(100), queue.wait_available())
            .await
            .unwrap();
    }

    // ============================================================
    // TEST 4: WorkerPool lifecycle
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_graceful_shutdown_terminates_when_idle() {
        let (_queue, _listeners, pool) = test_pool(3);
        pool.start();
        wait_until(|| pool.workers().len() == 3).await;

        pool.shutdown();

        assert!(pool.await_termination(Duration::from_secs(5)).await);
        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .unwrap();
        assert_eq!(pool.run_state(), RunState::Terminated);
        assert!(pool
            .workers()
            .iter()
            .all(|w| w.status == WorkerStatus::Exited));
    }

    #[tokio::test]
    async fn test_pool_shutdown_before_start_terminates() {
        let (_queue, _listeners, pool) = test_pool(2);
        pool.shutdown();
        assert!(pool.is_terminated());

        // Starting a shut-down pool does nothing.
        pool.start();
        assert!(pool.workers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_shutdown_before_start_keeps_queued_work() {
        // ARRANGE: work accepted before the workers exist
        let (queue, _listeners, pool) = test_pool(2);
        queue.add(task("g", "noop"));
        queue.add(task("g", "noop"));

        // ACT
        pool.shutdown();

        // ASSERT: not terminated while tasks are queued
        assert_eq!(pool.run_state(), RunState::ShuttingDown);
        assert_eq!(queue.size(), 2);

        // Starting now drains the queue, then terminates.
        pool.start();
        assert!(pool.await_termination(Duration::from_secs(5)).await);
        assert_eq!(pool.completed_task_count(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pool_shutdown_now_before_start_returns_queued_work() {
        let (queue, _listeners, pool) = test_pool(1);
        queue.add(task("g", "noop"));
        pool.shutdown();

        let undone = pool.shutdown_now();

        assert_eq!(undone.len(), 1);
        assert!(pool.is_terminated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_graceful_shutdown_drains_queue() {
        let (queue, _listeners, pool) = test_pool(1);
        for _ in 0..10 {
            queue.add(task("g", "sleep"));
        }
        pool.start();

        pool.shutdown();

        assert!(pool.await_termination(Duration::from_secs(5)).await);
        assert_eq!(pool.completed_task_count(), 10);
        assert!(queue.is_empty());
        assert!(!queue.add(task("g", "noop")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_shutdown_now_returns_queued_and_in_flight() {
        // ARRANGE: one worker stuck in a body, three tasks behind it
        let (queue, _listeners, pool) = test_pool(1);
        let blocking = task("g", "block");
        let blocking_id = blocking.id.clone();
        queue.add(blocking);
        pool.start();
        wait_until(|| pool.is_in_progress(&blocking_id)).await;
        for _ in 0..3 {
            queue.add(task("g", "noop"));
        }

        // ACT
        let undone = pool.shutdown_now();

        // ASSERT: nothing silently lost
        assert_eq!(undone.len(), 4);
        assert!(undone.iter().any(|t| t.id == blocking_id));
        assert!(queue.is_empty());
        assert!(pool.await_termination(Duration::from_secs(5)).await);

        // Later calls are no-ops.
        assert!(pool.shutdown_now().is_empty());
        pool.shutdown();
        assert_eq!(pool.run_state(), RunState::Terminated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_failure_does_not_kill_worker() {
        let (queue, listeners, pool) = test_pool(1);
        let outcomes = Arc::new(OutcomeListener::new(16));
        let mut rx = outcomes.subscribe();
        listeners.add(outcomes);

        queue.add(task("g", "fail"));
        queue.add(task("g", "panic"));
        queue.add(task("g", "missing"));
        let mut echo = task("g", "echo");
        echo.body.payload = serde_json::json!({"x": 1});
        queue.add(echo);
        pool.start();

        let mut results = Vec::new();
        for _ in 0..4 {
            let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            results.push(outcome);
        }

        assert!(results[0].error.as_deref().unwrap().contains("Intentional error"));
        assert!(results[1].error.as_deref().unwrap().contains("panicked"));
        assert!(results[2].error.as_deref().unwrap().contains("Unknown task handler"));
        assert!(results[3].is_success());
        assert_eq!(results[3].result, Some(serde_json::json!({"x": 1})));
        assert_eq!(pool.completed_task_count(), 4);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).await);
    }

    struct FailingListener;

    #[async_trait]
    impl ExecutorListener for FailingListener {
        async fn before_execute(&self, _task: &Task) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("before failed"))
        }

        async fn after_execute(&self, _task: &Task, _error: Option<&str>) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("after failed"))
        }
    }

    #[derive(Default)]
    struct CountingListener {
        before: AtomicUsize,
        after: AtomicUsize,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ExecutorListener for CountingListener {
        async fn before_execute(&self, _task: &Task) -> anyhow::Result<()> {
            self.before.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn after_execute(&self, _task: &Task, error: Option<&str>) -> anyhow::Result<()> {
            self.after.fetch_add(1, Ordering::SeqCst);
            if error.is_some() {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_listener_failure_isolated() {
        let (queue, listeners, pool) = test_pool(2);
        let counting = Arc::new(CountingListener::default());
        listeners.add(Arc::new(FailingListener));
        listeners.add(counting.clone());
        assert_eq!(listeners.len(), 2);

        queue.add(task("a", "noop"));
        queue.add(task("b", "fail"));
        pool.start();
        pool.shutdown();

        assert!(pool.await_termination(Duration::from_secs(5)).await);
        assert_eq!(counting.before.load(Ordering::SeqCst), 2);
        assert_eq!(counting.after.load(Ordering::SeqCst), 2);
        assert_eq!(counting.failures.load(Ordering::SeqCst), 1);
    }

    // ============================================================
    // TEST 5: LocalExecutorService
    // ============================================================

    #[tokio::test]
    async fn test_local_duplicate_accept_is_ignored() {
        let local = LocalExecutorService::new(test_registry(), 1, 16);
        let t = task("g", "noop");

        assert!(local.execute(t.clone()));
        assert!(local.execute(t));
        assert_eq!(local.queue_size(), 1);
    }

    #[tokio::test]
    async fn test_local_refuses_after_shutdown() {
        let local = LocalExecutorService::new(test_registry(), 1, 16);
        local.shutdown();

        assert!(local.is_shutdown());
        assert!(!local.execute(task("g", "noop")));
        assert_eq!(local.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_local_steal_and_group_sizes() {
        let local = LocalExecutorService::new(test_registry(), 1, 16);
        for _ in 0..30 {
            local.execute(task("g1", "noop"));
        }
        for _ in 0..10 {
            local.execute(task("g2", "noop"));
        }

        let stolen = local.steal_tasks(20);

        assert_eq!(stolen.len(), 20);
        let sizes = local.group_sizes();
        assert_eq!(sizes[&GroupKey::from("g1")], 15);
        assert_eq!(sizes[&GroupKey::from("g2")], 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_oldest_work_time_includes_running() {
        let local = LocalExecutorService::new(test_registry(), 1, 16);
        let mut running = task("g", "block");
        running.created_at = 50;
        let running_id = running.id.clone();
        local.execute(running);
        local.execute(task_created_at("g", 500));
        local.start();

        wait_until(|| local.tasks_in_progress().iter().any(|t| t.id == running_id)).await;

        assert_eq!(local.oldest_queued_time(), Some(500));
        assert_eq!(local.oldest_work_time(), Some(50));

        let undone = local.shutdown_now();
        assert_eq!(undone.len(), 2);
        assert!(local.await_termination(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_local_handles_member_calls() {
        let local = LocalExecutorService::new(test_registry(), 1, 16);

        let reply = local
            .handle(MemberCall::Enqueue {
                task: task_created_at("g", 10),
            })
            .await
            .unwrap();
        assert!(matches!(reply, MemberReply::Accepted { accepted: true }));

        let reply = local.handle(MemberCall::QueueSize).await.unwrap();
        assert!(matches!(reply, MemberReply::QueueSize { size: 1 }));

        let reply = local.handle(MemberCall::OldestWorkTime).await.unwrap();
        assert!(matches!(reply, MemberReply::OldestWorkTime { oldest: Some(10) }));

        let reply = local.handle(MemberCall::Steal { count: 5 }).await.unwrap();
        match reply {
            MemberReply::Tasks { tasks } => assert_eq!(tasks.len(), 1),
            other => panic!("unexpected reply {}", other.kind()),
        }

        let reply = local
            .handle(MemberCall::Shutdown {
                mode: ShutdownMode::Graceful,
            })
            .await
            .unwrap();
        assert!(matches!(reply, MemberReply::ShutdownStarted));

        let reply = local
            .handle(MemberCall::Enqueue {
                task: task("g", "noop"),
            })
            .await
            .unwrap();
        assert!(matches!(reply, MemberReply::Accepted { accepted: false }));
    }
}
