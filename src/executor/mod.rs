//! Local Task Execution Engine
//!
//! Everything one member needs to run tasks, independent of the cluster:
//!
//! ## Architecture Overview
//! 1. **Accept**: a task enters through [`LocalExecutorService::execute`], which refuses
//!    work once the pool is shut down and ignores ids that are already resident.
//! 2. **Queue**: the [`GroupedQueue`] keeps one FIFO per group and serves the groups
//!    round-robin, so a burst in one group cannot starve another.
//! 3. **Execution**: a fixed [`WorkerPool`] pulls tasks, runs the registered handler
//!    named by the task body and records the result or error on the task.
//! 4. **Hooks**: the [`ListenerChain`] runs before and after every body. Completion
//!    bookkeeping (ledger removal, outcome delivery) lives there.
//!
//! ## Submodules
//! - **`types`**: Task, identities and the serialisable task body.
//! - **`registry`**: Maps handler names (e.g., "resize_image") to async Rust code.
//! - **`queue`**: The grouped fair queue with proportional draining for steals.
//! - **`pool`**: Worker lifecycle, run states and in-flight tracking.
//! - **`listener`**: Execution hooks and the outcome broadcast.
//! - **`local`**: The member-side service tying the above together.
//!
//! [`LocalExecutorService::execute`]: local::LocalExecutorService::execute
//! [`GroupedQueue`]: queue::GroupedQueue
//! [`WorkerPool`]: pool::WorkerPool
//! [`ListenerChain`]: listener::ListenerChain

pub mod listener;
pub mod local;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod types;

#[cfg(test)]
mod tests;
