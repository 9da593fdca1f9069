use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use task_fabric::cluster::http::{HttpInvoker, handle_member_call};
use task_fabric::cluster::protocol::ENDPOINT_MEMBER_CALL;
use task_fabric::cluster::{CallHandler, ClusterServices};
use task_fabric::config::{FabricConfig, NodeConfig};
use task_fabric::executor::registry::TaskHandlerRegistry;
use task_fabric::executor::types::{Task, TaskId};
use task_fabric::fabric::handlers::{handle_cluster_shutdown, handle_stats, handle_submit_task};
use task_fabric::fabric::protocol::{ENDPOINT_CLUSTER_SHUTDOWN, ENDPOINT_STATS, ENDPOINT_SUBMIT};
use task_fabric::fabric::service::DistributedExecutor;
use task_fabric::membership::service::{GossipTimings, MembershipService};
use task_fabric::storage::handlers::*;
use task_fabric::storage::lock::PartitionedLock;
use task_fabric::storage::memory::ReplicatedMap;
use task_fabric::storage::partitioner::PartitionManager;
use task_fabric::storage::protocol::*;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const LEDGER_BASE: &str = "/ledger";

#[derive(Parser, Debug)]
#[command(name = "task-fabric", about = "Distributed task execution node")]
struct Args {
    /// Gossip (UDP) bind address.
    #[arg(long)]
    bind: SocketAddr,

    /// HTTP bind address. Defaults to the gossip port + 1000.
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Gossip address of an existing member. Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, default_value_t = 30)]
    rebalance_interval_secs: u64,

    #[arg(long)]
    no_rebalance: bool,
}

impl Args {
    fn into_node_config(self) -> anyhow::Result<NodeConfig> {
        let http_addr = match self.http {
            Some(addr) => addr,
            None => NodeConfig::default_http_addr(self.bind)?,
        };

        let mut fabric = FabricConfig {
            rebalance_interval: Duration::from_secs(self.rebalance_interval_secs),
            rebalance_enabled: !self.no_rebalance,
            ..Default::default()
        };
        if let Some(workers) = self.workers {
            fabric = fabric.with_workers(workers);
        }

        let mut node = NodeConfig::new(self.bind, http_addr);
        node.seeds = self.seeds;
        node.fabric = fabric;
        Ok(node)
    }
}

fn demo_registry() -> Arc<TaskHandlerRegistry> {
    let registry = TaskHandlerRegistry::new();

    registry.register("log", |task: Task, _cancel| async move {
        tracing::info!("Task {} in group {}: {}", task.id, task.group, task.body.payload);
        Ok(None)
    });

    registry.register("echo", |task: Task, _cancel| async move {
        Ok(Some(task.body.payload.clone()))
    });

    registry.register("sleep", |task: Task, cancel: CancellationToken| async move {
        let ms = task.body.payload["ms"].as_u64().unwrap_or(1000);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(None),
            _ = cancel.cancelled() => Err(anyhow::anyhow!("interrupted after shutdown")),
        }
    });

    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let node = Args::parse().into_node_config()?;
    node.fabric.validate()?;

    // 1. Bind HTTP first so gossip announces a reachable address:
    let listener = tokio::net::TcpListener::bind(node.http_addr).await?;
    let http_addr = listener.local_addr()?;

    let mut seed_addrs = Vec::new();
    for seed in &node.seeds {
        seed_addrs.extend(tokio::net::lookup_host(seed.as_str()).await?);
    }

    let membership =
        MembershipService::new(node.gossip_addr, http_addr, seed_addrs, GossipTimings::default())
            .await?;
    tracing::info!(
        "Node {} gossip={} http={}",
        membership.local_member.id,
        membership.local_member.gossip_addr,
        http_addr
    );

    // 2. Coordination substrate:
    let partitioner = Arc::new(PartitionManager::new(membership.clone()));
    let ledger = Arc::new(ReplicatedMap::<TaskId, Task>::new_with_base(
        membership.clone(),
        partitioner.clone(),
        LEDGER_BASE,
    ));
    let lock = Arc::new(PartitionedLock::new(
        membership.clone(),
        partitioner.clone(),
        node.fabric.lock_lease,
    ));
    let services = ClusterServices {
        membership: membership.clone(),
        invoker: Arc::new(HttpInvoker::new(membership.clone())),
        lock: lock.clone(),
        pending_work: ledger.clone(),
    };

    // 3. Executor:
    let registry = demo_registry();
    tracing::info!("Task handlers: {}", registry.list_handlers().join(", "));
    let executor = DistributedExecutor::new(node.fabric.clone(), services, registry)?;
    let call_handler: Arc<dyn CallHandler> = executor.clone();

    // 4. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_SUBMIT, post(handle_submit_task))
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_CLUSTER_SHUTDOWN, post(handle_cluster_shutdown))
        .route(ENDPOINT_MEMBER_CALL, post(handle_member_call))
        .route(
            &format!("{}{}", LEDGER_BASE, ENDPOINT_APPLY),
            post(handle_apply::<TaskId, Task>),
        )
        .route(
            &format!("{}{}", LEDGER_BASE, ENDPOINT_REPLICATE),
            post(handle_replicate::<TaskId, Task>),
        )
        .route(
            &format!("{}{}/:key", LEDGER_BASE, ENDPOINT_GET_INTERNAL),
            get(handle_get_internal::<TaskId, Task>),
        )
        .route(
            &format!("{}{}/:key", LEDGER_BASE, ENDPOINT_GET),
            get(handle_get::<TaskId, Task>),
        )
        .route(ENDPOINT_LOCK_ACQUIRE, post(handle_lock_acquire))
        .route(ENDPOINT_LOCK_RELEASE, post(handle_lock_release))
        .layer(Extension(executor.clone()))
        .layer(Extension(call_handler))
        .layer(Extension(ledger.clone()))
        .layer(Extension(lock));

    let server_stop = CancellationToken::new();
    let server = {
        let stop = server_stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        })
    };
    tracing::info!("HTTP server listening on {}", http_addr);

    // 5. Membership and execution:
    membership.start();
    executor.start();

    // 6. Ledger handoff and stats reporter:
    let background = CancellationToken::new();
    {
        let ledger = ledger.clone();
        let stop = background.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match ledger.handoff().await {
                    Ok(0) => {}
                    Ok(moved) => tracing::info!("Handed off {} ledger entries", moved),
                    Err(e) => tracing::warn!("Ledger handoff failed: {}", e),
                }
            }
        });
    }
    {
        let executor = executor.clone();
        let membership = membership.clone();
        let stop = background.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let stats = executor.stats();
                tracing::info!(
                    "Cluster stats: {} alive nodes, queue={} completed={} state={:?}",
                    membership.get_alive_members().len(),
                    stats.queue_size,
                    stats.completed_tasks,
                    stats.run_state
                );
            }
        });
    }

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested, draining local work");
            executor.shutdown();
        }
        _ = executor.await_termination(Duration::MAX) => {
            tracing::info!("Executor terminated by a cluster shutdown");
        }
    }

    // 7. Drain, leave, stop serving:
    if !executor.await_termination(Duration::from_secs(60)).await {
        let undone = executor.shutdown_now();
        tracing::warn!("Drain timed out, {} tasks left to recovery", undone.len());
    }
    background.cancel();
    membership.leave().await;
    server_stop.cancel();
    server.await??;

    Ok(())
}
