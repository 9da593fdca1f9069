use super::partitioner::{PartitionManager, owners_among};
use super::protocol::*;
use crate::cluster::backoff::send_with_retry;
use crate::cluster::{ClusterMap, Membership};
use crate::executor::types::now_ms;
use crate::membership::{service::MembershipService, types::MemberId};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const INTERNAL_CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// A mutation of one key.
#[derive(Debug, Clone)]
pub enum Mutation<V> {
    Put(V),
    PutIfAbsent(V),
    Remove,
}

struct Applied<V> {
    previous: Option<V>,
    /// New state of the key to push to the backup; `None` when nothing changed.
    replicate: Option<Option<V>>,
}

/// Partitioned map with one primary and one backup copy per partition.
///
/// Every mutation is executed by the partition's primary, which makes
/// `PutIfAbsent` atomic cluster-wide, and then pushed to the backup.
pub struct ReplicatedMap<K, V> {
    local_data: Arc<DashMap<u32, DashMap<K, V>>>,
    processed_ops: Arc<DashMap<String, u64>>,
    /// Primary each held partition was last handed to.
    synced_primary: DashMap<u32, MemberId>,
    membership: Arc<MembershipService>,
    partitioner: Arc<PartitionManager>,
    http_client: reqwest::Client,
    base_path: String,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new_with_base(
        membership: Arc<MembershipService>,
        partitioner: Arc<PartitionManager>,
        base_path: &str,
    ) -> Self {
        let cleaned = base_path.trim_end_matches('/');
        let base_path = if cleaned.is_empty() {
            String::new()
        } else if cleaned.starts_with('/') {
            cleaned.to_string()
        } else {
            format!("/{}", cleaned)
        };

        Self {
            local_data: Arc::new(DashMap::new()),
            processed_ops: Arc::new(DashMap::new()),
            synced_primary: DashMap::new(),
            membership,
            partitioner,
            http_client: reqwest::Client::new(),
            base_path,
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn should_process(&self, op_id: &str) -> bool {
        if self.processed_ops.contains_key(op_id) {
            return false;
        }
        if self.processed_ops.len() > 10_000 {
            self.processed_ops.clear();
        }
        self.processed_ops.insert(op_id.to_string(), now_ms());
        true
    }

    fn member_url(&self, member_id: &MemberId, endpoint: &str) -> Result<String> {
        let member = self
            .membership
            .get_member(member_id)
            .ok_or_else(|| anyhow::anyhow!("Member not found: {}", member_id))?;
        Ok(format!(
            "http://{}{}{}",
            member.http_addr, self.base_path, endpoint
        ))
    }

    /// Applies a mutation to the local copy of `partition`.
    fn apply_local(&self, partition: u32, key: K, mutation: Mutation<V>) -> Applied<V> {
        let partition_map = self.local_data.entry(partition).or_default();

        match mutation {
            Mutation::Put(value) => Applied {
                previous: partition_map.insert(key, value.clone()),
                replicate: Some(Some(value)),
            },
            Mutation::PutIfAbsent(value) => match partition_map.entry(key) {
                Entry::Occupied(existing) => Applied {
                    previous: Some(existing.get().clone()),
                    replicate: None,
                },
                Entry::Vacant(vacant) => {
                    vacant.insert(value.clone());
                    Applied {
                        previous: None,
                        replicate: Some(Some(value)),
                    }
                }
            },
            // Removal is always replicated, the backup may hold a stale copy.
            Mutation::Remove => Applied {
                previous: partition_map.remove(&key).map(|(_, value)| value),
                replicate: Some(None),
            },
        }
    }

    /// Executes a mutation as the primary of `partition` and replicates it.
    pub async fn apply_as_primary(
        &self,
        partition: u32,
        op_id: String,
        key: K,
        mutation: Mutation<V>,
    ) -> Result<Option<V>> {
        if !self.should_process(&op_id) {
            return Ok(None);
        }

        let applied = self.apply_local(partition, key.clone(), mutation);

        if let Some(state) = applied.replicate {
            let owners = self.partitioner.get_owners(partition);
            for backup in owners.iter().skip(1) {
                // The primary copy is authoritative; a lost replica is repaired
                // by the next handoff after a membership change.
                if let Err(e) = self
                    .replicate_to_backup(backup, partition, op_id.clone(), &key, state.clone())
                    .await
                {
                    tracing::warn!("Replication of partition {} to {} failed: {}", partition, backup, e);
                }
            }
        }

        Ok(applied.previous)
    }

    async fn replicate_to_backup(
        &self,
        backup_id: &MemberId,
        partition: u32,
        op_id: String,
        key: &K,
        state: Option<V>,
    ) -> Result<()> {
        let value_json = state.map(|value| serde_json::to_string(&value)).transpose()?;
        let payload = ReplicateRequest {
            partition,
            op_id,
            key: key.to_string(),
            value_json,
        };
        let url = self.member_url(backup_id, ENDPOINT_REPLICATE)?;
        let response = send_with_retry(3, || {
            self.http_client
                .post(url.clone())
                .json(&payload)
                .timeout(INTERNAL_CALL_TIMEOUT)
        })
        .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Replication failed: {}", response.status()));
        }
        Ok(())
    }

    async fn forward_apply(
        &self,
        primary_id: &MemberId,
        partition: u32,
        op_id: String,
        key: K,
        mutation: Mutation<V>,
    ) -> Result<Option<V>> {
        let op = match mutation {
            Mutation::Put(value) => MapOp::Put {
                value_json: serde_json::to_string(&value)?,
            },
            Mutation::PutIfAbsent(value) => MapOp::PutIfAbsent {
                value_json: serde_json::to_string(&value)?,
            },
            Mutation::Remove => MapOp::Remove,
        };
        let payload = ApplyRequest {
            partition,
            op_id,
            key: key.to_string(),
            op,
        };

        let url = self.member_url(primary_id, ENDPOINT_APPLY)?;
        let response = send_with_retry(3, || {
            self.http_client
                .post(url.clone())
                .json(&payload)
                .timeout(INTERNAL_CALL_TIMEOUT)
        })
        .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Forwarded apply failed {}", response.status()));
        }

        let reply: ApplyResponse = response.json().await?;
        if !reply.success {
            return Err(anyhow::anyhow!("Primary {} rejected the mutation", primary_id));
        }
        reply
            .previous_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }

    /// Routes a mutation to the primary owner of the key.
    pub async fn apply(&self, key: K, mutation: Mutation<V>) -> Result<Option<V>> {
        let partition = self.partitioner.get_partition(&key.to_string());
        let owners = self.partitioner.get_owners(partition);
        let op_id = Uuid::new_v4().to_string();

        match owners.first() {
            None => {
                tracing::warn!("No alive members, applying locally as fallback");
                Ok(self.apply_local(partition, key, mutation).previous)
            }
            Some(primary) if *primary == self.membership.local_member.id => {
                self.apply_as_primary(partition, op_id, key, mutation).await
            }
            Some(primary) => {
                self.forward_apply(primary, partition, op_id, key, mutation)
                    .await
            }
        }
    }

    /// Receiving side of a forwarded mutation.
    pub async fn apply_request(&self, req: ApplyRequest) -> Result<Option<V>> {
        let key = parse_key::<K>(&req.key)?;
        let mutation = match req.op {
            MapOp::Put { value_json } => Mutation::Put(serde_json::from_str(&value_json)?),
            MapOp::PutIfAbsent { value_json } => {
                Mutation::PutIfAbsent(serde_json::from_str(&value_json)?)
            }
            MapOp::Remove => Mutation::Remove,
        };
        self.apply_as_primary(req.partition, req.op_id, key, mutation)
            .await
    }

    pub fn store_replica(&self, req: ReplicateRequest) -> Result<()> {
        if !self.should_process(&req.op_id) {
            return Ok(());
        }
        let key = parse_key::<K>(&req.key)?;
        match req.value_json {
            Some(json) => {
                let value: V = serde_json::from_str(&json)?;
                self.store_local(req.partition, key, value);
            }
            None => {
                if let Some(partition_map) = self.local_data.get(&req.partition) {
                    partition_map.remove(&key);
                }
            }
        }
        Ok(())
    }

    pub fn store_local(&self, partition: u32, key: K, value: V) {
        self.local_data
            .entry(partition)
            .or_default()
            .insert(key, value);
    }

    pub fn get_local(&self, key: &K) -> Option<V> {
        let partition = self.partitioner.get_partition(&key.to_string());

        if let Some(partition_map) = self.local_data.get(&partition)
            && let Some(value) = partition_map.get(key)
        {
            return Some(value.clone());
        }

        None
    }

    /// Reads from the primary, falling back to the backup.
    pub async fn get_routed(&self, key: &K) -> Result<Option<V>> {
        let partition = self.partitioner.get_partition(&key.to_string());
        let owners = self.partitioner.get_owners(partition);
        let local_id = &self.membership.local_member.id;

        let Some(primary) = owners.first() else {
            return Ok(self.get_local(key));
        };
        if primary == local_id {
            return Ok(self.get_local(key));
        }

        match self.fetch_remote(primary, key).await {
            Ok(value) => return Ok(value),
            Err(e) => tracing::warn!("GET: primary {} unavailable: {}", primary, e),
        }

        for backup in owners.iter().skip(1) {
            if backup == local_id {
                return Ok(self.get_local(key));
            }
            if let Ok(value) = self.fetch_remote(backup, key).await {
                return Ok(value);
            }
        }

        Err(anyhow::anyhow!("No owner of partition {} answered", partition))
    }

    pub async fn fetch_remote(&self, owner_id: &MemberId, key: &K) -> Result<Option<V>> {
        let url = format!(
            "{}/{}",
            self.member_url(owner_id, ENDPOINT_GET_INTERNAL)?,
            key.to_string()
        );

        let response = send_with_retry(3, || {
            self.http_client.get(url.clone()).timeout(INTERNAL_CALL_TIMEOUT)
        })
        .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("GET request failed {}", response.status()));
        }

        let get_response: GetResponse = response.json().await?;
        match get_response.value_json {
            Some(json_str) => Ok(Some(serde_json::from_str(&json_str)?)),
            None => Ok(None),
        }
    }

    pub fn dump_partition(&self, partition: u32) -> Vec<(K, V)> {
        self.local_data
            .get(&partition)
            .map(|partition_map| {
                partition_map
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries of every partition whose current primary is this member.
    pub fn primary_entries(&self) -> Vec<(K, V)> {
        self.partitioner
            .my_primary_partitions()
            .into_iter()
            .flat_map(|partition| self.dump_partition(partition))
            .collect()
    }

    pub fn local_entry_count(&self) -> usize {
        self.local_data
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Pushes held partitions to their primary after the primary changed, and
    /// drops partitions this member no longer owns at all. Returns the number
    /// of entries handed over.
    pub async fn handoff(&self) -> Result<usize> {
        let members = self.membership.reachable_members();
        let local_id = self.membership.local_member.id.clone();
        let held: Vec<u32> = self.local_data.iter().map(|entry| *entry.key()).collect();
        let mut moved = 0;

        for partition in held {
            let owners = owners_among(partition, &members);
            let Some(primary) = owners.first().cloned() else {
                continue;
            };

            let already_synced = self
                .synced_primary
                .get(&partition)
                .is_some_and(|synced| *synced == primary);

            if primary != local_id && !already_synced {
                for (key, value) in self.dump_partition(partition) {
                    let op_id = Uuid::new_v4().to_string();
                    self.forward_apply(&primary, partition, op_id, key, Mutation::PutIfAbsent(value))
                        .await?;
                    moved += 1;
                }
            }
            self.synced_primary.insert(partition, primary);

            if !owners.contains(&local_id) {
                self.local_data.remove(&partition);
                self.synced_primary.remove(&partition);
            }
        }

        if moved > 0 {
            tracing::info!("Handed {} entries of {} to new owners", moved, self.base_path);
        }
        Ok(moved)
    }
}

#[async_trait]
impl<K, V> ClusterMap<K, V> for ReplicatedMap<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        self.get_routed(key).await
    }

    async fn put(&self, key: K, value: V) -> Result<()> {
        self.apply(key, Mutation::Put(value)).await.map(|_| ())
    }

    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.apply(key, Mutation::PutIfAbsent(value)).await
    }

    async fn remove(&self, key: &K) -> Result<Option<V>> {
        self.apply(key.clone(), Mutation::Remove).await
    }

    async fn local_entries(&self) -> Result<Vec<(K, V)>> {
        Ok(self.primary_entries())
    }
}

fn parse_key<K>(raw: &str) -> Result<K>
where
    K: FromStr,
    <K as FromStr>::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: <K as FromStr>::Err| anyhow::anyhow!("Failed to parse key: {}", e))
}
