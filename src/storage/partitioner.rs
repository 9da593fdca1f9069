use crate::cluster::Membership;
use crate::membership::{service::MembershipService, types::MemberId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const DEFAULT_PARTITIONS: u32 = 256;

/// Places partitions on the alive members: primary first, then one backup.
pub struct PartitionManager {
    pub num_partitions: u32,
    membership: Arc<MembershipService>,
}

impl PartitionManager {
    pub fn new(membership: Arc<MembershipService>) -> Self {
        Self {
            num_partitions: DEFAULT_PARTITIONS,
            membership,
        }
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        partition_of(key, self.num_partitions)
    }

    pub fn get_owners(&self, partition: u32) -> Vec<MemberId> {
        owners_among(partition, &self.membership.reachable_members())
    }

    pub fn primary_of(&self, partition: u32) -> Option<MemberId> {
        self.get_owners(partition).into_iter().next()
    }

    pub fn local_member(&self) -> MemberId {
        self.membership.local_member.id.clone()
    }

    pub fn is_local_primary(&self, partition: u32) -> bool {
        self.primary_of(partition)
            .is_some_and(|primary| primary == self.membership.local_member.id)
    }

    pub fn my_primary_partitions(&self) -> Vec<u32> {
        let members = self.membership.reachable_members();
        let my_id = &self.membership.local_member.id;

        (0..self.num_partitions)
            .filter(|&partition| owners_among(partition, &members).first() == Some(my_id))
            .collect()
    }
}

pub fn partition_of(key: &str, num_partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let hash = hasher.finish() as u32;
    hash % num_partitions
}

/// Owners of `partition` given the sorted list of alive members. A single
/// member owns everything without a backup.
pub fn owners_among(partition: u32, members: &[MemberId]) -> Vec<MemberId> {
    if members.is_empty() {
        return vec![];
    }
    let primary_idx = (partition as usize) % members.len();
    let backup_idx = (partition as usize + 1) % members.len();

    let mut owners = vec![members[primary_idx].clone()];
    if backup_idx != primary_idx {
        owners.push(members[backup_idx].clone());
    }
    owners
}
