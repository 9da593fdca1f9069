use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Identity of one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    /// Announced its own departure; never considered reachable again.
    Left,
}

/// Represents a single member in the cluster.
///
/// The `incarnation` field is a logical clock used to order updates and resolve
/// conflicts (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub gossip_addr: SocketAddr,
    /// Address of the member's HTTP endpoint (member calls, ledger, locks).
    pub http_addr: SocketAddr,
    pub state: MemberState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Member {
    pub fn is_alive(&self) -> bool {
        self.state == MemberState::Alive
    }
}

/// The gossip wire protocol (bincode over UDP).
///
/// - `Ping/Ack`: liveness checks; the ack piggybacks the sender's member list.
/// - `Join`: sent by new members to the seed members.
/// - `Suspect/Alive`: disseminate changes in member health.
/// - `Leave`: a member announcing a graceful departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: MemberId,
        incarnation: u64,
    },

    Ack {
        from: MemberId,
        incarnation: u64,
        members: Vec<Member>,
    },

    Join {
        member: Member,
    },

    Suspect {
        member_id: MemberId,
        incarnation: u64,
    },

    Alive {
        member_id: MemberId,
        incarnation: u64,
    },

    Leave {
        member_id: MemberId,
        incarnation: u64,
    },
}
