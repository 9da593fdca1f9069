use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::types::{GossipMessage, Member, MemberId, MemberState};
use crate::cluster::Membership;

/// Timers of the failure detector.
#[derive(Debug, Clone)]
pub struct GossipTimings {
    pub gossip_interval: Duration,
    pub failure_detection_interval: Duration,
    /// Silence after which an alive member becomes suspect.
    pub suspect_timeout: Duration,
    /// Silence after which a suspect member is declared dead.
    pub dead_timeout: Duration,
}

impl Default for GossipTimings {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(500),
            failure_detection_interval: Duration::from_secs(2),
            suspect_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(10),
        }
    }
}

pub struct MembershipService {
    pub local_member: Member,
    pub members: Arc<DashMap<MemberId, Member>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    timings: GossipTimings,
    stop: CancellationToken,
}

impl MembershipService {
    /// Binds the gossip socket and announces this member to every seed.
    pub async fn new(
        gossip_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_members: Vec<SocketAddr>,
        timings: GossipTimings,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(gossip_addr).await?;
        // Port 0 binds are resolved here so peers learn the real address.
        let gossip_addr = socket.local_addr()?;

        let local_member = Member {
            id: MemberId::new(),
            gossip_addr,
            http_addr,
            state: MemberState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_member.id.clone(), local_member.clone());

        if !seed_members.is_empty() {
            tracing::info!("Joining cluster via {} seed member(s)", seed_members.len());
            let join = bincode::serialize(&GossipMessage::Join {
                member: local_member.clone(),
            })?;
            for seed in &seed_members {
                socket.send_to(&join, seed).await?;
                tracing::info!("Sent join request to {}", seed);
            }
        }

        Ok(Arc::new(Self {
            local_member,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            timings,
            stop: CancellationToken::new(),
        }))
    }

    /// Spawns the gossip, receive and failure-detection loops.
    pub fn start(self: &Arc<Self>) {
        tracing::info!("Starting membership service...");

        let service = self.clone();
        tokio::spawn(async move { service.gossip_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.receive_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.failure_detection_loop().await });
    }

    /// Tells every alive peer this member is leaving, then stops the loops.
    pub async fn leave(&self) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        self.broadcast_message(GossipMessage::Leave {
            member_id: self.local_member.id.clone(),
            incarnation,
        })
        .await;
        self.stop.cancel();
        tracing::info!("Left the cluster");
    }

    pub fn get_alive_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, member_id: &MemberId) -> Option<Member> {
        self.members.get(member_id).map(|entry| entry.value().clone())
    }

    fn current_incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timings.gossip_interval);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = interval.tick() => {}
            }

            let peers: Vec<Member> = self
                .get_alive_members()
                .into_iter()
                .filter(|member| member.id != self.local_member.id)
                .collect();

            if peers.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                &peers[rand::thread_rng().gen_range(0..peers.len())]
            };

            let ping = GossipMessage::Ping {
                from: self.local_member.id.clone(),
                incarnation: self.current_incarnation(),
            };
            if let Err(e) = self.send(&ping, target.gossip_addr).await {
                tracing::warn!("Failed to send ping to {}: {}", target.id, e);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            let received = tokio::select! {
                _ = self.stop.cancelled() => return,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize gossip from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => self.handle_ping(from, incarnation, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
                Ok(())
            }
            GossipMessage::Join { member } => self.handle_join(member).await,
            GossipMessage::Suspect {
                member_id,
                incarnation,
            } => {
                self.handle_suspect(member_id, incarnation).await;
                Ok(())
            }
            GossipMessage::Alive {
                member_id,
                incarnation,
            } => {
                self.handle_alive(member_id, incarnation);
                Ok(())
            }
            GossipMessage::Leave {
                member_id,
                incarnation,
            } => {
                self.handle_leave(member_id, incarnation);
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, from: MemberId, incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::debug!("Received ping from {}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if incarnation > member.incarnation {
                member.incarnation = incarnation;
            }
        }
        // Unknown senders are learned through their Join or a later Ack, which
        // carry the HTTP address a bare ping lacks.

        let members: Vec<Member> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let ack = GossipMessage::Ack {
            from: self.local_member.id.clone(),
            incarnation: self.current_incarnation(),
            members,
        };
        self.send(&ack, src).await
    }

    fn handle_ack(&self, from: MemberId, incarnation: u64, members: Vec<Member>) {
        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if incarnation > member.incarnation {
                member.incarnation = incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, incoming: Member) {
        if incoming.id == self.local_member.id {
            return;
        }

        match self.members.get_mut(&incoming.id) {
            Some(mut existing) => {
                if existing.state == MemberState::Left {
                    return;
                }
                if incoming.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        incoming.id,
                        existing.incarnation,
                        incoming.incarnation
                    );
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == MemberState::Alive
                    && existing.state == MemberState::Suspect
                {
                    tracing::info!("{} refuted suspicion", incoming.id);
                    existing.state = MemberState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if !incoming.is_alive() {
                    return;
                }
                tracing::info!("Discovered new member {} at {}", incoming.id, incoming.gossip_addr);
                let mut member = incoming;
                member.last_seen = Some(Instant::now());
                self.members.insert(member.id.clone(), member);
            }
        }
    }

    async fn handle_suspect(&self, member_id: MemberId, incarnation: u64) {
        if member_id == self.local_member.id {
            // Refute by bumping our incarnation above the accusation.
            let refuted = self
                .incarnation
                .fetch_max(incarnation + 1, Ordering::SeqCst)
                .max(incarnation + 1);
            tracing::info!("Refuting suspicion with incarnation {}", refuted);
            self.broadcast_message(GossipMessage::Alive {
                member_id,
                incarnation: refuted,
            })
            .await;
            return;
        }

        match self.members.get_mut(&member_id) {
            Some(mut existing) if incarnation >= existing.incarnation => {
                if existing.state == MemberState::Alive {
                    tracing::info!("Member {} suspected", member_id);
                    existing.state = MemberState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            Some(_) => {}
            None => tracing::debug!("Suspected member {} doesn't exist", member_id),
        }
    }

    fn handle_alive(&self, member_id: MemberId, incarnation: u64) {
        match self.members.get_mut(&member_id) {
            Some(mut existing) => {
                let refutes = incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == MemberState::Suspect);
                if refutes && existing.state != MemberState::Left {
                    tracing::info!("Member {} is alive (inc={})", member_id, incarnation);
                    existing.state = MemberState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => tracing::debug!("Alive message for unknown member {}", member_id),
        }
    }

    async fn handle_join(&self, mut member: Member) -> Result<()> {
        tracing::info!("Member {} joining cluster at {}", member.id, member.gossip_addr);
        let joiner_addr = member.gossip_addr;
        member.state = MemberState::Alive;
        member.last_seen = Some(Instant::now());
        self.members.insert(member.id.clone(), member);
        tracing::info!("Cluster size now: {}", self.members.len());

        // The joiner only knows its seeds; hand it the current view.
        let members: Vec<Member> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let ack = GossipMessage::Ack {
            from: self.local_member.id.clone(),
            incarnation: self.current_incarnation(),
            members,
        };
        self.send(&ack, joiner_addr).await
    }

    fn handle_leave(&self, member_id: MemberId, incarnation: u64) {
        if let Some(mut existing) = self.members.get_mut(&member_id) {
            tracing::info!("Member {} left the cluster", member_id);
            existing.state = MemberState::Left;
            existing.incarnation = existing.incarnation.max(incarnation);
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timings.failure_detection_interval);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = interval.tick() => {}
            }

            let suspicions = self.detect_failures(Instant::now());
            for msg in suspicions {
                self.broadcast_message(msg).await;
            }
        }
    }

    /// Advances Alive -> Suspect -> Dead for silent members and returns the
    /// suspicions to broadcast.
    fn detect_failures(&self, now: Instant) -> Vec<GossipMessage> {
        let mut suspicions = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.id == self.local_member.id {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let silence = now.duration_since(last_seen);

            match member.state {
                MemberState::Alive if silence > self.timings.suspect_timeout => {
                    tracing::warn!("Member {} suspected (no contact for {:?})", member.id, silence);
                    member.state = MemberState::Suspect;
                    suspicions.push(GossipMessage::Suspect {
                        member_id: member.id.clone(),
                        incarnation: member.incarnation,
                    });
                }
                MemberState::Suspect if silence > self.timings.dead_timeout => {
                    tracing::warn!("Member {} declared dead (no contact for {:?})", member.id, silence);
                    member.state = MemberState::Dead;
                }
                _ => {}
            }
        }

        suspicions
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let peers: Vec<SocketAddr> = self
            .get_alive_members()
            .into_iter()
            .filter(|member| member.id != self.local_member.id)
            .map(|member| member.gossip_addr)
            .collect();

        for addr in peers {
            if let Err(e) = self.send(&msg, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", addr, e);
            }
        }
    }

    async fn send(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }
}

impl Membership for MembershipService {
    fn local_member(&self) -> MemberId {
        self.local_member.id.clone()
    }

    fn reachable_members(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .get_alive_members()
            .into_iter()
            .map(|member| member.id)
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
impl MembershipService {
    pub(crate) fn detect_failures_at(&self, now: Instant) -> Vec<GossipMessage> {
        self.detect_failures(now)
    }

    pub(crate) async fn deliver(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        self.handle_message(msg, src).await
    }

    pub(crate) fn incarnation(&self) -> u64 {
        self.current_incarnation()
    }
}
