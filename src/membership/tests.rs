//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership system.
//!
//! ## Test Scopes
//! - **Data Structures**: Ensures uniqueness of IDs and correct serialization of wire protocol messages.
//! - **Service Logic**: Verifies initialization, joins, member list merging and leaving.
//! - **Failure Detection**: Suspect/Dead transitions and incarnation-based refutation.

#[cfg(test)]
mod tests {
    use crate::cluster::Membership;
    use crate::membership::service::{GossipTimings, MembershipService};
    use crate::membership::types::{GossipMessage, Member, MemberId, MemberState};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    async fn service() -> Arc<MembershipService> {
        MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            vec![],
            GossipTimings::default(),
        )
        .await
        .expect("Failed to create service")
    }

    /// Two services where the first has accepted the second's join.
    async fn joined_pair() -> (Arc<MembershipService>, Arc<MembershipService>) {
        let first = service().await;
        let second = service().await;
        first
            .deliver(
                GossipMessage::Join {
                    member: second.local_member.clone(),
                },
                second.local_member.gossip_addr,
            )
            .await
            .unwrap();
        (first, second)
    }

    fn member(id: &str, state: MemberState, incarnation: u64) -> Member {
        Member {
            id: MemberId::from(id),
            gossip_addr: "127.0.0.1:5000".parse().unwrap(),
            http_addr: "127.0.0.1:6000".parse().unwrap(),
            state,
            incarnation,
            last_seen: None,
        }
    }

    // ============================================================
    // MEMBER ID & SERIALIZATION TESTS
    // ============================================================

    #[test]
    fn test_member_id_is_unique() {
        let id1 = MemberId::new();
        let id2 = MemberId::new();

        assert_ne!(id1, id2, "Each MemberId should be unique");
    }

    #[test]
    fn test_member_id_ordering_is_stable() {
        let mut ids = vec![MemberId::from("c"), MemberId::from("a"), MemberId::from("b")];
        ids.sort();
        assert_eq!(ids, vec![MemberId::from("a"), MemberId::from("b"), MemberId::from("c")]);
    }

    #[test]
    fn test_member_serialization_skips_last_seen() {
        let mut m = member("test-member", MemberState::Alive, 42);
        m.last_seen = Some(Instant::now());

        let json = serde_json::to_string(&m).expect("Serialization failed");
        let restored: Member = serde_json::from_str(&json).expect("Deserialization failed");

        assert_eq!(restored.id, m.id);
        assert_eq!(restored.http_addr, m.http_addr);
        assert_eq!(restored.incarnation, 42);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_ack_bincode_serialization() {
        let msg = GossipMessage::Ack {
            from: MemberId::from("responder"),
            incarnation: 10,
            members: vec![
                member("member-1", MemberState::Alive, 1),
                member("member-2", MemberState::Suspect, 2),
            ],
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ack");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ack");

        if let GossipMessage::Ack {
            from,
            incarnation,
            members,
        } = decoded
        {
            assert_eq!(from.0, "responder");
            assert_eq!(incarnation, 10);
            assert_eq!(members.len(), 2);
            assert_eq!(members[1].state, MemberState::Suspect);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let service = service().await;

        // Should have itself as a member
        assert_eq!(service.members.len(), 1);
        assert_ne!(service.local_member.gossip_addr.port(), 0);
        assert_eq!(service.local_member.http_addr.port(), 8080);

        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, service.local_member.id);
        assert_eq!(service.reachable_members(), vec![service.local_member()]);
    }

    #[tokio::test]
    async fn test_join_adds_alive_member() {
        let (first, second) = joined_pair().await;

        let mut expected = vec![first.local_member.id.clone(), second.local_member.id.clone()];
        expected.sort();
        assert_eq!(first.reachable_members(), expected);
        assert!(first.get_member(&second.local_member.id).is_some());
    }

    #[tokio::test]
    async fn test_ack_merges_member_list() {
        let (first, second) = joined_pair().await;
        let members: Vec<Member> = first
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        second
            .deliver(
                GossipMessage::Ack {
                    from: first.local_member.id.clone(),
                    incarnation: 1,
                    members,
                },
                first.local_member.gossip_addr,
            )
            .await
            .unwrap();

        assert_eq!(second.get_alive_members().len(), 2);
    }

    #[tokio::test]
    async fn test_ack_ignores_unknown_dead_members() {
        let service = service().await;
        let src: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        service
            .deliver(
                GossipMessage::Ack {
                    from: MemberId::from("peer"),
                    incarnation: 1,
                    members: vec![member("ghost", MemberState::Dead, 3)],
                },
                src,
            )
            .await
            .unwrap();

        assert!(service.get_member(&MemberId::from("ghost")).is_none());
    }

    // ============================================================
    // FAILURE DETECTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_silent_member_becomes_suspect_then_dead() {
        let (first, second) = joined_pair().await;
        let id = second.local_member.id.clone();
        let now = Instant::now();

        let suspicions = first.detect_failures_at(now + Duration::from_secs(6));
        assert_eq!(suspicions.len(), 1);
        assert_eq!(first.get_member(&id).unwrap().state, MemberState::Suspect);
        assert!(!first.reachable_members().contains(&id));

        first.detect_failures_at(now + Duration::from_secs(11));
        assert_eq!(first.get_member(&id).unwrap().state, MemberState::Dead);
    }

    #[tokio::test]
    async fn test_alive_with_higher_incarnation_refutes_suspicion() {
        let (first, second) = joined_pair().await;
        let id = second.local_member.id.clone();
        let src = second.local_member.gossip_addr;

        first
            .deliver(
                GossipMessage::Suspect {
                    member_id: id.clone(),
                    incarnation: 1,
                },
                src,
            )
            .await
            .unwrap();
        assert_eq!(first.get_member(&id).unwrap().state, MemberState::Suspect);

        first
            .deliver(
                GossipMessage::Alive {
                    member_id: id.clone(),
                    incarnation: 2,
                },
                src,
            )
            .await
            .unwrap();

        let refuted = first.get_member(&id).unwrap();
        assert_eq!(refuted.state, MemberState::Alive);
        assert_eq!(refuted.incarnation, 2);
    }

    #[tokio::test]
    async fn test_suspected_self_bumps_incarnation() {
        let service = service().await;
        let src: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        service
            .deliver(
                GossipMessage::Suspect {
                    member_id: service.local_member.id.clone(),
                    incarnation: 5,
                },
                src,
            )
            .await
            .unwrap();

        assert_eq!(service.incarnation(), 6);
    }

    #[tokio::test]
    async fn test_left_member_is_never_resurrected() {
        let (first, second) = joined_pair().await;
        let id = second.local_member.id.clone();
        let src = second.local_member.gossip_addr;

        first
            .deliver(
                GossipMessage::Leave {
                    member_id: id.clone(),
                    incarnation: 2,
                },
                src,
            )
            .await
            .unwrap();
        assert_eq!(first.get_member(&id).unwrap().state, MemberState::Left);

        let mut stale = second.local_member.clone();
        stale.incarnation = 10;
        first
            .deliver(
                GossipMessage::Ack {
                    from: MemberId::from("someone"),
                    incarnation: 1,
                    members: vec![stale],
                },
                src,
            )
            .await
            .unwrap();

        assert_eq!(first.get_member(&id).unwrap().state, MemberState::Left);
        assert!(!first.reachable_members().contains(&id));
    }

    // ============================================================
    // GOSSIP OVER UDP
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_members_discover_each_other() {
        let timings = GossipTimings {
            gossip_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let seed = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:8081".parse().unwrap(),
            vec![],
            timings.clone(),
        )
        .await
        .unwrap();
        let joiner = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:8082".parse().unwrap(),
            vec![seed.local_member.gossip_addr],
            timings,
        )
        .await
        .unwrap();
        seed.start();
        joiner.start();

        for _ in 0..100 {
            if seed.reachable_members().len() == 2 && joiner.reachable_members().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(seed.reachable_members(), joiner.reachable_members());
        assert_eq!(seed.reachable_members().len(), 2);

        joiner.leave().await;
        seed.leave().await;
    }
}
