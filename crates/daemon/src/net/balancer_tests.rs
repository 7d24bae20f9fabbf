#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;

fn remote(port: u16, threads: u32, shard: Option<u32>) -> Remote {
    Remote {
        endpoint: EndPoint::Tcp("10.0.0.1".to_string(), port),
        threads,
        shard,
    }
}

#[test]
fn empty_set_yields_none() {
    let balancer = Balancer::new(vec![]);
    assert!(balancer.pick(None).is_none());
}

#[test]
fn round_robin_rotates_across_remotes() {
    let balancer = Balancer::new(vec![remote(1, 10, None), remote(2, 10, None)]);

    let first = balancer.pick(None).unwrap();
    let second = balancer.pick(None).unwrap();
    assert_ne!(first.remote().endpoint, second.remote().endpoint);
}

#[test]
fn saturated_remote_is_skipped() {
    let balancer = Balancer::new(vec![remote(1, 1, None), remote(2, 10, None)]);

    let lease_a = balancer.pick(None).unwrap();
    let lease_b = balancer.pick(None).unwrap();
    let lease_c = balancer.pick(None).unwrap();

    // Remote 1 has a single slot; at most one lease points at it.
    let on_first = [&lease_a, &lease_b, &lease_c]
        .iter()
        .filter(|lease| lease.remote().endpoint == EndPoint::Tcp("10.0.0.1".to_string(), 1))
        .count();
    assert_eq!(on_first, 1);
}

#[test]
fn all_saturated_yields_none() {
    let balancer = Balancer::new(vec![remote(1, 1, None), remote(2, 1, None)]);

    let _lease_a = balancer.pick(None).unwrap();
    let _lease_b = balancer.pick(None).unwrap();
    assert!(balancer.pick(None).is_none());
}

#[test]
fn dropping_a_lease_frees_the_slot() {
    let balancer = Balancer::new(vec![remote(1, 1, None)]);

    let lease = balancer.pick(None).unwrap();
    assert!(balancer.pick(None).is_none());
    drop(lease);

    assert!(balancer.pick(None).is_some());
    assert_eq!(balancer.in_flight(0), 1);
}

#[test]
fn shard_hint_prefers_matching_remote() {
    let balancer = Balancer::new(vec![
        remote(1, 10, Some(0)),
        remote(2, 10, Some(1)),
        remote(3, 10, None),
    ]);

    for _ in 0..10 {
        let lease = balancer.pick(Some(1)).unwrap();
        assert_eq!(lease.remote().shard, Some(1));
    }
}

#[test]
fn shard_hint_falls_back_when_match_is_saturated() {
    let balancer = Balancer::new(vec![remote(1, 1, Some(1)), remote(2, 1, Some(2))]);

    let _match = balancer.pick(Some(1)).unwrap();
    let fallback = balancer.pick(Some(1)).unwrap();
    assert_eq!(fallback.remote().shard, Some(2));
}
