//! Tend loop tests
//!
//! Discovery, eviction and partition refresh against a simulated cluster.

use async_trait::async_trait;
use rustkvclient::cluster::{InfoTransport, MAX_INTERVALS_ABSENT};
use rustkvclient::protocol::InfoMap;
use rustkvclient::{
    ClientConfig, Cluster, DIGEST_SIZE, DbError, ErrorKind, Host, InMemoryInfoTransport, Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const PARTITIONS: u32 = 16;

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], 3000))
}

fn config() -> ClientConfig {
    // Long interval: passes are driven explicitly by the tests.
    ClientConfig::new("10.0.0.1", 3000)
        .tend_interval(Duration::from_secs(3600))
        .info_timeout(Duration::from_secs(1))
        .follow(true)
}

/// Digest whose partition is `partition`.
fn digest_for(partition: u32) -> [u8; DIGEST_SIZE] {
    let mut digest = [0u8; DIGEST_SIZE];
    digest[..2].copy_from_slice(&(partition as u16).to_le_bytes());
    digest
}

/// A owns partitions 0..8 and advertises B, which owns 8..16.
async fn two_node_cluster() -> InMemoryInfoTransport {
    let transport = InMemoryInfoTransport::new(PARTITIONS);
    transport.add_node("A1", addr(1)).await;
    transport.add_node("B2", addr(2)).await;
    transport.set_services(addr(1), vec![addr(2)]).await.unwrap();
    transport
        .assign(addr(1), "test", &(0..8).collect::<Vec<_>>(), &(8..16).collect::<Vec<_>>())
        .await
        .unwrap();
    transport
        .assign(addr(2), "test", &(8..16).collect::<Vec<_>>(), &(0..8).collect::<Vec<_>>())
        .await
        .unwrap();
    transport
}

async fn create(transport: &InMemoryInfoTransport, config: ClientConfig) -> Cluster {
    Cluster::create_with_transport(config, Arc::new(transport.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_follow_mode_discovers_advertised_peers() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config()).await;

    let mut names: Vec<String> = cluster.nodes().iter().map(|n| n.name().to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["A1", "B2"]);
    assert_eq!(cluster.partition_count(), Some(PARTITIONS));
    assert!(cluster.is_fully_discovered());

    let owner = cluster.node_for_key("test", &digest_for(3), true).unwrap();
    assert_eq!(owner.name(), "A1");
    let owner = cluster.node_for_key("test", &digest_for(12), true).unwrap();
    assert_eq!(owner.name(), "B2");

    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_without_follow_only_seeds_are_used() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config().follow(false)).await;

    let names: Vec<String> = cluster.nodes().iter().map(|n| n.name().to_string()).collect();
    assert_eq!(names, vec!["A1"]);

    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_add_seed_host_twice_keeps_one_entry() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config().follow(false)).await;
    assert_eq!(cluster.seeds().len(), 1);

    let timeout = Duration::from_secs(1);
    cluster.add_seed_host("10.0.0.2", 3000, timeout).await.unwrap();
    cluster.add_seed_host("10.0.0.2", 3000, timeout).await.unwrap();

    assert_eq!(cluster.seeds().len(), 2);
    assert!(cluster.find_node("B2").is_some());

    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_seed_times_out_with_no_available_node() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config()).await;

    let started = Instant::now();
    let err = cluster
        .add_seed_host("10.9.9.9", 3000, Duration::from_millis(100))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::NoAvailableNode);
    assert!(elapsed >= Duration::from_millis(100), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "returned after {:?}", elapsed);

    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_no_reachable_seed_fails_creation() {
    let transport = InMemoryInfoTransport::new(PARTITIONS);
    let result = Cluster::create_with_transport(config(), Arc::new(transport)).await;
    let err = result.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NoAvailableNode);
}

#[tokio::test]
async fn test_node_without_partitions_is_evicted_and_released() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config()).await;
    let weak_b = Arc::downgrade(&cluster.find_node("B2").unwrap());

    // B stops being advertised and loses all its partitions.
    transport.set_services(addr(1), Vec::new()).await.unwrap();
    transport.clear_ownership(addr(2)).await.unwrap();

    // First pass only learns the new ownership.
    assert!(cluster.tend_once().await);
    assert!(cluster.find_node("B2").is_some());

    for _ in 0..MAX_INTERVALS_ABSENT {
        assert!(cluster.tend_once().await);
        assert!(cluster.find_node("B2").is_some());
    }
    assert!(cluster.tend_once().await);
    assert!(cluster.find_node("B2").is_none());
    assert_eq!(cluster.stats().nodes_removed, 1);

    // Background pool maintenance may hold the node briefly.
    let deadline = Instant::now() + Duration::from_secs(2);
    while weak_b.upgrade().is_some() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(weak_b.upgrade().is_none());

    cluster.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tend_runs_one_pass_at_a_time() {
    let transport = two_node_cluster().await;
    let cluster = Arc::new(create(&transport, config()).await);
    transport.set_delay(Duration::from_millis(20)).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cluster = Arc::clone(&cluster);
        tasks.push(tokio::spawn(async move { cluster.tend_once().await }));
    }
    let mut ran = 0;
    for task in tasks {
        if task.await.unwrap() {
            ran += 1;
        }
    }

    assert!(ran >= 1);
    assert_eq!(cluster.peak_concurrent_passes(), 1);
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_generation_change_moves_ownership() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config()).await;
    let a = cluster.find_node("A1").unwrap();
    let generation = a.partition_generation();

    // B takes over every master slot, A becomes replica of everything.
    let all: Vec<u32> = (0..PARTITIONS).collect();
    transport.assign(addr(2), "test", &all, &[]).await.unwrap();
    transport.assign(addr(1), "test", &[], &all).await.unwrap();
    let report = cluster.tend_report().await.unwrap();
    assert_eq!(report.partitions_refreshed, 2);
    assert!(a.partition_generation() > generation);

    for partition in [0, 5, 15] {
        let owner = cluster.node_for_key("test", &digest_for(partition), true).unwrap();
        assert_eq!(owner.name(), "B2");
    }

    drop(a);
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_node_counter() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config()).await;
    let a = cluster.find_node("A1").unwrap();

    transport.set_reachable(addr(1), false).await.unwrap();
    let report = cluster.tend_report().await.unwrap();
    assert_eq!(report.pings_failed, 1);
    assert_eq!(a.intervals_unreachable(), 1);
    assert!(cluster.tend_once().await);
    assert_eq!(a.intervals_unreachable(), 2);

    transport.set_reachable(addr(1), true).await.unwrap();
    assert!(cluster.tend_once().await);
    assert_eq!(a.intervals_unreachable(), 0);
    assert!(cluster.stats().ping_failures >= 2);

    drop(a);
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_destroy_releases_every_node() {
    let transport = two_node_cluster().await;
    let cluster = create(&transport, config()).await;
    let weak: Vec<_> = cluster.nodes().iter().map(Arc::downgrade).collect();
    assert_eq!(weak.len(), 2);

    cluster.destroy().await.unwrap();
    assert!(cluster.nodes().is_empty());
    assert!(!cluster.tend_once().await);

    let deadline = Instant::now() + Duration::from_secs(2);
    while weak.iter().any(|node| node.upgrade().is_some()) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(weak.iter().all(|node| node.upgrade().is_none()));
}

/// Simulated cluster whose first `partitions` requests time out.
struct FlakyPartitions {
    inner: InMemoryInfoTransport,
    failures_left: AtomicUsize,
}

#[async_trait]
impl InfoTransport for FlakyPartitions {
    async fn resolve(&self, host: &Host) -> Result<Vec<SocketAddr>> {
        self.inner.resolve(host).await
    }

    async fn request(&self, addr: SocketAddr, names: &[&str], timeout: Duration) -> Result<InfoMap> {
        if names == ["partitions"]
            && self
                .failures_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(DbError::Timeout(format!("info request to {}", addr)));
        }
        self.inner.request(addr, names, timeout).await
    }
}

#[tokio::test]
async fn test_partition_count_is_fetched_again_after_failure() {
    let inner = InMemoryInfoTransport::new(PARTITIONS);
    inner.add_node("A1", addr(1)).await;
    inner.assign_all(addr(1), "test").await.unwrap();
    let transport = FlakyPartitions {
        inner,
        failures_left: AtomicUsize::new(1),
    };

    let cluster = Cluster::create_with_transport(config(), Arc::new(transport))
        .await
        .unwrap();

    assert_eq!(cluster.partition_count(), Some(PARTITIONS));
    assert!(cluster.find_node("A1").is_some());
    assert_eq!(cluster.stats().nodes_removed, 0);
    let owner = cluster.node_for_key("test", &digest_for(9), true).unwrap();
    assert_eq!(owner.name(), "A1");

    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn test_new_node_is_not_counted_absent_in_its_first_pass() {
    let transport = InMemoryInfoTransport::new(PARTITIONS);
    transport.add_node("A1", addr(1)).await;
    transport.add_node("B2", addr(2)).await;
    transport.assign_all(addr(1), "test").await.unwrap();

    // Two creation passes: B2 owns nothing but has only missed one of them.
    let cluster = create(&transport, config().follow(false).seed("10.0.0.2", 3000)).await;
    let b = cluster.find_node("B2").unwrap();
    assert_eq!(b.intervals_absent(), 1);
    assert_eq!(cluster.stats().nodes_removed, 0);

    drop(b);
    cluster.destroy().await.unwrap();
}
