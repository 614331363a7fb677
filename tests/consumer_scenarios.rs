//! End-to-end scenarios driving `Client` against `MockTransport`: no real
//! broker, but the same assignment/metadata/scheduler/buffer machinery a
//! caller exercises in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use konsume::testing::MockTransport;
use konsume::transport::KafkaErrorCode;
use konsume::{Client, Config, OffsetSpec};

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn fast_config() -> Config {
    Config::builder("mock:9092")
        .metadata_min_age(Duration::from_millis(20))
        .fetch_max_wait(Duration::from_millis(20))
        .missing_topic_delete_timeout(Duration::from_millis(150))
        .build()
}

fn partition_spec(topic: &str, partition: i32, offset: OffsetSpec) -> HashMap<String, HashMap<i32, OffsetSpec>> {
    let mut parts = HashMap::new();
    parts.insert(partition, offset);
    let mut spec = HashMap::new();
    spec.insert(topic.to_string(), parts);
    spec
}

#[tokio::test]
async fn adding_consumption_before_topic_exists_delivers_once_discovered() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.add_consume_partitions(partition_spec("orders", 0, OffsetSpec::Earliest));

    // Topic doesn't exist on the broker yet: no records should show up.
    let early = client.poll_fetches(Duration::from_millis(100)).await;
    assert!(early.records.is_empty());

    transport.create_topic("orders", 1, 1);
    transport.produce("orders", 0, None, b"hello");

    let fetches = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(fetches.num_records(), 1);
    let mut seen = Vec::new();
    fetches.each_record(|tp, r| {
        assert_eq!(tp.partition, 0);
        seen.push(r.value.clone());
    });
    assert_eq!(seen, vec![Some(b"hello".to_vec())]);
}

#[tokio::test]
async fn partition_level_assignment_is_selective() {
    let transport = Arc::new(MockTransport::new());
    transport.create_topic("metrics", 3, 1);
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.add_consume_partitions(partition_spec("metrics", 1, OffsetSpec::Earliest));

    assert!(wait_until(|| client.assigned_partitions().len() == 1, Duration::from_secs(1)).await);
    let assigned = client.assigned_partitions();
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].partition, 1);

    transport.produce("metrics", 0, None, b"not-mine");
    transport.produce("metrics", 1, None, b"mine");
    transport.produce("metrics", 2, None, b"not-mine-either");

    let fetches = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(fetches.num_records(), 1);
    fetches.each_record(|tp, r| {
        assert_eq!(tp.partition, 1);
        assert_eq!(r.value, Some(b"mine".to_vec()));
    });
}

#[tokio::test]
async fn purge_then_resubscribe_is_a_fresh_start() {
    let transport = Arc::new(MockTransport::new());
    transport.create_topic("sessions", 1, 1);
    transport.produce("sessions", 0, None, b"before-purge");
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.add_consume_partitions(partition_spec("sessions", 0, OffsetSpec::Earliest));
    let fetches = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(fetches.num_records(), 1);

    client.purge_topics_from_client(["sessions"]).await;
    assert!(wait_until(|| client.assigned_partitions().is_empty(), Duration::from_secs(1)).await);

    // A record produced while purged must never surface, even after re-add.
    transport.produce("sessions", 0, None, b"during-purge");

    client.add_consume_partitions(partition_spec("sessions", 0, OffsetSpec::Latest));
    assert!(wait_until(|| client.assigned_partitions().len() == 1, Duration::from_secs(1)).await);

    let after_readd = client.poll_fetches(Duration::from_millis(200)).await;
    assert!(after_readd.records.is_empty(), "latest-offset re-add must not replay pre-purge or mid-purge records");

    transport.produce("sessions", 0, None, b"after-readd");
    let fresh = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(fresh.num_records(), 1);
    fresh.each_record(|_, r| assert_eq!(r.value, Some(b"after-readd".to_vec())));
}

#[tokio::test]
async fn regex_subscription_tracks_matching_topics() {
    let transport = Arc::new(MockTransport::new());
    transport.create_topic("logs.app", 1, 1);
    transport.create_topic("logs.infra", 1, 1);
    transport.create_topic("billing", 1, 1);
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.consume_regex("^logs\\.").await.expect("valid regex");

    assert!(wait_until(|| client.assigned_partitions().len() == 2, Duration::from_secs(1)).await);

    transport.produce("logs.app", 0, None, b"a");
    transport.produce("logs.infra", 0, None, b"b");
    transport.produce("billing", 0, None, b"should-not-match");

    let fetches = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(fetches.num_records(), 2);

    transport.delete_topic("logs.infra");
    assert!(wait_until(|| client.assigned_partitions().len() == 1, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn pausing_a_partition_withholds_its_records() {
    let transport = Arc::new(MockTransport::new());
    transport.create_topic("clicks", 1, 1);
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.add_consume_partitions(partition_spec("clicks", 0, OffsetSpec::Earliest));
    assert!(wait_until(|| !client.assigned_partitions().is_empty(), Duration::from_secs(1)).await);

    let mut to_pause = HashMap::new();
    to_pause.insert("clicks".to_string(), vec![0]);
    client.pause_fetch_partitions(to_pause.clone());

    transport.produce("clicks", 0, None, b"while-paused");
    let paused = client.poll_fetches(Duration::from_millis(200)).await;
    assert!(paused.records.is_empty());

    client.resume_fetch_partitions(to_pause);
    let resumed = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(resumed.num_records(), 1);
    resumed.each_record(|_, r| assert_eq!(r.value, Some(b"while-paused".to_vec())));
}

#[tokio::test]
async fn set_offsets_seed_survives_until_partition_known() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    transport.create_topic("ledger", 1, 1);
    transport.produce("ledger", 0, None, b"0");
    transport.produce("ledger", 0, None, b"1");
    transport.produce("ledger", 0, None, b"2");

    let mut offsets = HashMap::new();
    let mut parts = HashMap::new();
    parts.insert(0, konsume::EpochOffset::new(2, None));
    offsets.insert("ledger".to_string(), parts);
    client.set_offsets(offsets);

    client.add_consume_partitions(partition_spec("ledger", 0, OffsetSpec::Earliest));

    let fetches = client.poll_fetches(Duration::from_secs(2)).await;
    // The seeded offset (2) wins over the Earliest spec passed to add_consume_partitions.
    assert_eq!(fetches.num_records(), 1);
    fetches.each_record(|_, r| assert_eq!(r.value, Some(b"2".to_vec())));
}

#[tokio::test]
async fn persistently_missing_topic_is_auto_purged() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.add_consume_partitions(partition_spec("ghost", 0, OffsetSpec::Earliest));
    assert!(!client.assigned_partitions().is_empty());

    assert!(wait_until(|| client.assigned_partitions().is_empty(), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn authorization_failure_surfaces_as_sticky_error() {
    let transport = Arc::new(MockTransport::new());
    transport.create_topic("restricted", 1, 1);
    transport.inject_error("restricted", 0, KafkaErrorCode::TopicAuthorizationFailed);
    let client = Client::with_transport(fast_config(), transport.clone(), None).unwrap();

    client.add_consume_partitions(partition_spec("restricted", 0, OffsetSpec::Earliest));

    let fetches = client.poll_fetches(Duration::from_secs(2)).await;
    assert_eq!(fetches.errors.len(), 1);
    assert_eq!(fetches.errors[0].0.topic.as_ref(), "restricted");
}
