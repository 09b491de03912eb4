//! End-to-end relay tests through a live listener.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stratum_relay::net::Side;
use stratum_relay::observability::correlator;
use stratum_relay::observability::events::Labels;
use stratum_relay::relay::FaultClass;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

mod common;

#[tokio::test]
async fn miner_session_is_relayed_and_measured() {
    let pool = common::start_mock_pool(Duration::from_millis(50), 1024).await;
    let harness = common::RelayHarness::start(common::relay_config(pool)).await;

    let mut miner = BufReader::new(harness.connect().await);
    miner
        .get_mut()
        .write_all(b"{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"w1\",\"x\"]}\n")
        .await
        .unwrap();

    let auth: Value = serde_json::from_str(&common::read_line(&mut miner).await).unwrap();
    assert_eq!(auth["id"], 1);
    assert_eq!(auth["result"], true);
    let diff: Value = serde_json::from_str(&common::read_line(&mut miner).await).unwrap();
    assert_eq!(diff["method"], "mining.set_difficulty");

    miner
        .get_mut()
        .write_all(b"{\"id\":2,\"method\":\"mining.submit\",\"params\":[\"w1\",\"job1\",\"00\",\"00\",\"00\"]}\n")
        .await
        .unwrap();
    let share: Value = serde_json::from_str(&common::read_line(&mut miner).await).unwrap();
    assert_eq!(share["id"], 2);

    let labels = Labels {
        worker: Some(Arc::from("w1")),
        upstream: Arc::from(pool.to_string()),
    };
    let snapshot = harness
        .wait_for(|s| correlator::total(&s.shares_accepted) == 1 && s.notifications.contains_key("mining.set_difficulty"))
        .await;

    assert_eq!(snapshot.active_connections, 1);
    assert_eq!(snapshot.connections_total, 1);
    assert_eq!(snapshot.submits.get(&labels), Some(&1));
    assert_eq!(snapshot.shares_accepted.get(&labels), Some(&1));
    assert_eq!(snapshot.difficulty.get(&labels), Some(&1024.0));
    assert_eq!(snapshot.request_latency.count(), 1);
    assert!(snapshot.request_latency.sum() >= 0.04);
    assert_eq!(snapshot.pending_requests, 0);
    assert_eq!(snapshot.connect_latency.count(), 1);

    drop(miner);
    let snapshot = harness.wait_for(|s| s.active_connections == 0).await;
    assert_eq!(snapshot.connection_duration.count(), 1);
    assert!(correlator::total(&snapshot.bytes_sent) > 0);
    assert!(correlator::total(&snapshot.bytes_received) > 0);

    assert!(harness.stop().await);
}

#[tokio::test]
async fn large_transfer_arrives_intact() {
    let echo = common::start_echo_upstream().await;
    let mut config = common::relay_config(echo);
    config.relay.read_buffer_bytes = 4096;
    let harness = common::RelayHarness::start(config).await;

    let payload: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let expected_sum: u64 = payload.iter().map(|&b| u64::from(b)).sum();

    let stream = harness.connect().await;
    let (mut rd, mut wr) = stream.into_split();
    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr
    });

    let mut received = vec![0u8; 2 * 1024 * 1024];
    tokio::time::timeout(Duration::from_secs(20), rd.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    let _wr = writer.await.unwrap();

    let sum: u64 = received.iter().map(|&b| u64::from(b)).sum();
    assert_eq!(sum, expected_sum);
    assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));

    let snapshot = harness
        .wait_for(|s| correlator::total(&s.bytes_received) == 2 * 1024 * 1024)
        .await;
    assert_eq!(correlator::total(&snapshot.bytes_sent), 2 * 1024 * 1024);
}

#[tokio::test]
async fn unreachable_upstream_closes_downstream() {
    let dead = common::closed_port().await;
    let harness = common::RelayHarness::start(common::relay_config(dead)).await;

    let mut miner = harness.connect().await;
    assert!(common::is_closed_by_peer(&mut miner, Duration::from_secs(5)).await);

    let snapshot = harness
        .wait_for(|s| s.errors.contains_key(&(Side::Upstream, FaultClass::Expected)))
        .await;
    assert_eq!(snapshot.connections_total, 0);
    assert_eq!(snapshot.active_connections, 0);
    common::wait_until(Duration::from_secs(5), || {
        let active = harness.tracker.active_count();
        async move { active == 0 }
    })
    .await;
}

#[tokio::test]
async fn noise_is_forwarded_unchanged() {
    let echo = common::start_echo_upstream().await;
    let harness = common::RelayHarness::start(common::relay_config(echo)).await;

    let mut stream = harness.connect().await;
    let noise = b"GET / HTTP/1.1\r\nHost: pool\r\n\r\n\x16\x03\x01\x00\xff\xfe";
    stream.write_all(noise).await.unwrap();

    let mut back = vec![0u8; noise.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut back))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&back[..], &noise[..]);

    let snapshot = harness.snapshot();
    assert_eq!(correlator::total(&snapshot.submits), 0);
    assert!(snapshot.notifications.is_empty());
}
