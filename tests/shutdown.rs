//! Ordered shutdown of a listener with relays in flight.

use std::time::Duration;

mod common;

#[tokio::test]
async fn shutdown_closes_every_relay_and_drains() {
    let echo = common::start_echo_upstream().await;
    let mut config = common::relay_config(echo);
    config.admission.window_secs = 0;
    let harness = common::RelayHarness::start(config).await;

    let mut miners = Vec::new();
    for _ in 0..3 {
        miners.push(harness.connect().await);
    }
    harness.wait_for(|s| s.active_connections == 3).await;

    let correlator = harness.correlator.clone();
    let tracker = harness.tracker.clone();
    assert!(harness.stop().await);
    assert_eq!(tracker.active_count(), 0);

    for miner in &mut miners {
        assert!(common::is_closed_by_peer(miner, Duration::from_secs(5)).await);
    }

    common::wait_until(Duration::from_secs(5), || {
        let snapshot = correlator.snapshot();
        async move { snapshot.active_connections == 0 && snapshot.connection_duration.count() == 3 }
    })
    .await;
}

#[tokio::test]
async fn stopped_listener_refuses_connections() {
    let echo = common::start_echo_upstream().await;
    let harness = common::RelayHarness::start(common::relay_config(echo)).await;
    let addr = harness.addr;

    assert!(harness.stop().await);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
