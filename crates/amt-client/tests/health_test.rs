//! Resource watchdog restarts
mod common;

use amt_client::{
    AmtGateway, GatewayError, HealthConfig, RebuildReason, ResourceSample,
};
use common::*;
use std::time::Duration;

const HIGH: ResourceSample = ResourceSample {
    cpu_percent: 97.0,
    mem_percent: 50.0,
};

fn watchdog() -> HealthConfig {
    HealthConfig {
        interval: Duration::from_millis(40),
        ..HealthConfig::default()
    }
}

#[tokio::test]
async fn test_sustained_pressure_restarts_once() {
    init_tracing();
    let mut relay = MockRelay::bind("127.0.0.1:0").await;
    let (_sink, output_port) = output_sink().await;

    let mut config = config_for(&relay, output_port);
    config.relay_pool = vec![loopback("127.0.0.1")];
    config.health = watchdog();

    let sampler = ScriptedSampler::new([HIGH; 5]);
    let handle = AmtGateway::start_with_sampler(config, Box::new(sampler.clone()))
        .await
        .unwrap();
    relay.next_update().await;

    // The fifth high sample leaves, then rebuilds through the default relay pool
    let (_, leave) = relay.next_update().await;
    assert!(is_leave(&leave));
    assert!(matches!(relay.next_event().await, RelayEvent::Discovery { .. }));
    relay.next_update().await;
    assert!(sampler.taken() >= 5);

    // Normal samples afterwards: no further restart
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(sampler.taken() > 5);
    handle.stop().await.unwrap();

    let (_, leave) = relay.next_update().await;
    assert!(is_leave(&leave));
}

#[tokio::test]
async fn test_interrupted_pressure_does_not_restart() {
    let mut relay = MockRelay::bind("127.0.0.1:0").await;
    let (_sink, output_port) = output_sink().await;

    let mut config = config_for(&relay, output_port);
    config.health = watchdog();

    let low = ResourceSample {
        cpu_percent: 10.0,
        mem_percent: 10.0,
    };
    let sampler = ScriptedSampler::new([HIGH, HIGH, HIGH, HIGH, low, HIGH, HIGH, HIGH, HIGH]);
    let handle = AmtGateway::start_with_sampler(config, Box::new(sampler.clone()))
        .await
        .unwrap();
    relay.next_update().await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(sampler.taken() >= 9);
    handle.stop().await.unwrap();

    // Only the leave follows the initial join
    let (_, leave) = relay.next_update().await;
    assert!(is_leave(&leave));
}

#[tokio::test]
async fn test_restart_on_fixed_port_survives_streaming_relay() {
    init_tracing();
    let mut relay = MockRelay::bind("127.0.0.1:0").await;
    let (sink, output_port) = output_sink().await;
    let local_port = free_udp_port();

    let mut config = config_for(&relay, output_port);
    config.local_port = local_port;
    config.relay_pool = vec![loopback("127.0.0.1")];
    config.handshake_timeout = Duration::from_secs(1);
    config.max_reconnect_attempts = u32::MAX;
    config.health = watchdog();

    let sampler = ScriptedSampler::new([HIGH; 5]);
    let mut handle = AmtGateway::start_with_sampler(config, Box::new(sampler.clone()))
        .await
        .unwrap();
    let (gateway, _) = relay.next_update().await;
    assert_eq!(gateway.port(), local_port);

    // Replication keeps arriving on the fixed port through the restart
    let stream = relay.stream_to(gateway, Duration::from_millis(1));

    let (_, leave) = relay.next_update().await;
    assert!(is_leave(&leave));
    assert!(matches!(relay.next_event().await, RelayEvent::Discovery { .. }));
    let (rejoined_from, rejoin) = relay.next_update().await;
    assert_eq!(rejoined_from.port(), local_port);
    assert!(!is_leave(&rejoin));

    assert!(handle.is_alive());
    assert!(sampler.taken() >= 5);
    let forwarded = handle.status().packets_forwarded;
    assert_eq!(recv_payload(&sink).await, b"stream");
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.status().packets_forwarded <= forwarded {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("forwarding did not resume after restart");

    stream.abort();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), handle.wait())
            .await
            .is_err(),
        "gateway ended after restart"
    );
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_health_restart_is_fatal() {
    let mut relay = MockRelay::bind("127.0.0.1:0").await;
    let (_sink, output_port) = output_sink().await;

    let mut config = config_for(&relay, output_port);
    config.relay_pool = vec![loopback("127.0.0.1")];
    config.handshake_timeout = Duration::from_millis(100);
    config.health = watchdog();

    let mut handle =
        AmtGateway::start_with_sampler(config, Box::new(ScriptedSampler::new([HIGH; 5])))
            .await
            .unwrap();
    relay.next_update().await;
    relay.go_silent();

    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("gateway kept running");

    assert!(matches!(
        result,
        Err(GatewayError::ForcedRebuild {
            reason: RebuildReason::ResourcePressure,
            ..
        })
    ));
}
