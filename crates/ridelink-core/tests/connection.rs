//! Connection lifecycle tests over the mock transport.
//!
//! These run without Bluetooth hardware. Timing-sensitive tests use paused
//! time, so backoff delays complete instantly while keeping exact offsets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, sleep};

use ridelink_core::{
    ConnectionOptions, ConnectionStatus, Error, MockTransport, Reading, SensorConnection,
    SensorEvent, SensorKind, SupervisorState, Transport,
};

type StatusLog = Arc<Mutex<Vec<(ConnectionStatus, Instant)>>>;

async fn open(mock: &Arc<MockTransport>, kind: SensorKind) -> SensorConnection {
    let transport: Arc<dyn Transport> = mock.clone();
    SensorConnection::open(transport, kind, ConnectionOptions::default())
        .await
        .expect("mock connect should succeed")
}

fn record_statuses(connection: &SensorConnection) -> StatusLog {
    let log: StatusLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    connection.on_status_change(move |status| sink.lock().unwrap().push((status, Instant::now())));
    log
}

fn record_readings(connection: &SensorConnection) -> Arc<Mutex<Vec<Reading>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    connection.add_listener(move |reading| sink.lock().unwrap().push(*reading));
    seen
}

/// Poll until the connection reports `status`, or panic after `limit`.
async fn wait_for_status(connection: &SensorConnection, status: ConnectionStatus, limit: Duration) {
    let deadline = Instant::now() + limit;
    while connection.status() != Some(status) {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}, last status {:?}",
            status,
            connection.status()
        );
        sleep(Duration::from_millis(100)).await;
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_full_lifecycle() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::HeartRate).await;
    let id = connection.device().id.clone();
    let mut events = connection.events();

    assert_eq!(connection.status(), Some(ConnectionStatus::Connected));
    assert_eq!(connection.state(), SupervisorState::Connected);
    assert!(connection.device_name().contains("Heart Rate"));

    let seen = record_readings(&connection);
    let characteristic = SensorKind::HeartRate.profile().characteristic;
    mock.push_notification(&id, characteristic, &[0x00, 150]);
    mock.push_notification(&id, characteristic, &[0x01, 0x9c, 0x00]);
    // Out of bounds and truncated frames produce nothing.
    mock.push_notification(&id, characteristic, &[0x01, 0xf4, 0x01]);
    mock.push_notification(&id, characteristic, &[0x00]);

    let values: Vec<_> = seen.lock().unwrap().iter().map(|r| r.value()).collect();
    assert_eq!(values, vec![Some(150.0), Some(156.0)]);

    match events.recv().await.unwrap() {
        SensorEvent::Reading { reading, kind, .. } => {
            assert_eq!(kind, SensorKind::HeartRate);
            assert_eq!(reading.value(), Some(150.0));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    connection.disconnect().await.unwrap();
    assert!(!mock.is_connected(&id));
    assert_eq!(mock.subscription_count(&id), 0);
    assert_eq!(connection.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn test_disconnect_twice_is_safe() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Power).await;

    connection.disconnect().await.unwrap();
    connection.disconnect().await.unwrap();
    assert_eq!(connection.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn test_duplicate_listener_invoked_twice() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Power).await;
    let id = connection.device().id.clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let listener = {
        let calls = Arc::clone(&calls);
        move |_: &Reading| {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    };
    connection.add_listener(listener.clone());
    connection.add_listener(listener);

    let characteristic = SensorKind::Power.profile().characteristic;
    mock.push_notification(&id, characteristic, &[0x00, 0x00, 0xc8, 0x00]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_listeners_called_in_registration_order() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Power).await;
    let id = connection.device().id.clone();

    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..3 {
        let order = Arc::clone(&order);
        connection.add_listener(move |_| order.lock().unwrap().push(tag));
    }

    let characteristic = SensorKind::Power.profile().characteristic;
    mock.push_notification(&id, characteristic, &[0x00, 0x00, 0xc8, 0x00]);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_panicking_listener_keeps_connection() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Power).await;
    let id = connection.device().id.clone();

    connection.add_listener(|_| panic!("listener bug"));
    let seen = record_readings(&connection);
    let mut events = connection.events();
    let characteristic = SensorKind::Power.profile().characteristic;
    mock.push_notification(&id, characteristic, &[0x00, 0x00, 0xc8, 0x00]);
    mock.push_notification(&id, characteristic, &[0x00, 0x00, 0xc9, 0x00]);

    assert_eq!(seen.lock().unwrap().len(), 2);
    for expected in [200.0, 201.0] {
        match events.try_recv().unwrap() {
            SensorEvent::Reading { reading, .. } => assert_eq!(reading.value(), Some(expected)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(connection.status(), Some(ConnectionStatus::Connected));
    assert_eq!(connection.state(), SupervisorState::Connected);
    assert!(mock.is_connected(&id));
}

#[tokio::test]
async fn test_drop_closes_link() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Cadence).await;
    let id = connection.device().id.clone();
    assert!(mock.is_connected(&id));

    drop(connection);
    // Closing happens on a spawned task.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!mock.is_connected(&id));
}

// =============================================================================
// Initial connection failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_failure_not_retried() {
    let mock = Arc::new(MockTransport::silent());
    mock.fail_next_connects(1);

    let transport: Arc<dyn Transport> = mock.clone();
    let result = SensorConnection::open(transport, SensorKind::Power, ConnectionOptions::default()).await;
    assert!(matches!(result, Err(Error::ConnectionFailed { .. })));

    sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.connect_count(), 1);
}

#[tokio::test]
async fn test_selection_cancelled() {
    let mock = Arc::new(MockTransport::silent());
    mock.fail_selection(true);

    let transport: Arc<dyn Transport> = mock.clone();
    let result = SensorConnection::open(transport, SensorKind::HeartRate, ConnectionOptions::default()).await;
    assert!(matches!(result, Err(Error::SelectionCancelled)));
    assert_eq!(mock.connect_count(), 0);
}

#[tokio::test]
async fn test_invalid_policy_rejected() {
    let mock = Arc::new(MockTransport::silent());
    let transport: Arc<dyn Transport> = mock.clone();
    let options = ConnectionOptions::default()
        .policy(ridelink_core::ReconnectPolicy::default().backoff_multiplier(0.0));

    let result = SensorConnection::open(transport, SensorKind::Power, options).await;
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
    assert_eq!(mock.connect_count(), 0);
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_failed() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Power).await;
    let log = record_statuses(&connection);
    let id = connection.device().id.clone();

    mock.fail_next_connects(u32::MAX);
    let lost_at = Instant::now();
    assert!(mock.trigger_disconnect(&id));

    wait_for_status(&connection, ConnectionStatus::Failed, Duration::from_secs(120)).await;

    let log = log.lock().unwrap().clone();
    let timeline: Vec<(ConnectionStatus, u64)> = log
        .iter()
        .map(|(status, at)| (*status, (*at - lost_at).as_secs()))
        .collect();
    assert_eq!(
        timeline,
        vec![
            (ConnectionStatus::Disconnected, 0),
            (ConnectionStatus::Reconnecting, 1),
            (ConnectionStatus::Reconnecting, 3),
            (ConnectionStatus::Reconnecting, 7),
            (ConnectionStatus::Reconnecting, 15),
            (ConnectionStatus::Reconnecting, 31),
            (ConnectionStatus::Failed, 31),
        ]
    );
    assert_eq!(mock.connect_count(), 6);
    assert_eq!(connection.state(), SupervisorState::Failed);

    // Failed is terminal even once the sensor is reachable again.
    mock.fail_next_connects(0);
    sleep(Duration::from_secs(300)).await;
    assert_eq!(mock.connect_count(), 6);
    assert_eq!(connection.status(), Some(ConnectionStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_readings() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::HeartRate).await;
    let log = record_statuses(&connection);
    let seen = record_readings(&connection);
    let id = connection.device().id.clone();

    mock.fail_next_connects(2);
    mock.trigger_disconnect(&id);
    // Attempts at 1 s and 3 s fail, the one at 7 s succeeds.
    sleep(Duration::from_secs(10)).await;

    let statuses: Vec<_> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        statuses,
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Connected,
        ]
    );
    assert_eq!(connection.reconnect_attempts(), 0);
    assert_eq!(mock.subscription_count(&id), 1);

    let characteristic = SensorKind::HeartRate.profile().characteristic;
    assert!(mock.push_notification(&id, characteristic, &[0x00, 120]));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_silences_status() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Power).await;
    let log = record_statuses(&connection);
    let id = connection.device().id.clone();

    mock.fail_next_connects(u32::MAX);
    mock.trigger_disconnect(&id);
    // Into the 2 s wait before the second attempt.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(mock.connect_count(), 2);

    connection.disconnect().await.unwrap();
    let recorded = log.lock().unwrap().len();

    sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.connect_count(), 2);
    assert_eq!(log.lock().unwrap().len(), recorded);
    assert_eq!(connection.state(), SupervisorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_reconnect_open() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::HeartRate).await;
    let log = record_statuses(&connection);
    let id = connection.device().id.clone();

    mock.set_connect_latency(Duration::from_secs(5));
    mock.trigger_disconnect(&id);
    // First attempt starts at 1 s and is still connecting at 2 s.
    sleep(Duration::from_secs(2)).await;
    assert_eq!(mock.connect_count(), 2);

    connection.disconnect().await.unwrap();
    // Let the in-flight connect finish.
    sleep(Duration::from_secs(10)).await;

    let statuses: Vec<_> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        statuses,
        vec![ConnectionStatus::Disconnected, ConnectionStatus::Reconnecting]
    );
    assert_eq!(mock.connect_count(), 2);
    assert!(!mock.is_connected(&id));
    assert_eq!(mock.subscription_count(&id), 0);
    assert_eq!(connection.state(), SupervisorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_crank_state_reset_on_reconnect() {
    let mock = Arc::new(MockTransport::silent());
    let connection = open(&mock, SensorKind::Cadence).await;
    let seen = record_readings(&connection);
    let id = connection.device().id.clone();
    let characteristic = SensorKind::Cadence.profile().characteristic;

    // (100 revs, 1024 ticks) then (101, 2048): one revolution per second.
    mock.push_notification(&id, characteristic, &[0x02, 100, 0, 0x00, 0x04]);
    mock.push_notification(&id, characteristic, &[0x02, 101, 0, 0x00, 0x08]);
    assert_eq!(seen.lock().unwrap().last().and_then(Reading::value), Some(60.0));

    mock.trigger_disconnect(&id);
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(connection.status(), Some(ConnectionStatus::Connected));

    // Without a reset this sample would pair with the one before the drop.
    mock.push_notification(&id, characteristic, &[0x02, 102, 0, 0x00, 0x0c]);
    assert_eq!(seen.lock().unwrap().len(), 1);
    mock.push_notification(&id, characteristic, &[0x02, 103, 0, 0x00, 0x10]);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(seen.lock().unwrap().last().and_then(Reading::value), Some(60.0));
}

#[tokio::test(start_paused = true)]
async fn test_generated_frames_flow() {
    let mock = Arc::new(MockTransport::new(Duration::from_millis(250)));
    let connection = open(&mock, SensorKind::Power).await;
    let seen = record_readings(&connection);

    sleep(Duration::from_millis(1100)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(
        seen.iter()
            .filter_map(Reading::value)
            .all(|watts| (150.0..=250.0).contains(&watts))
    );
}
