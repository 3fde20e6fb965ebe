mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use common::{
    esp32_adv, frame, left_adv, right_adv, unrelated_adv, Events, FailingSink, MockCentral,
    RecordingSink,
};
use niura_rs::config::BudsConfig;
use niura_rs::coordinator::EegBudsService;
use niura_rs::error::BudsError;
use niura_rs::protocol::{
    encode_command, LEFT_RX_CHARACTERISTIC, LEFT_SERVICE_UUID, LEFT_TX_CHARACTERISTIC,
    RIGHT_RX_CHARACTERISTIC, RIGHT_SERVICE_UUID, START_STREAMING, STOP_STREAMING,
};
use niura_rs::transport::Advertisement;
use niura_rs::types::{ConnectionState, ConnectionStatus, Side};
use niura_rs::uploader::BatchSink;

const WINDOW: Duration = Duration::from_millis(2000);

/// Let spawned tasks run without crossing a collection window.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn left_id() -> String {
    left_adv().id
}

fn right_id() -> String {
    right_adv().id
}

fn pair_central() -> MockCentral {
    MockCentral::with_adverts([unrelated_adv(), left_adv(), esp32_adv(), right_adv()])
}

fn recording(central: &MockCentral) -> (EegBudsService<MockCentral, RecordingSink>, RecordingSink) {
    let sink = RecordingSink::default();
    let service = EegBudsService::new(central.clone(), sink.clone(), BudsConfig::default());
    (service, sink)
}

struct Listened {
    status: Events<ConnectionStatus>,
    errors: Events<String>,
}

fn listen<S: BatchSink>(service: &EegBudsService<MockCentral, S>) -> Listened {
    let status = Events::default();
    let errors = Events::default();
    let s = status.clone();
    service.set_on_connection_status_changed(move |st| s.push(st));
    let e = errors.clone();
    service.set_on_error(move |msg| e.push(msg));
    Listened { status, errors }
}

// ── connect ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_starts_streaming_on_both_sides() {
    let central = pair_central();
    let (service, _sink) = recording(&central);
    let listened = listen(&service);

    service.connect().await.unwrap();

    assert_eq!(service.connection_state(), ConnectionState::Collecting);
    assert!(service.is_data_collection_active());
    assert_eq!(
        service.connection_status(),
        ConnectionStatus {
            is_connected: true,
            left_connected: true,
            right_connected: true,
        }
    );

    let left = central.link(&left_id());
    let right = central.link(&right_id());
    assert_eq!(left.writes(), vec![START_STREAMING.to_vec()]);
    assert_eq!(right.writes(), vec![START_STREAMING.to_vec()]);
    assert_eq!(left.write_targets(), vec![(LEFT_SERVICE_UUID, LEFT_RX_CHARACTERISTIC)]);
    assert_eq!(right.write_targets(), vec![(RIGHT_SERVICE_UUID, RIGHT_RX_CHARACTERISTIC)]);
    assert!(!left.opts.auto_connect);
    assert_eq!(left.discovers(), 1);

    assert_eq!(central.stop_scans(), 1);
    assert!(central.links(&esp32_adv().id).is_empty());
    assert_eq!(listened.status.all(), vec![service.connection_status()]);
    assert_eq!(listened.errors.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_right_bud_fails_after_scan_timeout() {
    let central = MockCentral::with_adverts([left_adv(), unrelated_adv()]);
    let (service, _sink) = recording(&central);
    let listened = listen(&service);

    let started = Instant::now();
    let err = service.connect().await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(30));
    match &err {
        BudsError::DevicesNotFound { missing } => assert_eq!(missing, &vec![Side::Right]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(listened.errors.len(), 1);
    assert!(listened.errors.all()[0].starts_with("Could not find right earbud(s)."));
    assert!(central.links(&left_id()).is_empty());
    assert_eq!(central.stop_scans(), 1);
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn nothing_found_names_both_sides() {
    let central = MockCentral::new();
    let (service, _sink) = recording(&central);

    let err = service.connect().await.unwrap_err();
    assert!(err
        .to_string()
        .starts_with("Could not find left and right earbud(s)."));
}

#[tokio::test(start_paused = true)]
async fn ambiguous_peripheral_is_never_connected() {
    let dual = Advertisement {
        id: "DD:00:00:00:00:01".into(),
        name: None,
        local_name: None,
        services: vec![LEFT_SERVICE_UUID, RIGHT_SERVICE_UUID],
    };
    let central = MockCentral::with_adverts([dual.clone(), left_adv(), right_adv()]);
    let (service, _sink) = recording(&central);

    service.connect().await.unwrap();
    assert!(central.links(&dual.id).is_empty());
    assert!(central.link(&left_id()).is_connected());
}

#[tokio::test(start_paused = true)]
async fn one_side_failing_to_connect_releases_the_other() {
    let central = pair_central();
    central.fail_connect(&right_id());
    let (service, _sink) = recording(&central);
    let listened = listen(&service);

    assert!(service.connect().await.is_err());

    let left = central.link(&left_id());
    assert!(!left.is_connected());
    assert!(left.writes().is_empty());
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert_eq!(service.connection_status(), ConnectionStatus::default());
    assert_eq!(listened.errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_releases_the_other_side() {
    let central = pair_central();
    central.hang_connect(&left_id());
    let (service, _sink) = recording(&central);

    let started = Instant::now();
    let err = service.connect().await.unwrap_err();

    assert!(matches!(err, BudsError::Timeout { .. }), "{err}");
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(!central.link(&right_id()).is_connected());
    assert_eq!(service.connection_status(), ConnectionStatus::default());
}

#[tokio::test(start_paused = true)]
async fn discovery_failure_closes_both_links() {
    let central = pair_central();
    central.fail_discover(&left_id());
    let (service, _sink) = recording(&central);

    assert!(service.connect().await.is_err());
    assert!(!central.link(&left_id()).is_connected());
    assert!(!central.link(&right_id()).is_connected());
}

#[tokio::test(start_paused = true)]
async fn reconnect_replaces_the_previous_pair() {
    let central = pair_central();
    let (service, _sink) = recording(&central);

    service.connect().await.unwrap();
    service.connect().await.unwrap();

    let lefts = central.links(&left_id());
    assert_eq!(lefts.len(), 2);
    assert!(!lefts[0].is_connected());
    assert_eq!(lefts[0].writes(), vec![START_STREAMING.to_vec(), STOP_STREAMING.to_vec()]);
    assert!(lefts[1].is_connected());
    assert!(service.is_data_collection_active());
}

#[tokio::test(start_paused = true)]
async fn collection_requires_both_sides() {
    let central = pair_central();
    let (service, _sink) = recording(&central);

    let err = service.start_data_collection().await.unwrap_err();
    assert!(matches!(err, BudsError::NotConnected(_)));
    assert_eq!(
        err.to_string(),
        "Both earbuds must be connected to start data collection"
    );
}

#[tokio::test(start_paused = true)]
async fn start_collection_twice_is_a_noop() {
    let central = pair_central();
    let (service, _sink) = recording(&central);
    service.connect().await.unwrap();

    service.start_data_collection().await.unwrap();
    assert_eq!(central.link(&left_id()).writes().len(), 1);
}

// ── batching ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn four_and_four_frames_make_one_batch() {
    let central = pair_central();
    let (service, sink) = recording(&central);
    service.connect().await.unwrap();

    let left = central.link(&left_id());
    let right = central.link(&right_id());
    for i in 0..4 {
        left.notify(frame(i as u8, [i, -i, 100 + i])).await;
        right.notify(frame(200 + i as u8, [1000 + i, -1000 - i, 8_388_607])).await;
    }
    settle().await;
    assert_eq!(service.buffered_samples(), 8);
    assert!(sink.batches().is_empty());

    tokio::time::sleep(WINDOW).await;

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.first_index, 0);
    assert_eq!(batch.duration, WINDOW);
    assert_eq!(batch.len(), 4);
    for (i, rec) in batch.records.iter().enumerate() {
        let i = i as i32;
        assert_eq!(rec.channels, [i, -i, 100 + i, 1000 + i, -1000 - i, 8_388_607]);
        assert_eq!(rec.sequence, i as u8);
    }
    assert_eq!(service.buffered_samples(), 0);

    let payload = serde_json::to_value(batch.to_payload()).unwrap();
    assert_eq!(payload["duration"], "2");
    assert_eq!(payload["records"].as_array().unwrap().len(), 4);
    assert_eq!(payload["records"][3]["eeg"].as_array().unwrap().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn batches_follow_the_window_and_keep_counting() {
    let central = pair_central();
    let (service, sink) = recording(&central);
    service.connect().await.unwrap();
    let left = central.link(&left_id());
    let right = central.link(&right_id());

    // Window 1: five left, three right.
    for i in 0..5 {
        left.notify(frame(i, [1, 2, 3])).await;
    }
    for i in 0..3 {
        right.notify(frame(i, [4, 5, 6])).await;
    }
    tokio::time::sleep(WINDOW - Duration::from_millis(100)).await;
    assert!(sink.batches().is_empty(), "no flush before the window ends");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.batches().len(), 1);
    assert_eq!(sink.batches()[0].len(), 3);

    // Window 2: nothing arrives, nothing is sent.
    tokio::time::sleep(WINDOW).await;
    assert_eq!(sink.batches().len(), 1);

    // Window 3: the excess left samples of window 1 were not carried over.
    left.notify(frame(9, [7, 8, 9])).await;
    right.notify(frame(9, [1, 1, 1])).await;
    tokio::time::sleep(WINDOW).await;

    let batches = sink.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].first_index, 3);
    assert_eq!(batches[1].records[0].channels, [7, 8, 9, 1, 1, 1]);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_single_sided_data_is_not_sent() {
    let central = pair_central();
    let (service, sink) = recording(&central);
    service.connect().await.unwrap();
    let left = central.link(&left_id());

    left.notify(vec![0xA0, 0x01, 0x02]).await;
    let mut bad_end = frame(1, [1, 2, 3]);
    bad_end[14] = 0x00;
    left.notify(bad_end).await;
    left.notify(frame(2, [1, 2, 3])).await;
    settle().await;
    assert_eq!(service.buffered_samples(), 1);

    tokio::time::sleep(WINDOW).await;
    assert!(sink.batches().is_empty());
    assert_eq!(service.buffered_samples(), 0);
    assert!(service.is_data_collection_active());
}

#[tokio::test(start_paused = true)]
async fn failing_backend_drops_batches_and_keeps_collecting() {
    let central = pair_central();
    let sink = FailingSink::default();
    let service = EegBudsService::new(central.clone(), sink.clone(), BudsConfig::default());
    service.connect().await.unwrap();
    let left = central.link(&left_id());
    let right = central.link(&right_id());
    // Stay clear of the flush instants.
    settle().await;

    for round in 0..3u8 {
        left.notify(frame(round, [1, 2, 3])).await;
        right.notify(frame(round, [4, 5, 6])).await;
        tokio::time::sleep(WINDOW).await;
    }

    assert_eq!(sink.calls(), 3);
    assert!(service.is_data_collection_active());
    assert_eq!(service.buffered_samples(), 0);
}

// ── teardown ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let central = pair_central();
    let (service, sink) = recording(&central);
    let listened = listen(&service);

    // Nothing active yet.
    service.disconnect().await.unwrap();
    assert_eq!(listened.status.len(), 0);

    service.connect().await.unwrap();
    service.disconnect().await.unwrap();
    service.disconnect().await.unwrap();

    for id in [left_id(), right_id()] {
        let link = central.link(&id);
        assert!(!link.is_connected());
        assert_eq!(link.writes(), vec![START_STREAMING.to_vec(), STOP_STREAMING.to_vec()]);
    }
    let statuses = listened.status.all();
    assert_eq!(statuses.len(), 2);
    assert!(statuses[0].is_connected);
    assert_eq!(statuses[1], ConnectionStatus::default());
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);

    // The batching loop is gone.
    tokio::time::sleep(WINDOW * 3).await;
    assert!(sink.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn losing_one_bud_tears_down_the_pair() {
    let central = pair_central();
    let (service, sink) = recording(&central);
    let listened = listen(&service);
    service.connect().await.unwrap();

    let right = central.link(&right_id());
    right.notify(frame(0, [1, 2, 3])).await;
    central.link(&left_id()).drop_link();
    settle().await;

    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert!(!right.is_connected());
    assert_eq!(right.writes().last(), Some(&STOP_STREAMING.to_vec()));
    assert_eq!(listened.errors.all(), vec!["left earbud disconnected".to_string()]);
    assert_eq!(listened.status.all().last(), Some(&ConnectionStatus::default()));

    tokio::time::sleep(WINDOW * 2).await;
    assert!(sink.batches().is_empty());

    // A later disconnect has nothing left to do.
    service.disconnect().await.unwrap();
    assert_eq!(listened.status.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn adapter_power_off_tears_down_the_pair() {
    let central = pair_central();
    let (service, _sink) = recording(&central);
    service.connect().await.unwrap();

    central.power_off().await;
    settle().await;

    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert!(!central.link(&left_id()).is_connected());
    assert!(!central.link(&right_id()).is_connected());
}

#[tokio::test(start_paused = true)]
async fn clones_drive_the_same_pair() {
    let central = pair_central();
    let (service, _sink) = recording(&central);
    let other = service.clone();

    service.connect().await.unwrap();
    assert!(other.is_data_collection_active());
    other.disconnect().await.unwrap();
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    // Notify characteristic is subscribed, not written.
    assert!(central
        .link(&left_id())
        .write_targets()
        .iter()
        .all(|(_, c)| *c != LEFT_TX_CHARACTERISTIC));
}

#[tokio::test(start_paused = true)]
async fn raw_commands_reach_both_buds() {
    let central = pair_central();
    let (service, _sink) = recording(&central);

    assert!(matches!(
        service.send_command(b"v\r").await,
        Err(BudsError::NotConnected(_))
    ));

    service.connect().await.unwrap();
    service.send_command(&encode_command('v')).await.unwrap();
    for id in [left_id(), right_id()] {
        assert_eq!(
            central.link(&id).writes(),
            vec![START_STREAMING.to_vec(), b"v\r".to_vec()]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_connect_releases_opened_links() {
    let central = pair_central();
    central.slow_discover(&left_id(), Duration::from_secs(5));
    let (service, _sink) = recording(&central);

    let attempt = tokio::time::timeout(Duration::from_secs(1), service.connect()).await;
    assert!(attempt.is_err());
    settle().await;

    let left = central.link(&left_id());
    let right = central.link(&right_id());
    assert!(!left.is_connected());
    assert!(!right.is_connected());
    assert!(right.writes().is_empty());

    service.disconnect().await.unwrap();
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert!(!service.connection_status().is_connected);
}
