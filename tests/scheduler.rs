mod common;

use std::time::Duration;

use battpoll::message::register::ReadRequest;
use battpoll::{
    DeviceDescriptor, DeviceSession, MemorySink, Pacing, PollScheduler, SchedulerSettings, Section,
};
use common::{register_responder, ConnectBehavior, MockTransport};
use tokio_util::sync::CancellationToken;

fn device(alias: &str) -> DeviceDescriptor {
    DeviceDescriptor::register_map(
        "80:6F:B0:0F:00:01",
        alias,
        255,
        vec![Section::raw(5042, 1, "status")],
    )
}

fn settings(enable_polling: bool, poll_interval: Duration) -> SchedulerSettings {
    SchedulerSettings {
        enable_polling,
        poll_interval,
        ..SchedulerSettings::default()
    }
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        cancel.cancel();
    });
    token
}

#[tokio::test(start_paused = true)]
async fn single_run_reads_each_device_once_then_disconnects() {
    let (first, first_log) = MockTransport::new(register_responder(255, &[]));
    let (second, second_log) = MockTransport::new(register_responder(255, &[]));
    let sessions = vec![
        DeviceSession::new(device("one"), first, Pacing::default()),
        DeviceSession::new(device("two"), second, Pacing::default()),
    ];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        settings(false, Duration::from_secs(5)),
    );

    scheduler.run(CancellationToken::new()).await.unwrap();

    let sink = scheduler.sink();
    assert_eq!(sink.readings.len(), 2);
    assert_eq!(sink.readings[0].device, "one");
    assert_eq!(sink.readings[1].device, "two");
    assert!(sink.errors.is_empty());
    for log in [first_log, second_log] {
        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 1);
        assert_eq!(log.disconnects, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn hanging_connect_aborts_startup_but_disconnects_everyone() {
    let (first, first_log) = MockTransport::new(register_responder(255, &[]));
    let (second, second_log) = MockTransport::new(register_responder(255, &[]));
    let second = second.with_connect(ConnectBehavior::Hang);
    let sessions = vec![
        DeviceSession::new(device("one"), first, Pacing::default()),
        DeviceSession::new(device("two"), second, Pacing::default()),
    ];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        settings(true, Duration::from_secs(5)),
    );

    let outcome = scheduler.run(CancellationToken::new()).await;

    assert!(outcome.is_err());
    assert!(first_log.lock().unwrap().writes.is_empty());
    assert_eq!(first_log.lock().unwrap().disconnects, 1);
    assert_eq!(second_log.lock().unwrap().disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn rounds_start_on_the_configured_period() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let transport = transport.with_response_delay(Duration::from_secs(2));
    let sessions = vec![DeviceSession::new(device("one"), transport, Pacing::default())];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        settings(true, Duration::from_secs(5)),
    );

    scheduler
        .run(cancel_after(Duration::from_secs(11)))
        .await
        .unwrap();

    let log = log.lock().unwrap();
    let starts: Vec<Duration> = log
        .writes
        .iter()
        .map(|(at, _)| *at - log.writes[0].0)
        .collect();
    assert_eq!(
        starts,
        vec![Duration::ZERO, Duration::from_secs(5), Duration::from_secs(10)]
    );
    assert_eq!(scheduler.sink().readings.len(), 2);
    assert_eq!(log.disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_rounds_still_sleep_at_least_one_second() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let transport = transport.with_response_delay(Duration::from_secs(7));
    let sessions = vec![DeviceSession::new(device("one"), transport, Pacing::default())];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        settings(true, Duration::from_secs(5)),
    );

    scheduler
        .run(cancel_after(Duration::from_secs(20)))
        .await
        .unwrap();

    let log = log.lock().unwrap();
    let starts: Vec<Duration> = log
        .writes
        .iter()
        .map(|(at, _)| *at - log.writes[0].0)
        .collect();
    assert_eq!(
        starts,
        vec![Duration::ZERO, Duration::from_secs(8), Duration::from_secs(16)]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_reported_and_retried_next_round() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let transport = transport.with_connect(ConnectBehavior::FailTimes(2));
    let sessions = vec![DeviceSession::new(device("one"), transport, Pacing::default())];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        settings(true, Duration::from_secs(5)),
    );

    scheduler
        .run(cancel_after(Duration::from_secs(7)))
        .await
        .unwrap();

    let sink = scheduler.sink();
    // startup connect and the first round's reconnect fail, the second round reconnects and reads
    assert_eq!(sink.errors.len(), 2);
    assert_eq!(sink.errors[0].0, "one");
    assert_eq!(sink.readings.len(), 1);
    assert_eq!(log.lock().unwrap().connects, 3);
}

#[tokio::test(start_paused = true)]
async fn silent_device_reports_one_error_per_round_and_polling_continues() {
    let (silent, _silent_log) = MockTransport::new(Box::new(|_: &[u8]| Vec::new()));
    let (healthy, _healthy_log) = MockTransport::new(register_responder(255, &[]));
    let sessions = vec![
        DeviceSession::new(device("silent"), silent, Pacing::default()),
        DeviceSession::new(device("healthy"), healthy, Pacing::default()),
    ];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        settings(true, Duration::from_secs(60)),
    );

    // the silent device times out 15 s into each round, rounds start at 0 s and 60 s
    scheduler
        .run(cancel_after(Duration::from_secs(80)))
        .await
        .unwrap();

    let sink = scheduler.sink();
    assert_eq!(sink.errors.len(), 2);
    assert!(sink.errors.iter().all(|(device, _)| device == "silent"));
    assert_eq!(sink.readings.len(), 2);
    assert!(sink.readings.iter().all(|r| r.device == "healthy"));
}

#[tokio::test(start_paused = true)]
async fn read_timeout_abandons_the_cycle_and_next_round_starts_over() {
    let device = DeviceDescriptor::register_map(
        "80:6F:B0:0F:00:01",
        "stuck",
        255,
        vec![Section::raw(5000, 1, "a"), Section::raw(5001, 1, "b")],
    );
    let (transport, log) = MockTransport::new(register_responder(255, &[5001]));
    let sessions = vec![DeviceSession::new(device, transport, Pacing::default())];
    let mut scheduler = PollScheduler::new(
        sessions,
        MemorySink::default(),
        SchedulerSettings {
            enable_polling: true,
            poll_interval: Duration::from_secs(10),
            // shorter than the 15 s request deadline, so the scheduler gives up first
            read_timeout: Duration::from_secs(5),
            ..SchedulerSettings::default()
        },
    );

    scheduler
        .run(cancel_after(Duration::from_secs(17)))
        .await
        .unwrap();

    let sink = scheduler.sink();
    assert!(sink.readings.is_empty());
    assert_eq!(sink.errors.len(), 2);
    assert!(sink
        .errors
        .iter()
        .all(|(device, error)| device == "stuck" && error == "no response within 5s"));

    let log = log.lock().unwrap();
    let requests: Vec<(Duration, u16)> = log
        .writes
        .iter()
        .map(|(at, frame)| {
            (
                *at - log.writes[0].0,
                ReadRequest::parse(frame).unwrap().register,
            )
        })
        .collect();
    assert_eq!(
        requests,
        vec![
            (Duration::ZERO, 5000),
            (Duration::from_millis(500), 5001),
            (Duration::from_secs(10), 5000),
            (Duration::from_millis(10_500), 5001),
        ]
    );
}
