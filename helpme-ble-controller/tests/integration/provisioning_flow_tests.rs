//! End-to-end provisioning sessions against the fake BLE stack.

use std::sync::Arc;
use std::time::Duration;

use helpme_ble_controller::link::ListenerKind;
use helpme_ble_controller::{ProvisionConfig, ProvisionError, Provisioner, Report, State, StateKind};
use helpme_proto::DeviceIdentity;
use tokio::sync::mpsc;

use crate::fake_backend::{
    ALARM_ID, Call, FakeBackend, FakeRegistry, Journal, Stall, count, position, writes,
};

type TestProvisioner = Provisioner<FakeBackend, FakeRegistry, mpsc::UnboundedSender<Report>>;

fn provisioner(
    backend: &Arc<FakeBackend>,
    status: u16,
) -> (TestProvisioner, mpsc::UnboundedReceiver<Report>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = FakeRegistry::new(status, backend.journal());
    let provisioner = Provisioner::new(backend.clone(), registry, tx, ProvisionConfig::default());
    (provisioner, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Report>) -> Vec<Report> {
    let mut reports = Vec::new();
    while let Ok(report) = rx.try_recv() {
        reports.push(report);
    }
    reports
}

fn alarm_identity() -> DeviceIdentity {
    DeviceIdentity {
        device_type_id: 5,
        mac_address: "aabbccddeeff".to_string(),
    }
}

fn disconnects(journal: &Journal) -> usize {
    count(journal, &Call::Disconnect(ALARM_ID.to_string()))
}

/// Process events until the session reaches `kind`
async fn step_until(provisioner: &mut TestProvisioner, kind: StateKind) {
    while provisioner.state().kind() != kind {
        provisioner.step().await;
    }
}

#[tokio::test(start_paused = true)]
async fn provisions_and_registers_device() {
    let backend = Arc::new(
        FakeBackend::alarm().with_reads(&["5,aa:bb:cc:dd:ee:ff,0", "5,AA:BB:CC:DD:EE:FF,1"], ""),
    );
    let journal = backend.journal();
    let (mut provisioner, mut reports) = provisioner(&backend, 201);

    provisioner.start(" home-net ", " hunter2 ").await.unwrap();
    let summary = provisioner.run().await.unwrap();

    assert_eq!(summary, "device aabbccddeeff (type 5) registered");
    assert_eq!(count(&journal, &Call::Connect(ALARM_ID.to_string())), 1);
    assert_eq!(count(&journal, &Call::Register(alarm_identity())), 1);
    assert_eq!(count(&journal, &Call::EnableNotifications), 1);
    assert_eq!(count(&journal, &Call::Read), 2);
    assert_eq!(
        writes(&journal),
        vec!["setwifi:home-net|hunter2", "getinfo", "getinfo", "getinfo"]
    );

    let reports = drain(&mut reports);
    assert!(reports.contains(&Report::Progress(
        "waiting for device to join the network...".to_string()
    )));
    assert_eq!(reports.last(), Some(&Report::Done(summary)));
}

#[tokio::test(start_paused = true)]
async fn already_registered_device_is_success() {
    let backend = Arc::new(FakeBackend::alarm().with_reads(&[], "5,aabbccddeeff,1"));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 419);

    provisioner.start("home", "secret").await.unwrap();
    let summary = provisioner.run().await.unwrap();

    assert_eq!(summary, "device aabbccddeeff (type 5) was already registered");
    assert_eq!(provisioner.state().kind(), StateKind::Done);
    assert_eq!(disconnects(&journal), 1);
    assert!(position(&journal, &Call::Disconnect(ALARM_ID.to_string())) < position(&journal, &Call::RefreshDevices));
}

#[tokio::test(start_paused = true)]
async fn registration_failure_disconnects_then_refreshes() {
    let backend = Arc::new(FakeBackend::alarm().with_reads(&[], "5,aabbccddeeff,1"));
    let journal = backend.journal();
    let (mut provisioner, mut reports) = provisioner(&backend, 500);

    provisioner.start("home", "secret").await.unwrap();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::RegistrationFailure("http status 500".to_string()));
    assert_eq!(disconnects(&journal), 1);
    let disconnect = position(&journal, &Call::Disconnect(ALARM_ID.to_string())).unwrap();
    let refresh = position(&journal, &Call::RefreshDevices).unwrap();
    assert!(disconnect < refresh);
    assert_eq!(count(&journal, &Call::RefreshDevices), 1);
    assert_eq!(drain(&mut reports).last(), Some(&Report::Failed(err)));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_thirty_polls() {
    let backend = Arc::new(FakeBackend::alarm().with_reads(&[], "5,aabbccddeeff,0"));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let started = tokio::time::Instant::now();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::ResponseTimeout);
    assert_eq!(err.to_string(), "failed to retrieve device info");
    assert_eq!(count(&journal, &Call::Read), 30);
    // one getinfo after the credentials, then one per tick
    assert_eq!(count(&journal, &Call::Write("getinfo".to_string())), 31);
    assert_eq!(disconnects(&journal), 1);
    assert_eq!(count(&journal, &Call::RefreshDevices), 0);
    // settle delays plus thirty 1 s ticks
    assert_eq!(started.elapsed(), Duration::from_millis(500 + 1000 + 30_000));
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn notification_answers_poll() {
    let backend = Arc::new(FakeBackend::alarm().notifying_on_query("7,01:02:03:04:05:06,1"));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let summary = provisioner.run().await.unwrap();

    // the push answering the post-credentials getinfo is ignored; the first tick's push completes it
    assert_eq!(count(&journal, &Call::Read), 1);
    assert_eq!(summary, "device 010203040506 (type 7) registered");
}

#[tokio::test(start_paused = true)]
async fn scan_times_out_without_target() {
    let backend = Arc::new(FakeBackend::alarm().advertising(&[
        ("fake/a", Some("Xiao_Alarm_Config_v2")),
        ("fake/b", Some("xiao_alarm_config")),
        ("fake/c", None),
    ]));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let started = tokio::time::Instant::now();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::DiscoveryTimeout);
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert!(journal.lock().unwrap().iter().all(|c| !matches!(c, Call::Connect(_))));
    assert_eq!(count(&journal, &Call::CloseAdapter), 1);
    assert!(count(&journal, &Call::StopDiscovery) >= 1);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn only_first_match_is_connected() {
    let backend = Arc::new(
        FakeBackend::alarm()
            .advertising(&[
                ("fake/first", Some("Xiao_Alarm_Config")),
                ("fake/second", Some("Xiao_Alarm_Config")),
            ])
            .with_reads(&[], "5,aabbccddeeff,1"),
    );
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    provisioner.run().await.unwrap();

    assert_eq!(count(&journal, &Call::Connect("fake/first".to_string())), 1);
    assert_eq!(count(&journal, &Call::Connect("fake/second".to_string())), 0);
}

#[tokio::test(start_paused = true)]
async fn resumes_when_radio_turns_on() {
    let backend = Arc::new(FakeBackend::alarm().radio_off().with_reads(&[], "5,aabbccddeeff,1"));
    let journal = backend.journal();
    let (mut provisioner, mut reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    provisioner.step().await;
    assert_eq!(provisioner.state().kind(), StateKind::Scanning);
    assert_eq!(backend.live_listeners_of(ListenerKind::AdapterState), 1);
    assert!(drain(&mut reports).contains(&Report::Progress(
        "bluetooth is off, waiting for it to be turned on...".to_string()
    )));

    // nothing happens while the radio stays off, however long we wait
    let idle = tokio::time::timeout(Duration::from_secs(60), provisioner.step()).await;
    assert!(idle.is_err());

    backend.power_on();
    provisioner.run().await.unwrap();
    assert_eq!(count(&journal, &Call::OpenAdapter), 2);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_mid_session_releases_everything() {
    let backend = Arc::new(FakeBackend::alarm().with_reads(&[], "5,aabbccddeeff,0"));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    step_until(&mut provisioner, StateKind::AwaitingDeviceInfo).await;
    assert!(provisioner.listener_count() > 0);

    provisioner.reset().await;

    assert_eq!(provisioner.state(), &State::Idle);
    assert_eq!(provisioner.listener_count(), 0);
    assert_eq!(backend.live_listeners(), 0);
    assert_eq!(disconnects(&journal), 1);
    assert_eq!(count(&journal, &Call::CloseAdapter), 1);

    // poll timer was cancelled
    let reads = count(&journal, &Call::Read);
    let idle = tokio::time::timeout(Duration::from_secs(10), provisioner.step()).await;
    assert!(idle.is_err());
    assert_eq!(count(&journal, &Call::Read), reads);
    assert_eq!(provisioner.run().await, Err(ProvisionError::NotStarted));
}

#[tokio::test(start_paused = true)]
async fn reset_is_idempotent() {
    let backend = Arc::new(FakeBackend::alarm());
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.reset().await;
    provisioner.reset().await;
    assert_eq!(provisioner.state(), &State::Idle);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_start_replaces_first_session() {
    let backend = Arc::new(FakeBackend::alarm().with_reads(&[], "5,aabbccddeeff,1"));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("first", "secret").await.unwrap();
    provisioner.start("second", "secret").await.unwrap();
    assert_eq!(provisioner.epoch(), 2);

    provisioner.run().await.unwrap();

    assert_eq!(count(&journal, &Call::Connect(ALARM_ID.to_string())), 1);
    assert_eq!(count(&journal, &Call::Register(alarm_identity())), 1);
    assert_eq!(writes(&journal)[0], "setwifi:second|secret");
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn blank_credentials_are_rejected() {
    let backend = Arc::new(FakeBackend::alarm());
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    assert!(provisioner.start("   ", "secret").await.is_err());
    assert!(provisioner.start("home", "").await.is_err());
    assert_eq!(provisioner.state(), &State::Idle);
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn credential_write_failure_ends_session() {
    let backend = Arc::new(FakeBackend::alarm().failing_writes("setwifi"));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::WriteFailure("write rejected".to_string()));
    assert_eq!(disconnects(&journal), 1);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn device_without_usable_characteristics_fails() {
    use helpme_ble_controller::{Capabilities, CharacteristicRef};

    let service = crate::fake_backend::VENDOR_SERVICE;
    let backend = Arc::new(FakeBackend::alarm().with_services(vec![(
        service,
        vec![CharacteristicRef {
            service,
            characteristic: crate::fake_backend::RESPONSE_CHAR,
            capabilities: Capabilities { read: true, ..Default::default() },
        }],
    )]));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::CharacteristicDiscoveryFailure);
    assert!(writes(&journal).is_empty());
    assert_eq!(disconnects(&journal), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_reads_do_not_hold_up_poll_ceiling() {
    let backend = Arc::new(FakeBackend::alarm().stalling(Stall::Read));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let started = tokio::time::Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(600), provisioner.run())
        .await
        .expect("session never ended")
        .unwrap_err();

    assert_eq!(err, ProvisionError::ResponseTimeout);
    // thirty ticks, plus at most one operation timeout for the queued reads
    assert!(started.elapsed() >= Duration::from_millis(31_500));
    assert!(started.elapsed() <= Duration::from_millis(41_500));
    assert_eq!(disconnects(&journal), 1);
    assert_eq!(provisioner.listener_count(), 0);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_fails_session() {
    let backend = Arc::new(FakeBackend::alarm().stalling(Stall::Connect));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    let started = tokio::time::Instant::now();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::ConnectFailure("timed out after 10s".to_string()));
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert!(writes(&journal).is_empty());
    assert_eq!(count(&journal, &Call::CloseAdapter), 1);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_registration_still_disconnects_then_refreshes() {
    let backend = Arc::new(FakeBackend::alarm().with_reads(&[], "5,aabbccddeeff,1"));
    let journal = backend.journal();
    let (tx, _reports) = mpsc::unbounded_channel();
    let mut provisioner = Provisioner::new(
        backend.clone(),
        FakeRegistry::unresponsive(backend.journal()),
        tx,
        ProvisionConfig::default(),
    );

    provisioner.start("home", "secret").await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(600), provisioner.run())
        .await
        .expect("session never ended")
        .unwrap_err();

    assert_eq!(err, ProvisionError::RegistrationFailure("timed out after 15s".to_string()));
    assert_eq!(count(&journal, &Call::Register(alarm_identity())), 1);
    assert_eq!(disconnects(&journal), 1);
    let disconnect = position(&journal, &Call::Disconnect(ALARM_ID.to_string())).unwrap();
    let refresh = position(&journal, &Call::RefreshDevices).unwrap();
    assert!(disconnect < refresh);
    assert_eq!(backend.live_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_while_scanning_releases_scan_listener() {
    let backend = Arc::new(FakeBackend::alarm().advertising(&[]));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    provisioner.step().await;
    assert_eq!(provisioner.state().kind(), StateKind::Scanning);
    assert_eq!(backend.live_listeners_of(ListenerKind::DeviceFound), 1);

    provisioner.reset().await;

    assert_eq!(provisioner.state(), &State::Idle);
    assert_eq!(provisioner.listener_count(), 0);
    assert_eq!(backend.live_listeners(), 0);
    assert!(count(&journal, &Call::StopDiscovery) >= 1);
    assert_eq!(count(&journal, &Call::CloseAdapter), 1);

    // scan window was cancelled
    let idle = tokio::time::timeout(Duration::from_secs(30), provisioner.step()).await;
    assert!(idle.is_err());
}

#[tokio::test(start_paused = true)]
async fn reset_while_waiting_for_radio_releases_radio_listener() {
    let backend = Arc::new(FakeBackend::alarm().radio_off());
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    provisioner.step().await;
    assert_eq!(backend.live_listeners_of(ListenerKind::AdapterState), 1);

    provisioner.reset().await;

    assert_eq!(provisioner.state(), &State::Idle);
    assert_eq!(provisioner.listener_count(), 0);
    assert_eq!(backend.live_listeners(), 0);

    backend.power_on();
    let idle = tokio::time::timeout(Duration::from_secs(10), provisioner.step()).await;
    assert!(idle.is_err());
    assert_eq!(count(&journal, &Call::OpenAdapter), 1);
}

#[tokio::test(start_paused = true)]
async fn radio_watch_ends_once_adapter_opens() {
    let backend = Arc::new(FakeBackend::alarm().radio_off().advertising(&[]));
    let journal = backend.journal();
    let (mut provisioner, _reports) = provisioner(&backend, 201);

    provisioner.start("home", "secret").await.unwrap();
    provisioner.step().await;
    backend.power_on();
    provisioner.step().await;
    assert_eq!(backend.live_listeners_of(ListenerKind::AdapterState), 0);
    provisioner.step().await;
    assert_eq!(backend.live_listeners_of(ListenerKind::DeviceFound), 1);

    // a later power event neither reopens the adapter nor restarts the window
    backend.power_on();
    let started = tokio::time::Instant::now();
    let err = provisioner.run().await.unwrap_err();

    assert_eq!(err, ProvisionError::DiscoveryTimeout);
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(count(&journal, &Call::OpenAdapter), 2);
}
