//! End-to-end launch and shutdown scenarios.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use petrel_driver::cnc::{CncFile, CncLengths, CncParams};
use petrel_driver::protocol::{MSG_CLIENT_KEEPALIVE, encode_client_id};
use petrel_driver::{Context, Driver, DriverError, SystemCounterId, ThreadingMode};
use petrel_primitives::counters::VALUE_SLOT_SIZE;
use petrel_primitives::errorlog::DistinctErrorLog;
use petrel_primitives::ringbuffer::MpscRingBuffer;
use petrel_primitives::ManualClock;

const BUFFER: usize = 64 * 1024;

fn small_context(dir: &Path) -> Context {
    Context::new()
        .dir(dir)
        .to_driver_buffer_length(BUFFER)
        .to_clients_buffer_length(BUFFER)
        .counters_values_buffer_length(BUFFER)
        .error_buffer_length(BUFFER)
        .loss_report_buffer_length(BUFFER)
}

fn small_embedded_context() -> Context {
    Context::new()
        .to_driver_buffer_length(BUFFER)
        .to_clients_buffer_length(BUFFER)
        .counters_values_buffer_length(BUFFER)
        .error_buffer_length(BUFFER)
        .loss_report_buffer_length(BUFFER)
}

/// An embedded launch gets a private randomized directory.
#[test]
fn embedded_launch_uses_private_directory() {
    let first = Driver::launch_embedded(small_embedded_context()).unwrap();
    let second = Driver::launch_embedded(small_embedded_context()).unwrap();

    assert_ne!(first.dir(), second.dir());
    assert!(first.dir().is_dir());
    assert!(CncFile::map_existing(first.dir()).unwrap().is_ready());

    let (first_dir, second_dir) = (first.dir().to_path_buf(), second.dir().to_path_buf());
    first.close();
    second.close();
    let _ = std::fs::remove_dir_all(first_dir);
    let _ = std::fs::remove_dir_all(second_dir);
}

/// S1: fresh start in DEDICATED mode.
#[test]
fn fresh_start_dedicated() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("petrel");

    let driver =
        Driver::launch(small_context(&dir).threading_mode(ThreadingMode::Dedicated)).unwrap();

    assert!(dir.is_dir());
    assert_eq!(driver.runner_count(), 3);
    assert_eq!(
        driver
            .context()
            .system_counters()
            .get(SystemCounterId::Errors)
            .get(),
        0
    );

    // A second process discovers the driver by mapping the CnC file: the
    // ready word reads 1 and the header sizes match the file on disk.
    let observer = CncFile::map_existing(&dir).unwrap();
    assert!(observer.is_ready());
    assert_eq!(
        std::fs::metadata(CncFile::path_in(&dir)).unwrap().len() as usize,
        observer.layout().total_length
    );

    driver.close();
    // Post-mortem artifacts stay on disk after a clean shutdown.
    assert!(CncFile::path_in(&dir).is_file());
}

/// S2: a live peer refuses the launch and is left untouched.
#[test]
fn live_peer_refusal() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("petrel");

    let first = Driver::launch(small_context(&dir)).unwrap();

    let result = Driver::launch(small_context(&dir));
    match result {
        Err(DriverError::ActiveDriver { dir: reported }) => assert_eq!(reported, dir),
        Err(other) => panic!("expected ActiveDriver, got {other}"),
        Ok(_) => panic!("expected ActiveDriver, got a second driver"),
    }

    // The losing launch must not have mutated the winner's state.
    assert!(CncFile::path_in(&dir).is_file());
    assert!(
        CncFile::map_existing(&dir).unwrap().is_ready(),
        "winner still discoverable"
    );

    first.close();
}

/// S3: a stale peer's error log is salvaged before the directory is
/// reclaimed.
#[test]
fn stale_peer_salvage() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("petrel");
    std::fs::create_dir_all(&dir).unwrap();

    // A dead driver: ready, but its heartbeat stopped long ago.
    {
        let cnc = CncFile::create(
            &dir,
            &CncParams {
                lengths: CncLengths::from_capacities(BUFFER, BUFFER, 64 * VALUE_SLOT_SIZE, 4096),
                client_liveness_timeout_ns: 5_000_000_000,
                start_timestamp_ms: 1_000,
            },
        )
        .unwrap();
        let ring = unsafe { MpscRingBuffer::init(cnc.to_driver_region(), 0, BUFFER as u32) };
        ring.set_consumer_heartbeat_ms(1_000);

        let log = unsafe { DistinctErrorLog::new(cnc.error_log_region()) };
        assert!(log.record("bind: address in use", 1_100));
        assert!(log.record("invalid destination uri", 1_200));
        cnc.signal_ready();
    }

    let driver = Driver::launch(small_context(&dir).warn_if_directory_exists(true)).unwrap();

    let salvaged: Vec<PathBuf> = std::fs::read_dir(parent.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("petrel-") && name.ends_with("-error.log"))
        })
        .collect();
    assert_eq!(salvaged.len(), 1, "one salvage file in the parent directory");

    let contents = std::fs::read_to_string(&salvaged[0]).unwrap();
    assert!(contents.contains("bind: address in use"));
    assert!(contents.contains("invalid destination uri"));
    assert!(contents.contains("2 distinct errors observed."));

    driver.close();
}

/// S5: an impossible configuration is rejected before anything is created.
#[test]
fn configuration_rejection_leaves_no_files() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("petrel");

    let result = Driver::launch(
        small_context(&dir)
            .max_term_buffer_length(64 * 1024 * 1024)
            .publication_term_buffer_length(128 * 1024 * 1024),
    );

    match result {
        Err(DriverError::Configuration(msg)) => {
            assert!(msg.contains("134217728"));
            assert!(msg.contains("67108864"));
        }
        Err(other) => panic!("expected ConfigurationError, got {other}"),
        Ok(_) => panic!("expected ConfigurationError"),
    }
    assert!(!CncFile::path_in(&dir).exists());
}

/// S6: clean shutdown joins every runner and releases resources; a restart
/// with delete-on-start succeeds immediately.
#[test]
fn clean_shutdown_and_restart() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("petrel");

    let driver = Driver::launch(small_context(&dir)).unwrap();
    driver.close();

    // The heartbeat is still fresh, so only a forced clean may reclaim.
    let restarted = Driver::launch(small_context(&dir).dir_delete_on_start(true)).unwrap();
    restarted.close();
}

/// P3: the live runner count matches the threading-mode table.
#[test]
fn runner_counts_per_threading_mode() {
    let cases = [
        (ThreadingMode::Invoker, 0, true),
        (ThreadingMode::Shared, 1, false),
        (ThreadingMode::SharedNetwork, 2, false),
        (ThreadingMode::Dedicated, 3, false),
    ];

    for (mode, runners, has_invoker) in cases {
        let parent = tempfile::tempdir().unwrap();
        let mut driver =
            Driver::launch(small_context(&parent.path().join("petrel")).threading_mode(mode))
                .unwrap();
        assert_eq!(driver.runner_count(), runners, "{mode:?}");
        assert_eq!(
            driver.shared_agent_invoker().is_some(),
            has_invoker,
            "{mode:?}"
        );
        driver.close();
    }
}

/// Values of all live client-heartbeat counters, read the way a monitoring
/// client would: through the CnC counters regions.
fn client_heartbeat_counters(driver: &Driver) -> Vec<u64> {
    use petrel_primitives::counters::CountersReader;

    let cnc = driver.context().cnc();
    let reader =
        CountersReader::new(cnc.counters_metadata_region(), cnc.counters_values_region())
            .unwrap();

    let mut values = Vec::new();
    reader.for_each(|id, type_id, label| {
        if type_id == petrel_driver::conductor::CLIENT_HEARTBEAT_TYPE_ID {
            assert!(label.starts_with("client-heartbeat:"), "label: {label}");
            values.push(reader.counter_value(id).unwrap());
        }
    });
    values
}

/// Client keepalives and liveness aging, driven deterministically through
/// the INVOKER mode and a manual clock.
#[test]
fn client_liveness_and_teardown() {
    use petrel_driver::protocol::{
        EVT_CLIENT_TIMEOUT, MSG_ADD_PUBLICATION, MSG_ADD_SUBSCRIPTION, encode_add_stream,
    };
    use petrel_primitives::broadcast::BroadcastReceiver;

    let parent = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(10_000, 0));
    let mut driver = Driver::launch(
        small_context(&parent.path().join("petrel"))
            .threading_mode(ThreadingMode::Invoker)
            .client_liveness_timeout_ns(1_000_000_000) // 1s
            .epoch_clock(clock.clone())
            .nano_clock(clock.clone()),
    )
    .unwrap();

    let mut events =
        unsafe { BroadcastReceiver::attach(driver.context().cnc().to_clients_region(), 0) }
            .unwrap();

    // A client announces itself and registers resources.
    let ring = driver.context().to_driver().clone();
    ring.write(MSG_CLIENT_KEEPALIVE, &encode_client_id(7)).unwrap();
    ring.write(MSG_ADD_PUBLICATION, &encode_add_stream(7, 1001)).unwrap();
    ring.write(MSG_ADD_SUBSCRIPTION, &encode_add_stream(7, 1002)).unwrap();

    driver.shared_agent_invoker().unwrap().invoke();

    {
        let conductor = driver.conductor().lock().unwrap();
        assert_eq!(conductor.client_count(), 1);
        assert_eq!(conductor.publication_count(), 1);
        assert_eq!(conductor.subscription_count(), 1);
    }
    // Inline dispatch has already placed the resources with the agents.
    assert_eq!(driver.sender().lock().unwrap().publication_count(), 1);
    assert_eq!(driver.receiver().lock().unwrap().subscription_count(), 1);
    assert_eq!(client_heartbeat_counters(&driver), vec![10_000]);

    // The heartbeat stamp follows the conductor's duty cycle.
    assert_eq!(ring.consumer_heartbeat_ms(), 10_000);

    // Silence from the client past the liveness timeout ages it out.
    clock.advance_ms(1_500);
    driver.shared_agent_invoker().unwrap().invoke();

    {
        let conductor = driver.conductor().lock().unwrap();
        assert_eq!(conductor.client_count(), 0);
        assert_eq!(conductor.publication_count(), 0);
        assert_eq!(conductor.subscription_count(), 0);
    }
    assert_eq!(driver.sender().lock().unwrap().publication_count(), 0);
    assert_eq!(driver.receiver().lock().unwrap().subscription_count(), 0);
    assert!(
        client_heartbeat_counters(&driver).is_empty(),
        "heartbeat counter reclaimed on timeout"
    );

    // The timeout is broadcast to every client.
    let mut timeout_events = Vec::new();
    while events.receive(|msg_type, payload| {
        if msg_type == EVT_CLIENT_TIMEOUT {
            timeout_events.push(petrel_driver::protocol::decode_client_id(payload));
        }
    }) {}
    assert_eq!(timeout_events, vec![Some(7)]);

    driver.close();
}

/// Loss observations reported by the Receiver end up in the loss report.
#[test]
fn loss_reporting_flow() {
    use petrel_driver::LossReportReader;

    let parent = tempfile::tempdir().unwrap();
    let mut driver = Driver::launch(
        small_context(&parent.path().join("petrel")).threading_mode(ThreadingMode::Invoker),
    )
    .unwrap();

    {
        let receiver = driver.receiver().lock().unwrap();
        receiver.on_setup_frame(42, 1001, 555);
        receiver.on_loss_detected(42, 1001, 1_000);
        receiver.on_loss_detected(42, 1001, 500);
    }
    driver.shared_agent_invoker().unwrap().invoke();

    assert_eq!(driver.conductor().lock().unwrap().image_count(), 1);
    assert_eq!(driver.receiver().lock().unwrap().image_count(), 1);

    let loss_path = driver.dir().join(petrel_driver::LOSS_REPORT_FILE_NAME);
    let mapping = petrel_primitives::MmapRegion::attach(&loss_path).unwrap();
    let mut entries = Vec::new();
    LossReportReader::read(mapping.region(), |entry| entries.push(entry));

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].session_id, 42);
    assert_eq!(entries[0].stream_id, 1001);
    assert_eq!(entries[0].observation_count, 2);
    assert_eq!(entries[0].total_bytes_lost, 1_500);

    driver.close();
}
