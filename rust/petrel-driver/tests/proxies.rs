//! Proxy dispatch semantics across threading modes.

use std::path::Path;

use petrel_driver::{Context, Driver, SystemCounterId, ThreadingMode};

const BUFFER: usize = 64 * 1024;
const QUEUE_CAPACITY: usize = 16;

fn small_context(dir: &Path) -> Context {
    Context::new()
        .dir(dir)
        .cmd_queue_capacity(QUEUE_CAPACITY)
        .to_driver_buffer_length(BUFFER)
        .to_clients_buffer_length(BUFFER)
        .counters_values_buffer_length(BUFFER)
        .error_buffer_length(BUFFER)
        .loss_report_buffer_length(BUFFER)
}

/// P4: with no consumer draining, a queue accepts exactly its capacity and
/// then each failed offer bumps exactly the matching fail counter by one.
#[test]
fn queue_capacity_then_fail_counters() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = small_context(&tmp.path().join("petrel"))
        .threading_mode(ThreadingMode::Dedicated)
        .conclude()
        .unwrap();

    let counters = ctx.system_counters().clone();

    for i in 0..QUEUE_CAPACITY as u64 {
        ctx.sender_proxy().new_publication(i);
        ctx.receiver_proxy().add_subscription(i, 1);
        ctx.conductor_proxy().record_loss(1, 1, i);
    }
    assert_eq!(counters.get(SystemCounterId::SenderProxyFails).get(), 0);
    assert_eq!(counters.get(SystemCounterId::ReceiverProxyFails).get(), 0);
    assert_eq!(counters.get(SystemCounterId::ConductorProxyFails).get(), 0);
    assert_eq!(ctx.sender_queue().len(), QUEUE_CAPACITY);
    assert_eq!(ctx.receiver_queue().len(), QUEUE_CAPACITY);
    assert_eq!(ctx.conductor_queue().len(), QUEUE_CAPACITY);

    // One failed offer per queue; each touches only its own counter.
    ctx.sender_proxy().new_publication(999);
    assert_eq!(counters.get(SystemCounterId::SenderProxyFails).get(), 1);
    assert_eq!(counters.get(SystemCounterId::ReceiverProxyFails).get(), 0);
    assert_eq!(counters.get(SystemCounterId::ConductorProxyFails).get(), 0);

    ctx.receiver_proxy().remove_subscription(999);
    assert_eq!(counters.get(SystemCounterId::ReceiverProxyFails).get(), 1);

    ctx.conductor_proxy().release_counter(999);
    assert_eq!(counters.get(SystemCounterId::ConductorProxyFails).get(), 1);

    assert_eq!(counters.get(SystemCounterId::SenderProxyFails).get(), 1);
    assert_eq!(ctx.sender_queue().len(), QUEUE_CAPACITY, "nothing extra queued");
}

/// P5 + S4: in SHARED mode every proxy dispatches inline — queues stay
/// empty, side effects are synchronous, and no fail counter moves.
#[test]
fn shared_mode_dispatches_inline() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = Driver::launch(
        small_context(&tmp.path().join("petrel")).threading_mode(ThreadingMode::Shared),
    )
    .unwrap();

    let ctx = driver.context();

    ctx.sender_proxy().new_publication(42);
    assert_eq!(
        driver.sender().lock().unwrap().publication_count(),
        1,
        "handler side effect visible synchronously"
    );

    ctx.receiver_proxy().add_subscription(43, 7);
    assert_eq!(driver.receiver().lock().unwrap().subscription_count(), 1);

    ctx.conductor_proxy().create_publication_image(1, 7, 99);
    assert_eq!(driver.conductor().lock().unwrap().image_count(), 1);

    assert!(ctx.sender_queue().is_empty(), "inline mode never enqueues");
    assert!(ctx.receiver_queue().is_empty());
    assert!(ctx.conductor_queue().is_empty());

    let counters = ctx.system_counters();
    assert_eq!(counters.get(SystemCounterId::SenderProxyFails).get(), 0);
    assert_eq!(counters.get(SystemCounterId::ReceiverProxyFails).get(), 0);
    assert_eq!(counters.get(SystemCounterId::ConductorProxyFails).get(), 0);

    driver.close();
}

/// In INVOKER mode dispatch is inline as well, and the queues stay empty
/// across invocations.
#[test]
fn invoker_mode_dispatches_inline() {
    let tmp = tempfile::tempdir().unwrap();
    let mut driver = Driver::launch(
        small_context(&tmp.path().join("petrel")).threading_mode(ThreadingMode::Invoker),
    )
    .unwrap();

    driver.context().sender_proxy().new_publication(1);
    driver.context().sender_proxy().new_publication(2);
    assert_eq!(driver.sender().lock().unwrap().publication_count(), 2);
    assert!(driver.context().sender_queue().is_empty());

    driver.shared_agent_invoker().unwrap().invoke();
    assert!(driver.context().sender_queue().is_empty());

    driver.close();
}

/// In DEDICATED mode commands flow through the queues and are consumed by
/// the owning agent's runner.
#[test]
fn dedicated_mode_consumes_from_queues() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = Driver::launch(
        small_context(&tmp.path().join("petrel")).threading_mode(ThreadingMode::Dedicated),
    )
    .unwrap();

    driver.context().sender_proxy().new_publication(5);

    // The sender runner drains its queue and applies the command.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if driver.sender().lock().unwrap().publication_count() == 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "sender never consumed the command"
        );
        std::thread::yield_now();
    }
    assert!(driver.context().sender_queue().is_empty());

    driver.close();
}
