//! Tests for the GC queue, the collection pass and the deferred drain.
//!
//! Stoppers used here never signal real processes; leader liveness comes
//! from a synthetic procfs tree.

mod common;

use common::{CountingStopper, FakeProc, ReferencingStopper};
use machined::{
    GcQueue, Machine, MachineClass, MachineRegistration, MachineState, MachineStopper, Manager,
    ManagerConfig, ProcFs,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

fn counting_manager(config: ManagerConfig) -> (Arc<Manager>, Arc<AtomicUsize>) {
    let stopper = CountingStopper::default();
    let calls = Arc::clone(&stopper.calls);
    (Manager::with_stopper(config, Box::new(stopper)).unwrap(), calls)
}

// =============================================================================
// Queue Tests
// =============================================================================

#[test]
fn test_request_gc_is_idempotent() {
    let proc = FakeProc::new();
    let (m, _) = counting_manager(proc.config());
    let machine = m.register_machine("web").unwrap();

    m.request_gc(&machine);
    m.request_gc(&machine);

    assert_eq!(m.gc_queue_len(), 1);
    assert!(machine.in_gc_queue());
    assert!(m.gc_queued(&machine));
}

#[test]
fn test_queue_pop_clears_flag() {
    let proc = FakeProc::new();
    let (m, _) = counting_manager(proc.config());
    let a = m.register_machine("a").unwrap();
    let b = m.register_machine("b").unwrap();

    let mut queue = GcQueue::new();
    assert!(queue.push(&a));
    assert!(queue.push(&b));
    assert!(!queue.push(&a));

    let head = queue.pop().unwrap();
    assert!(Arc::ptr_eq(&head, &a), "queue is FIFO");
    assert!(!a.in_gc_queue());
    assert!(b.in_gc_queue());
    assert_eq!(queue.len(), 1);
}

// =============================================================================
// Collection Pass Tests
// =============================================================================

#[test]
fn test_opening_machine_survives_without_drop_not_started() {
    let proc = FakeProc::new();
    let (m, calls) = counting_manager(proc.config());
    let machine = m.register_machine("web").unwrap();

    m.request_gc(&machine);
    assert_eq!(m.run_gc(false), 0);
    assert!(m.machine("web").is_some());
    assert!(!machine.in_gc_queue());

    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 1);
    assert!(m.machine("web").is_none());
    assert_eq!(machine.state(), MachineState::Closing);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_live_leader_keeps_machine() {
    let proc = FakeProc::new();
    proc.spawn(4242, 500, "/");
    let (m, calls) = counting_manager(proc.config());
    let machine = m
        .register(MachineRegistration::new("web", MachineClass::Container).with_leader(4242))
        .unwrap();

    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 0);
    assert_eq!(machine.state(), MachineState::Running);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    proc.exit(4242);
    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(m.machine("web").is_none());
    assert!(m.find_machine_for_pid(4242).is_none());
}

#[test]
fn test_referenced_machine_survives() {
    let proc = FakeProc::new();
    let (m, calls) = counting_manager(proc.config());
    let machine = m
        .register(MachineRegistration::new("web", MachineClass::Vm))
        .unwrap();

    let reference = machine.acquire();
    assert_eq!(machine.references(), 1);
    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    drop(reference);
    assert_eq!(machine.references(), 0);
    // Dropping the last reference does not enqueue by itself.
    assert_eq!(m.gc_queue_len(), 0);
    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 1);
}

#[test]
fn test_rereferenced_during_stop_survives() {
    let proc = FakeProc::new();
    let stopper = ReferencingStopper::default();
    let held = Arc::clone(&stopper.held);
    let calls = Arc::clone(&stopper.calls);
    let m = Manager::with_stopper(proc.config(), Box::new(stopper)).unwrap();
    let machine = m
        .register(MachineRegistration::new("web", MachineClass::Vm))
        .unwrap();

    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 0);
    assert!(m.machine("web").is_some());
    assert!(!machine.in_gc_queue());
    assert_eq!(machine.state(), MachineState::Closing);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    held.lock().unwrap().clear();
    m.request_gc(&machine);
    assert_eq!(m.run_gc(true), 1);
    assert!(m.machine("web").is_none());
    // Already Closing, so not stopped twice.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Re-enqueues the machine it is stopping, as an asynchronous stop would.
struct RequeueStopper {
    manager: OnceLock<Weak<Manager>>,
}

impl MachineStopper for RequeueStopper {
    fn stop(&self, _procfs: &ProcFs, machine: &Arc<Machine>) -> machined::Result<()> {
        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            manager.request_gc(machine);
        }
        Ok(())
    }
}

#[test]
fn test_reenqueue_during_stop() {
    let proc = FakeProc::new();
    let stopper = Arc::new(RequeueStopper {
        manager: OnceLock::new(),
    });

    struct Shared(Arc<RequeueStopper>);
    impl MachineStopper for Shared {
        fn stop(&self, procfs: &ProcFs, machine: &Arc<Machine>) -> machined::Result<()> {
            self.0.stop(procfs, machine)
        }
    }

    let m = Manager::with_stopper(proc.config(), Box::new(Shared(Arc::clone(&stopper)))).unwrap();
    let _ = stopper.manager.set(Arc::downgrade(&m));
    let machine = m
        .register(MachineRegistration::new("web", MachineClass::Vm))
        .unwrap();

    m.request_gc(&machine);
    drop(machine);
    assert_eq!(m.run_gc(true), 1);
    assert!(m.machine("web").is_none());
    assert_eq!(m.gc_queue_len(), 0);
}

#[test]
fn test_host_never_collected() {
    let (m, calls) = counting_manager(ManagerConfig::default().with_gc_on_idle(false));
    let host = m.machine(".host").unwrap();
    assert_eq!(host.class(), MachineClass::Host);
    assert_eq!(host.state(), MachineState::Running);

    m.request_gc(&host);
    assert_eq!(m.run_gc(true), 0);
    assert!(m.machine(".host").is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(m.find_machine_for_pid(1).unwrap().name(), ".host");
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_unregister_queues_without_stopping() {
    let proc = FakeProc::new();
    let (m, calls) = counting_manager(proc.config());
    let machine = m
        .register(MachineRegistration::new("web", MachineClass::Vm))
        .unwrap();

    m.unregister("web").unwrap();
    assert_eq!(machine.state(), MachineState::Closing);
    assert!(machine.in_gc_queue());

    assert_eq!(m.run_gc(false), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_terminate_stops_and_queues() {
    let proc = FakeProc::new();
    let (m, calls) = counting_manager(proc.config());
    let machine = m
        .register(MachineRegistration::new("web", MachineClass::Vm))
        .unwrap();

    m.terminate("web").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(machine.state(), MachineState::Closing);
    assert_eq!(m.gc_queue_len(), 1);
    assert_eq!(m.run_gc(false), 1);
}

#[test]
fn test_host_cannot_be_unregistered_or_terminated() {
    let (m, _) = counting_manager(ManagerConfig::default().with_gc_on_idle(false));

    assert!(matches!(
        m.unregister(".host").unwrap_err(),
        machined::Error::NotSupported(_)
    ));
    assert!(matches!(
        m.terminate(".host").unwrap_err(),
        machined::Error::NotSupported(_)
    ));
    assert!(matches!(
        m.terminate("missing").unwrap_err(),
        machined::Error::NoSuchMachine(_)
    ));
}

#[test]
fn test_kill_without_live_leader() {
    let proc = FakeProc::new();
    let (m, _) = counting_manager(proc.config());
    m.register(MachineRegistration::new("web", MachineClass::Vm))
        .unwrap();

    assert!(!m.kill("web", machined::Signal::Term).unwrap());
}

// =============================================================================
// Deferred Drain Tests
// =============================================================================

async fn wait_until_empty(m: &Manager) {
    for _ in 0..100 {
        if m.machine_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_deferred_gc_drains_queue() {
    let proc = FakeProc::new();
    let (m, _) = counting_manager(proc.config().with_gc_on_idle(true));
    let machine = m.register_machine("web").unwrap();

    m.request_gc(&machine);
    drop(machine);
    wait_until_empty(&m).await;

    assert_eq!(m.machine_count(), 0);
    assert_eq!(m.gc_queue_len(), 0);
}

#[tokio::test]
async fn test_deferred_gc_coalesces_requests() {
    let proc = FakeProc::new();
    let (m, calls) = counting_manager(proc.config().with_gc_on_idle(true));
    for name in ["a", "b", "c"] {
        let machine = m.register_machine(name).unwrap();
        m.request_gc(&machine);
    }
    assert_eq!(m.gc_queue_len(), 3);

    wait_until_empty(&m).await;
    assert_eq!(m.machine_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The task stays registered and serves later requests.
    let machine = m.register_machine("d").unwrap();
    m.request_gc(&machine);
    drop(machine);
    wait_until_empty(&m).await;
    assert_eq!(m.machine_count(), 0);
}

#[test]
fn test_request_gc_without_runtime() {
    let proc = FakeProc::new();
    let (m, _) = counting_manager(proc.config().with_gc_on_idle(true));
    let machine = m.register_machine("web").unwrap();

    // Arming fails without a runtime; the entry stays queued.
    m.request_gc(&machine);
    assert_eq!(m.gc_queue_len(), 1);
    assert_eq!(m.run_gc(true), 1);
}
