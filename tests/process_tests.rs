//! Tests for process identity, cgroup unit derivation and signals.

mod common;

use common::FakeProc;
use machined::process::{parse_start_time, unit_from_cgroup_path};
use machined::{ProcFs, ProcessHandle, Signal};

// =============================================================================
// Stat Parsing Tests
// =============================================================================

fn stat_line(comm: &str, start_time: u64) -> String {
    let mut fields: Vec<String> = (4..=52).map(|_| "0".to_string()).collect();
    fields[22 - 4] = start_time.to_string();
    format!("1234 ({comm}) S {}", fields.join(" "))
}

#[test]
fn test_parse_start_time() {
    assert_eq!(parse_start_time(&stat_line("bash", 98765)), Some(98765));
}

#[test]
fn test_parse_start_time_with_hostile_comm() {
    // The command name may contain spaces and parentheses.
    assert_eq!(parse_start_time(&stat_line("a) b (c", 42)), Some(42));
}

#[test]
fn test_parse_start_time_truncated() {
    assert_eq!(parse_start_time("1234 (bash) S 1 2 3"), None);
    assert_eq!(parse_start_time("garbage"), None);
}

// =============================================================================
// Cgroup Unit Tests
// =============================================================================

#[test]
fn test_unit_from_scope() {
    assert_eq!(
        unit_from_cgroup_path("/machine.slice/machine-web.scope/payload"),
        Some("machine-web.scope")
    );
}

#[test]
fn test_unit_from_service() {
    assert_eq!(
        unit_from_cgroup_path("/system.slice/systemd-nspawn@db.service"),
        Some("systemd-nspawn@db.service")
    );
}

#[test]
fn test_unit_from_nested_slices() {
    assert_eq!(
        unit_from_cgroup_path("/user.slice/user-1000.slice/session-2.scope"),
        Some("session-2.scope")
    );
}

#[test]
fn test_no_unit_in_slice_or_root() {
    assert_eq!(unit_from_cgroup_path("/"), None);
    assert_eq!(unit_from_cgroup_path("/machine.slice"), None);
    assert_eq!(unit_from_cgroup_path("/init/leaf"), None);
}

// =============================================================================
// ProcFs Tests
// =============================================================================

#[test]
fn test_handle_from_fake_tree() {
    let proc = FakeProc::new();
    proc.spawn(4242, 777, "/machine.slice/machine-web.scope");
    let procfs = ProcFs::new(proc.path());

    let handle = procfs.handle(4242).unwrap();
    assert_eq!(handle, ProcessHandle::new(4242, 777));
    assert!(procfs.is_alive(&handle));
    assert_eq!(handle.to_string(), "4242@777");
}

#[test]
fn test_pid_reuse_is_not_alive() {
    let proc = FakeProc::new();
    proc.spawn(4242, 777, "/");
    let procfs = ProcFs::new(proc.path());
    let original = procfs.handle(4242).unwrap();

    proc.spawn(4242, 900, "/");
    assert!(!procfs.is_alive(&original), "recycled pid must not match");

    proc.exit(4242);
    assert!(!procfs.is_alive(&original));
    assert!(procfs.handle(4242).is_err());
}

#[test]
fn test_unit_of_fake_process() {
    let proc = FakeProc::new();
    proc.spawn(100, 1, "/machine.slice/machine-foo.scope/payload");
    proc.spawn(101, 1, "/");
    let procfs = ProcFs::new(proc.path());

    assert_eq!(
        procfs.unit_of(100).unwrap().as_deref(),
        Some("machine-foo.scope")
    );
    assert_eq!(procfs.unit_of(101).unwrap(), None);
    assert!(procfs.unit_of(102).is_err());
}

#[test]
fn test_net_namespace_identity() {
    let proc = FakeProc::new();
    proc.spawn(10, 1, "/");
    proc.spawn(11, 1, "/");
    proc.shared_netns(10);
    proc.private_netns(11);
    let procfs = ProcFs::new(proc.path());

    assert!(procfs.same_net_namespace(10).unwrap());
    assert!(!procfs.same_net_namespace(11).unwrap());
}

#[test]
fn test_real_self_is_alive() {
    let procfs = ProcFs::default();
    let pid = std::process::id() as i32;

    let handle = procfs.handle(pid).unwrap();
    assert!(procfs.is_alive(&handle));
    assert!(procfs.same_net_namespace(pid).unwrap());
}

#[test]
fn test_signal_to_stale_handle_is_noop() {
    let procfs = ProcFs::default();
    let pid = std::process::id() as i32;
    let real = procfs.handle(pid).unwrap();
    let stale = ProcessHandle::new(pid, real.start_time() + 1);

    // Must not deliver anything to the test process itself.
    assert!(!procfs.signal(&stale, Signal::Term).unwrap());
}

// =============================================================================
// Signal Tests
// =============================================================================

#[test]
fn test_signal_from_str() {
    assert_eq!(Signal::from_str("SIGTERM"), Some(Signal::Term));
    assert_eq!(Signal::from_str("term"), Some(Signal::Term));
    assert_eq!(Signal::from_str("9"), Some(Signal::Kill));
    assert_eq!(Signal::from_str("usr2"), Some(Signal::Usr2));
    assert_eq!(Signal::from_str("SIGBOGUS"), None);
}

#[test]
fn test_signal_numbers_and_display() {
    assert_eq!(Signal::Term.as_i32(), libc::SIGTERM);
    assert_eq!(Signal::Kill.as_i32(), libc::SIGKILL);
    assert_eq!(Signal::Hup.to_string(), "SIGHUP");
    assert_eq!(Signal::from_str(&Signal::Int.to_string()), Some(Signal::Int));
}
