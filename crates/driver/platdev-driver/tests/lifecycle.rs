//! Suspend, resume, and removal of bound devices.

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::*;
use platdev_bind::PlatformCall;
use platdev_core::sync::WaitOutcome;
use platdev_driver::{DeviceManager, DeviceState, LifecycleError, ProbeError};
use platdev_irq::RaiseOutcome;

#[test]
fn manager_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<DeviceManager>();
}

#[test]
fn suspend_quiesces_then_powers_down() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    let nic = board.nic(id);

    let start = Instant::now();
    board.manager.suspend(id).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));

    assert_eq!(board.manager.state(id), DeviceState::Suspended);
    assert_eq!(nic.done.try_wait(), Some(WaitOutcome::Cancelled));
    assert!(!board.sim.clock_enabled("core"));
    assert!(!board.sim.regulator_enabled("vdd-nic"));
    assert_eq!(board.manager.irq().raise(NIC_LINE), RaiseOutcome::Latched);
    assert_eq!(nic.immediate_calls.load(Ordering::SeqCst), 0);
    let regs = board.sim.registers(NIC_BASE).unwrap();
    assert_eq!(&regs.snapshot()[4..8], &0u32.to_le_bytes());
}

#[test]
fn resume_restores_power_before_interrupts() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    let nic = board.nic(id);
    nic.done.complete();
    board.manager.suspend(id).unwrap();

    // A frame arrives while asleep.
    board.sim.registers(NIC_BASE).unwrap().poke32(0, 1);
    assert_eq!(board.manager.irq().raise(NIC_LINE), RaiseOutcome::Latched);
    assert_eq!(nic.immediate_calls.load(Ordering::SeqCst), 0);

    nic.done.reinit();
    board.manager.resume(id).unwrap();

    assert_eq!(board.manager.state(id), DeviceState::Active);
    assert!(board.sim.clock_enabled("core"));
    assert!(board.sim.regulator_enabled("vdd-nic"));
    assert_eq!(nic.immediate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(board.manager.dma().wait(&nic.done, SECOND), WaitOutcome::Completed);
    assert_eq!(board.log(), ["probe dev1", "suspend", "resume"]);
}

#[test]
fn suspend_and_resume_reject_wrong_states() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    board.nic(id).done.complete();

    assert!(matches!(
        board.manager.resume(id),
        Err(LifecycleError::InvalidState {
            state: DeviceState::Active,
            operation: "resume",
            ..
        })
    ));
    board.manager.suspend(id).unwrap();
    assert!(matches!(
        board.manager.suspend(id),
        Err(LifecycleError::InvalidState {
            state: DeviceState::Suspended,
            ..
        })
    ));
}

#[test]
fn remove_unregisters_before_hook_and_releases_after() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    let nic = board.nic(id);

    assert!(board.manager.remove(id));
    assert_eq!(
        board.log(),
        ["probe dev1", "remove live=true", "drop live=false"]
    );
    assert_eq!(board.manager.irq().holders(NIC_LINE), 0);
    assert_eq!(nic.done.try_wait(), Some(WaitOutcome::Cancelled));
    assert_eq!(board.sim.mapped_windows(), 0);
    assert!(!board.sim.clock_enabled("core"));
    assert_eq!(board.sim.irq_trigger(NIC_LINE), None);

    assert!(!board.manager.remove(id));
    assert_eq!(board.manager.state(id), DeviceState::Unbound);
}

#[test]
fn removed_node_can_be_probed_again() {
    let board = boot();
    let first = board.manager.probe_node(NIC0).unwrap();
    board.manager.remove(first);

    let second = board.manager.probe_node(NIC0).unwrap();
    assert_ne!(first, second);
    assert_eq!(board.manager.state(second), DeviceState::Active);
}

#[test]
fn shutdown_removes_newest_first() {
    let board = boot();
    board.manager.probe_node(NIC1).unwrap();
    board.manager.probe_node(SENSOR).unwrap();
    board.sim.clear_calls();

    assert_eq!(board.manager.shutdown(), 2);
    let unmaps: Vec<u64> = board
        .sim
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            PlatformCall::UnmapMmio { base } => Some(base),
            _ => None,
        })
        .collect();
    assert_eq!(unmaps, [0x3_0000, 0x1_0800]);
    assert!(board.manager.devices().is_empty());
}

#[test]
fn unregistering_the_driver_unbinds_its_devices() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();

    assert_eq!(board.manager.unregister_driver("acme-nic"), 1);
    assert_eq!(board.manager.state(id), DeviceState::Unbound);
    assert!(matches!(
        board.manager.probe_node(NIC0),
        Err(LifecycleError::Probe {
            error: ProbeError::Directory(_),
            ..
        })
    ));
}

#[test]
fn concurrent_suspend_and_remove_serialize() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    board.nic(id).done.complete();

    let suspended = std::thread::scope(|s| {
        let suspend = s.spawn(|| board.manager.suspend(id));
        let removed = s.spawn(|| board.manager.remove(id));
        assert!(removed.join().unwrap());
        suspend.join().unwrap()
    });

    match suspended {
        Ok(()) | Err(LifecycleError::UnknownDevice(_) | LifecycleError::InvalidState { .. }) => {}
        Err(other) => panic!("unexpected suspend error: {other}"),
    }
    assert_eq!(board.manager.state(id), DeviceState::Unbound);
    assert_eq!(board.manager.irq().holders(NIC_LINE), 0);
    assert!(!board.sim.clock_enabled("core"));
}
