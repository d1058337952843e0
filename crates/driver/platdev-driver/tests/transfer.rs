//! Interrupt-driven DMA transfers through a probed device.

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::*;
use crossbeam_channel::bounded;
use platdev_core::event::EventKind;
use platdev_core::sync::WaitOutcome;
use platdev_dma::DmaDirection;
use platdev_irq::RaiseOutcome;

#[test]
fn received_frame_is_visible_after_unmap() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    let nic = board.nic(id);
    let dma = board.manager.dma();

    let segments = [nic.rx.slice(0, 1024).unwrap(), nic.rx.slice(1024, 1024).unwrap()];
    let list = dma.map_sg(&segments, DmaDirection::FromDevice).unwrap();
    let dev = list.device_addrs();

    // The CPU peeks before the device has written anything.
    let mut frame = [0u8; 9];
    nic.rx.read(0, &mut frame).unwrap();

    dma.device_port().write(dev[0], b"frame-one").unwrap();
    board.sim.registers(NIC_BASE).unwrap().poke32(0, 1);
    assert_eq!(board.manager.irq().raise(NIC_LINE), RaiseOutcome::Claimed);
    assert_eq!(dma.wait(&nic.done, SECOND), WaitOutcome::Completed);

    nic.rx.read(0, &mut frame).unwrap();
    assert_eq!(frame, [0; 9], "cached line hides the device write");

    dma.unmap_sg(list, DmaDirection::FromDevice).unwrap();
    nic.rx.read(0, &mut frame).unwrap();
    assert_eq!(&frame, b"frame-one");
    assert_eq!(dma.active_mappings(), 0);
}

#[test]
fn one_shot_line_stays_masked_while_deferred_runs() {
    let (entered_tx, entered) = bounded(4);
    let (release, release_rx) = bounded(4);
    let board = boot_with(
        sim(),
        Some(Gate {
            entered: entered_tx,
            release: release_rx,
        }),
    );
    let id = board.manager.probe_node(NIC0).unwrap();
    let nic = board.nic(id);
    let regs = board.sim.registers(NIC_BASE).unwrap();
    let irq = board.manager.irq();

    regs.poke32(0, 1);
    assert_eq!(irq.raise(NIC_LINE), RaiseOutcome::Claimed);
    entered.recv_timeout(SECOND).unwrap();

    regs.poke32(0, 1);
    assert_eq!(irq.raise(NIC_LINE), RaiseOutcome::Latched);
    assert!(irq.is_masked(NIC_LINE));
    assert_eq!(nic.immediate_calls.load(Ordering::SeqCst), 1);

    // Returning from the deferred handler unmasks the line and delivers the
    // latched interrupt, which wakes the handler again.
    release.send(()).unwrap();
    entered.recv_timeout(SECOND).unwrap();
    assert_eq!(nic.immediate_calls.load(Ordering::SeqCst), 2);
    release.send(()).unwrap();

    assert!(wait_until(SECOND, || {
        nic.deferred_events.load(Ordering::SeqCst) == 2 && !irq.is_masked(NIC_LINE)
    }));
}

#[test]
fn lost_interrupt_times_out() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();
    let nic = board.nic(id);

    let start = Instant::now();
    let outcome = board.manager.dma().wait(&nic.done, Duration::from_millis(50));
    let elapsed = start.elapsed();

    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(60), "took {elapsed:?}");
}

#[test]
fn spurious_interrupt_is_reported_against_the_device() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();

    assert_eq!(board.manager.irq().raise(NIC_LINE), RaiseOutcome::Unclaimed);
    let unclaimed: Vec<_> = board
        .events
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::UnclaimedInterrupt)
        .collect();
    assert_eq!(unclaimed.len(), 1);
    assert_eq!(unclaimed[0].device, Some(id));
}
