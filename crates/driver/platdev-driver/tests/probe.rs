//! Probing nodes of the board tree.

mod common;

use common::*;
use platdev_bind::{BindError, PlatformCall, ResourceSpec, SimPlatform, TriggerFlags};
use platdev_core::event::EventKind;
use platdev_devtree::DirectoryError;
use platdev_driver::{DeviceState, LifecycleError, ProbeError};

#[test]
fn nic_matches_on_fallback_compatible() {
    let board = boot();
    let id = board.manager.probe_node(NIC0).unwrap();

    let devices = board.manager.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, id);
    assert_eq!(devices[0].driver, "acme-nic");
    assert_eq!(devices[0].state, DeviceState::Active);

    assert_eq!(board.sim.clock_rate("core"), Some(125_000_000));
    assert!(board.sim.clock_enabled("core"));
    assert!(board.sim.regulator_enabled("vdd-nic"));
    assert_eq!(board.sim.irq_trigger(NIC_LINE), Some(TriggerFlags::LEVEL_HIGH));

    let regs = board.sim.registers(NIC_BASE).unwrap();
    assert_eq!(&regs.snapshot()[4..8], &CTRL_ENABLE.to_le_bytes());
}

#[test]
fn overlapping_window_is_refused() {
    let board = boot();
    let first = board.manager.probe_node(NIC0).unwrap();
    let err = board.manager.probe_node(NIC1).unwrap_err();

    assert_eq!(
        err,
        LifecycleError::Probe {
            path: NIC1.into(),
            error: ProbeError::Bind(BindError::ResourceConflict {
                resource: ResourceSpec::MemoryWindow {
                    base: 0x1_0800,
                    length: 0x1000,
                },
                holder: first,
            }),
        }
    );
    assert_eq!(board.events.count(EventKind::ResourceAcquisitionFailed), 1);
    assert_eq!(board.manager.state(first), DeviceState::Active);
    assert_eq!(board.manager.devices().len(), 1);
}

#[test]
fn failed_interrupt_binding_releases_the_window() {
    let board = boot();
    board.manager.probe_node(NIC0).unwrap();
    board.sim.clear_calls();

    let err = board.manager.probe_node(SENSOR).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Probe {
            error: ProbeError::Bind(BindError::ResourceConflict { .. }),
            ..
        }
    ));

    assert_eq!(
        board.sim.calls(),
        vec![
            PlatformCall::MapMmio {
                base: 0x3_0000,
                length: 0x100
            },
            PlatformCall::UnmapMmio { base: 0x3_0000 },
        ]
    );
    assert_eq!(board.sim.mapped_windows(), 1);
    assert!(board.manager.device_at(SENSOR).is_none());
}

#[test]
fn sensor_binds_once_the_nic_is_gone() {
    let board = boot();
    let nic = board.manager.probe_node(NIC0).unwrap();
    assert!(board.manager.probe_node(SENSOR).is_err());

    assert!(board.manager.remove(nic));
    let sensor = board.manager.probe_node(SENSOR).unwrap();
    assert_ne!(sensor, nic);
    assert_eq!(board.sim.irq_trigger(NIC_LINE), Some(TriggerFlags::EDGE_RISING));
}

#[test]
fn missing_clock_is_only_a_warning() {
    let sim = SimPlatform::builder().regulator("vdd-nic", 1_800_000).build();
    let board = boot_with(sim, None);
    let id = board.manager.probe_node(NIC0).unwrap();

    assert_eq!(board.nic(id).warnings, 1);
    assert_eq!(board.events.count(EventKind::OptionalResourceMissing), 1);
    let event = &board.events.events()[0];
    assert_eq!(event.device, Some(id));
}

#[test]
fn probe_all_walks_the_tree_in_order() {
    let board = boot();
    let records = board.manager.probe_all();

    let outcomes: Vec<(&str, bool)> = records
        .iter()
        .map(|r| (r.path.as_str(), r.result.is_ok()))
        .collect();
    assert_eq!(
        outcomes,
        [(NIC0, true), (NIC1, false), (SENSOR, false)]
    );
    assert_eq!(board.manager.devices().len(), 1);
    assert_eq!(
        board.manager.probe_node(UART),
        Err(LifecycleError::NodeDisabled(UART.into()))
    );
}

#[test]
fn unknown_compatible_is_no_matching_driver() {
    let board = boot();
    board.manager.unregister_driver("acme-sensor");
    assert_eq!(
        board.manager.probe_node(SENSOR),
        Err(LifecycleError::Probe {
            path: SENSOR.into(),
            error: ProbeError::Directory(DirectoryError::NoMatchingDriver {
                node: "sensor@30000".into()
            }),
        })
    );
}

#[test]
fn malformed_blob_fails_startup() {
    let dtb = vec![0u8; 64];
    let err = platdev_driver::DeviceManager::from_dtb(
        &dtb,
        std::sync::Arc::new(sim()),
        &config(),
        std::sync::Arc::new(platdev_core::event::NullSink),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Startup(ProbeError::Directory(DirectoryError::Fdt(_)))
    ));
}
