//! Board fixture shared by the integration tests.
//!
//! The board is described as a hardware tree and holds:
//!
//! - `nic@10000`: a DMA network controller on interrupt line 9 (level),
//!   compatible with `acme,nic-v2` and the `acme,nic` fallback, with a core
//!   clock and a supply.
//! - `nic@10800`: a second controller whose register window overlaps the
//!   first.
//! - `uart@20000`: disabled.
//! - `sensor@30000`: wants line 9 edge-triggered, which the first NIC
//!   already holds level-triggered.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use platdev_bind::{MmioWindow, SimPlatform};
use platdev_core::config::Config;
use platdev_core::event::RecordingSink;
use platdev_core::id::DeviceId;
use platdev_core::sync::CompletionSignal;
use platdev_devtree::{DeviceTree, HardwareNode};
use platdev_dma::StreamingBuffer;
use platdev_driver::{DeviceManager, DeviceOps, Driver, DriverDescriptor, ProbeContext, ProbeError};
use platdev_irq::{IrqPolicy, IrqReturn, Threading};

pub const NIC0: &str = "/nic@10000";
pub const NIC1: &str = "/nic@10800";
pub const UART: &str = "/uart@20000";
pub const SENSOR: &str = "/sensor@30000";

pub const NIC_LINE: u32 = 9;
pub const NIC_BASE: u64 = 0x1_0000;

/// Status register; bit 0 is "receive done", write zero to acknowledge.
pub const REG_STATUS: u64 = 0x0;
/// Control register; bit 0 enables the receiver.
pub const REG_CTRL: u64 = 0x4;
pub const CTRL_ENABLE: u32 = 1;

pub const RX_LEN: u64 = 2048;

pub const SECOND: Duration = Duration::from_secs(1);

/// Polls `done` until it holds or `deadline` passes.
pub fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn board() -> HardwareNode {
    HardwareNode::builder("")
        .property("model", "acme,board")
        .property("#address-cells", 1u32)
        .property("#size-cells", 1u32)
        .property("interrupt-parent", 1u32)
        .child(
            HardwareNode::builder("intc@f000")
                .property("phandle", 1u32)
                .property("#interrupt-cells", 2u32)
                .flag("interrupt-controller")
                .build(),
        )
        .child(
            HardwareNode::builder("vreg")
                .property("phandle", 2u32)
                .property("regulator-name", "vdd-nic")
                .build(),
        )
        .child(
            HardwareNode::builder("nic@10000")
                .compatible(["acme,nic-v2", "acme,nic"])
                .property("reg", vec![0x1_0000u32, 0x1000])
                .property("interrupts", vec![NIC_LINE, 4])
                .property("clock-names", "core")
                .property("assigned-clock-rates", 125_000_000u32)
                .property("vdd-supply", 2u32)
                .build(),
        )
        .child(
            HardwareNode::builder("nic@10800")
                .compatible(["acme,nic"])
                .property("reg", vec![0x1_0800u32, 0x1000])
                .property("interrupts", vec![10u32, 4])
                .build(),
        )
        .child(
            HardwareNode::builder("uart@20000")
                .compatible(["ns16550a"])
                .property("reg", vec![0x2_0000u32, 0x100])
                .property("status", "disabled")
                .build(),
        )
        .child(
            HardwareNode::builder("sensor@30000")
                .compatible(["acme,sensor"])
                .property("reg", vec![0x3_0000u32, 0x100])
                .property("interrupts", vec![NIC_LINE, 1])
                .build(),
        )
        .build()
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.lifecycle.quiesce_timeout_ms = 30;
    config
}

// ---- NIC driver -------------------------------------------------------------

/// Lets a test hold a deferred handler in place.
#[derive(Clone)]
pub struct Gate {
    pub entered: Sender<()>,
    pub release: Receiver<()>,
}

/// State a probed NIC shares with the test driving it.
pub struct Nic {
    pub device: DeviceId,
    pub regs: MmioWindow,
    pub rx: StreamingBuffer,
    pub done: Arc<CompletionSignal>,
    pub immediate_calls: AtomicUsize,
    pub deferred_events: AtomicUsize,
    pub warnings: usize,
    gate: Option<Gate>,
}

impl Nic {
    fn immediate(&self) -> IrqReturn {
        self.immediate_calls.fetch_add(1, Ordering::SeqCst);
        match self.regs.read32(REG_STATUS) {
            Ok(status) if status & 1 != 0 => {
                let _ = self.regs.write32(REG_STATUS, 0);
                IrqReturn::WakeDeferred
            }
            _ => IrqReturn::NotMine,
        }
    }

    fn deferred(&self, count: u32) {
        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        self.deferred_events
            .fetch_add(count as usize, Ordering::SeqCst);
        self.done.complete();
    }
}

pub struct NicDriver {
    pub nics: Arc<Mutex<Vec<Arc<Nic>>>>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub gate: Option<Gate>,
}

struct NicOps {
    nic: Arc<Nic>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Driver for NicDriver {
    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<Box<dyn DeviceOps>, ProbeError> {
        let regs = ctx.mmio(0)?;
        regs.write32(REG_CTRL, CTRL_ENABLE)
            .map_err(|e| ProbeError::Driver(e.to_string()))?;
        let rx = ctx.dma().alloc_streaming(RX_LEN)?;
        let nic = Arc::new(Nic {
            device: ctx.device(),
            regs,
            rx,
            done: ctx.completion(),
            immediate_calls: AtomicUsize::new(0),
            deferred_events: AtomicUsize::new(0),
            warnings: ctx.warnings().len(),
            gate: self.gate.clone(),
        });

        let top = Arc::clone(&nic);
        let bottom = Arc::clone(&nic);
        ctx.request_irq(
            0,
            Arc::new(move || top.immediate()),
            Some(Arc::new(move |count| bottom.deferred(count))),
            IrqPolicy::shared().threading(Threading::OneShot),
        )?;

        self.nics.lock().push(Arc::clone(&nic));
        self.log.lock().push(format!("probe {}", nic.device));
        Ok(Box::new(NicOps {
            nic,
            log: Arc::clone(&self.log),
        }))
    }
}

impl DeviceOps for NicOps {
    fn suspend(&mut self) -> Result<(), ProbeError> {
        self.log.lock().push("suspend".into());
        self.nic
            .regs
            .write32(REG_CTRL, 0)
            .map_err(|e| ProbeError::Driver(e.to_string()))
    }

    fn resume(&mut self) -> Result<(), ProbeError> {
        self.log.lock().push("resume".into());
        self.nic
            .regs
            .write32(REG_CTRL, CTRL_ENABLE)
            .map_err(|e| ProbeError::Driver(e.to_string()))
    }

    fn remove(&mut self) {
        self.log
            .lock()
            .push(format!("remove live={}", self.nic.regs.is_live()));
    }
}

impl Drop for NicOps {
    fn drop(&mut self) {
        self.log
            .lock()
            .push(format!("drop live={}", self.nic.regs.is_live()));
    }
}

// ---- Sensor driver ----------------------------------------------------------

pub struct SensorDriver;

struct Sensor;

impl DeviceOps for Sensor {}

impl Driver for SensorDriver {
    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<Box<dyn DeviceOps>, ProbeError> {
        ctx.mmio(0)?;
        Ok(Box::new(Sensor))
    }
}

// ---- Boot -------------------------------------------------------------------

pub struct Board {
    pub sim: Arc<SimPlatform>,
    pub events: Arc<RecordingSink>,
    pub manager: DeviceManager,
    pub nics: Arc<Mutex<Vec<Arc<Nic>>>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Board {
    /// The shared state of the NIC bound as `device`.
    pub fn nic(&self, device: DeviceId) -> Arc<Nic> {
        self.nics
            .lock()
            .iter()
            .find(|n| n.device == device)
            .cloned()
            .expect("no such nic")
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub fn sim() -> SimPlatform {
    SimPlatform::builder()
        .clock("core", 100_000_000)
        .regulator("vdd-nic", 1_800_000)
        .build()
}

pub fn boot() -> Board {
    boot_with(sim(), None)
}

pub fn boot_with(sim: SimPlatform, gate: Option<Gate>) -> Board {
    init_logging();
    let sim = Arc::new(sim);
    let events = Arc::new(RecordingSink::new());
    let tree = DeviceTree::from_root(board());
    let manager = DeviceManager::new(tree, sim.clone(), &config(), events.clone())
        .expect("board boots");

    let nics = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_driver(DriverDescriptor::new(
            "acme-nic",
            &["acme,nic"],
            NicDriver {
                nics: Arc::clone(&nics),
                log: Arc::clone(&log),
                gate,
            },
        ))
        .expect("nic driver registers");
    manager
        .register_driver(DriverDescriptor::new(
            "acme-sensor",
            &["acme,sensor"],
            SensorDriver,
        ))
        .expect("sensor driver registers");

    Board {
        sim,
        events,
        manager,
        nics,
        log,
    }
}
