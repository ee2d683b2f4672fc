//! Transparent USB man-in-the-middle proxy.
//!
//! Presents a raw-gadget-backed virtual device to the host while
//! forwarding traffic to a real peripheral over `rusb`, applying a
//! declarative injection rule set to control and data transfers along
//! the way. See [`run`] for the single process entry point.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;

pub mod control;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod gadget;
pub mod pipeline;
pub mod proto;
pub mod queue;
pub mod rules;

pub use error::{ProxyError, Result};

use control::Ep0StateMachine;
use device::{DevicePort, UsbDevice};
use gadget::{GadgetPort, RawGadget, Speed};
use queue::Shutdown;
use rules::{CompiledRules, RawRuleSet};

/// Resolved process parameters, built by `main.rs` from CLI flags.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub driver_name: String,
    pub device_name: String,
    pub rule_file: Option<String>,
    pub ep0_floor: u8,
    pub queue_capacity: usize,
    pub grace_window: Duration,
    pub open_deadline: Duration,
}

impl ProxyConfig {
    pub fn new(vendor_id: u16, product_id: u16, driver_name: String, device_name: String) -> Self {
        ProxyConfig {
            vendor_id,
            product_id,
            driver_name,
            device_name,
            rule_file: None,
            ep0_floor: 64,
            queue_capacity: queue::default_capacity(),
            grace_window: Duration::from_millis(500),
            open_deadline: Duration::from_secs(5),
        }
    }
}

/// Reads and compiles an injection rule file (spec §6).
pub fn load_rule_set(path: &str) -> Result<CompiledRules> {
    let text = fs::read_to_string(path)?;
    let raw: RawRuleSet = serde_json::from_str(&text)?;
    CompiledRules::compile(raw)
}

/// Opens the real device, initializes the host-facing gadget, and runs
/// the EP0 state machine until shutdown or a fatal error. Blocks the
/// calling thread.
pub fn run(config: ProxyConfig) -> Result<()> {
    let rules = match &config.rule_file {
        Some(path) => load_rule_set(path)?,
        None => CompiledRules::empty(),
    };

    info!("opening device {:04x}:{:04x}", config.vendor_id, config.product_id);
    let device: Arc<dyn DevicePort> = Arc::new(UsbDevice::open(
        config.vendor_id,
        config.product_id,
        config.ep0_floor,
        config.open_deadline,
    )?);
    device.claim_interface(0).ok();

    let shutdown = Shutdown::new();
    let poll_timeout = config.grace_window;
    info!("initializing gadget {}/{}", config.driver_name, config.device_name);
    let gadget: Arc<dyn GadgetPort> = Arc::new(RawGadget::init(
        &config.driver_name,
        &config.device_name,
        Speed::High,
        shutdown.clone(),
        poll_timeout,
    )?);

    let watcher = spawn_disconnect_watcher(device.clone(), shutdown.clone(), poll_timeout);

    let machine =
        Ep0StateMachine::new(gadget, device, Arc::new(rules), shutdown.clone(), config.queue_capacity, poll_timeout);
    let result = machine.run();
    shutdown.signal();
    let _ = watcher.join();
    result
}

/// Polls `DevicePort::is_connected` and raises the shared shutdown flag
/// the moment the peripheral vanishes, so C7's event loop unwinds and
/// the process exits cleanly instead of spinning on a dead device
/// (spec §4.7/§7).
fn spawn_disconnect_watcher(
    device: Arc<dyn DevicePort>,
    shutdown: Shutdown,
    poll_interval: Duration,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("disconnect-watcher".into())
        .spawn(move || {
            while !shutdown.is_signaled() {
                if !device.is_connected() {
                    info!("device disconnected, shutting down");
                    shutdown.signal();
                    break;
                }
                thread::sleep(poll_interval);
            }
        })
        .expect("spawn disconnect watcher thread")
}
