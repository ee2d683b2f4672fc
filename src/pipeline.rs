//! Endpoint pipeline (C6): one reader thread and one writer thread per
//! active non-control endpoint pair, ferrying transfers between the
//! device port and the gadget port through the bounded queues in
//! `queue.rs`, applying data-rule injection in flight.
//!
//! Threads, not futures: the rest of the engine is built the same way
//! (`ffp` itself is a blocking, thread-per-call CLI tool), and every
//! blocking call here already has a bounded timeout, so there is no
//! async runtime to gain from.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::descriptors::{EndpointDescriptor, EndpointType};
use crate::device::{DevicePort, TransferOutcome};
use crate::gadget::{EpHandle, EpReadOutcome, EpWriteOutcome, GadgetPort};
use crate::queue::{Direction, PopOutcome, PushOutcome, Queue, SequenceCounter, Shutdown, TransferRecord};
use crate::rules::CompiledRules;

/// One running device<->gadget relay for a single pair of matching
/// endpoint addresses (e.g. bulk IN 0x81 paired with its host-facing
/// mirror).
pub struct Pipeline {
    shutdown: Shutdown,
    ep_address: u8,
    handle: EpHandle,
    device_to_host: JoinHandle<()>,
    host_to_device: JoinHandle<()>,
}

impl Pipeline {
    /// Spawns the reader/writer thread pair for one endpoint and
    /// enables it on the gadget side.
    ///
    /// Each pipeline gets its own [`Shutdown`] flag, independent of the
    /// process-wide one, so `control.rs` can tear down a single
    /// interface's pipelines on a `SET_INTERFACE`/`SET_CONFIGURATION`
    /// change without stopping unrelated ones.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        descriptor: EndpointDescriptor,
        device: Arc<dyn DevicePort>,
        gadget: Arc<dyn GadgetPort>,
        rules: Arc<CompiledRules>,
        queue_capacity: usize,
        poll_timeout: Duration,
    ) -> crate::error::Result<Self> {
        let shutdown = Shutdown::new();
        let handle = gadget.ep_enable(&descriptor)?;
        let ep_address = descriptor.address;
        let endpoint_type = descriptor.transfer_type();
        let max_packet_size = descriptor.max_packet_size as usize;

        let device_to_host = {
            let device = device.clone();
            let gadget = gadget.clone();
            let rules = rules.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("ep{:#04x}-in", ep_address))
                .spawn(move || {
                    run_device_to_host(
                        ep_address, endpoint_type, max_packet_size, handle, device, gadget, rules, shutdown,
                        queue_capacity, poll_timeout,
                    )
                })
                .expect("spawn device-to-host thread")
        };

        let host_to_device = {
            let device = device.clone();
            let gadget = gadget.clone();
            let rules = rules.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("ep{:#04x}-out", ep_address))
                .spawn(move || {
                    run_host_to_device(
                        ep_address, endpoint_type, max_packet_size, handle, device, gadget, rules, shutdown,
                        poll_timeout,
                    )
                })
                .expect("spawn host-to-device thread")
        };

        Ok(Pipeline { shutdown, ep_address, handle, device_to_host, host_to_device })
    }

    pub fn ep_address(&self) -> u8 {
        self.ep_address
    }

    pub fn handle(&self) -> EpHandle {
        self.handle
    }

    /// Signals this pipeline's own shutdown flag and blocks until both
    /// threads have exited. Does not affect the process-wide flag.
    pub fn shutdown_and_join(self) {
        self.shutdown.signal();
        let _ = self.device_to_host.join();
        let _ = self.host_to_device.join();
    }
}

/// Endpoints whose direction bit is IN relay device->host directly
/// (no intermediate queue needed beyond the thread boundary itself);
/// OUT endpoints relay host->device. Each direction still uses a
/// one-slot handoff through `Queue` so halt/clear-halt can be applied
/// without losing an in-flight record (spec §4.1).
#[allow(clippy::too_many_arguments)]
fn run_device_to_host(
    ep_address: u8,
    endpoint_type: EndpointType,
    max_packet_size: usize,
    handle: EpHandle,
    device: Arc<dyn DevicePort>,
    gadget: Arc<dyn GadgetPort>,
    rules: Arc<CompiledRules>,
    shutdown: Shutdown,
    queue_capacity: usize,
    poll_timeout: Duration,
) {
    if ep_address & 0x80 == 0 {
        return;
    }
    let queue = Queue::new(queue_capacity, shutdown.clone());
    let sequence = SequenceCounter::new();

    while !shutdown.is_signaled() {
        match device.transfer_in(ep_address, max_packet_size.max(crate::queue::MAX_TRANSFER.min(4096)), endpoint_type) {
            Ok(TransferOutcome::Data(data)) => {
                let data = rules.apply_data(ep_address, data);
                let record = TransferRecord::new(Direction::In, data, sequence.next());
                if let PushOutcome::ShuttingDown = queue.push(record) {
                    break;
                }
            }
            Ok(TransferOutcome::Stalled) => {
                debug!("ep {:#04x} stalled on device side, clearing source and mirroring halt", ep_address);
                let _ = device.clear_halt(ep_address);
                let _ = gadget.ep_set_halt(handle);
                continue;
            }
            Ok(TransferOutcome::Disconnected) => {
                warn!("ep {:#04x} device disconnected", ep_address);
                break;
            }
            Err(e) => {
                warn!("ep {:#04x} device read failed: {}", ep_address, e);
                break;
            }
        }

        match queue.pop() {
            PopOutcome::Popped(record) => {
                if record.zero_length {
                    trace!("ep {:#04x} forwarding zero-length packet", ep_address);
                }
                match gadget.ep_write(handle, &record.data, poll_timeout) {
                    Ok(EpWriteOutcome::Ok) => {}
                    Ok(EpWriteOutcome::Halted) => {
                        let _ = device.clear_halt(ep_address);
                    }
                    Ok(EpWriteOutcome::Shutdown) => break,
                    Err(e) => {
                        warn!("ep {:#04x} gadget write failed: {}", ep_address, e);
                        break;
                    }
                }
            }
            PopOutcome::ShuttingDown => break,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_host_to_device(
    ep_address: u8,
    endpoint_type: EndpointType,
    max_packet_size: usize,
    handle: EpHandle,
    device: Arc<dyn DevicePort>,
    gadget: Arc<dyn GadgetPort>,
    rules: Arc<CompiledRules>,
    shutdown: Shutdown,
    poll_timeout: Duration,
) {
    if ep_address & 0x80 != 0 {
        return;
    }
    let read_len = max_packet_size.max(64).min(crate::queue::MAX_TRANSFER);

    while !shutdown.is_signaled() {
        match gadget.ep_read(handle, read_len, poll_timeout) {
            Ok(EpReadOutcome::Data(data)) if data.is_empty() => continue,
            Ok(EpReadOutcome::Data(data)) => {
                let data = rules.apply_data(ep_address, data);
                match device.transfer_out(ep_address, &data, endpoint_type) {
                    Ok(TransferOutcome::Data(_)) => {}
                    Ok(TransferOutcome::Stalled) => {
                        debug!("ep {:#04x} stalled on device side, clearing sink and mirroring halt", ep_address);
                        let _ = device.clear_halt(ep_address);
                        let _ = gadget.ep_set_halt(handle);
                    }
                    Ok(TransferOutcome::Disconnected) => {
                        warn!("ep {:#04x} device disconnected", ep_address);
                        break;
                    }
                    Err(e) => {
                        warn!("ep {:#04x} device write failed: {}", ep_address, e);
                        break;
                    }
                }
            }
            Ok(EpReadOutcome::Halted) => {
                let _ = device.clear_halt(ep_address);
            }
            Ok(EpReadOutcome::Shutdown) => break,
            Err(e) => {
                warn!("ep {:#04x} gadget read failed: {}", ep_address, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::device::MockDevicePort;
    use crate::gadget::MockGadgetPort;
    use crate::rules::{RawDataRule, RawRuleSet};

    #[test]
    fn device_to_host_relays_one_transfer_then_stops_on_disconnect() {
        let calls = AtomicUsize::new(0);
        let mut device = MockDevicePort::new();
        device.expect_transfer_in().returning(move |_, _, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(TransferOutcome::Data(vec![1, 2, 3]))
            } else {
                Ok(TransferOutcome::Disconnected)
            }
        });

        let mut gadget = MockGadgetPort::new();
        gadget.expect_ep_write().times(1).returning(|_, data, _| {
            assert_eq!(data, &[1, 2, 3]);
            Ok(EpWriteOutcome::Ok)
        });

        run_device_to_host(
            0x81,
            EndpointType::Bulk,
            64,
            1,
            Arc::new(device),
            Arc::new(gadget),
            Arc::new(CompiledRules::empty()),
            Shutdown::new(),
            4,
            Duration::from_millis(20),
        );
    }

    #[test]
    fn device_to_host_clears_source_and_mirrors_halt_on_device_stall() {
        let calls = AtomicUsize::new(0);
        let mut device = MockDevicePort::new();
        device.expect_transfer_in().returning(move |_, _, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(TransferOutcome::Stalled)
            } else {
                Ok(TransferOutcome::Disconnected)
            }
        });
        device.expect_clear_halt().withf(|&ep| ep == 0x81).times(1).returning(|_| Ok(()));

        let mut gadget = MockGadgetPort::new();
        gadget.expect_ep_set_halt().withf(|&h| h == 1).times(1).returning(|_| Ok(()));

        run_device_to_host(
            0x81,
            EndpointType::Bulk,
            64,
            1,
            Arc::new(device),
            Arc::new(gadget),
            Arc::new(CompiledRules::empty()),
            Shutdown::new(),
            4,
            Duration::from_millis(20),
        );
    }

    #[test]
    fn host_to_device_applies_data_rules_before_forwarding() {
        let calls = AtomicUsize::new(0);
        let mut gadget = MockGadgetPort::new();
        gadget.expect_ep_read().returning(move |_, _, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(EpReadOutcome::Data(vec![0xaa]))
            } else {
                Ok(EpReadOutcome::Shutdown)
            }
        });

        let mut device = MockDevicePort::new();
        device.expect_transfer_out().times(1).returning(|_, data, _| {
            assert_eq!(data, &[0xbb]);
            Ok(TransferOutcome::Data(Vec::new()))
        });

        let raw = RawRuleSet {
            control: vec![],
            bulk: vec![RawDataRule {
                ep_address: 1,
                enable: true,
                content_pattern: vec![r"\xaa".to_string()],
                replacement: r"\xbb".to_string(),
            }],
            int: vec![],
        };
        let rules = CompiledRules::compile(raw).unwrap();

        run_host_to_device(
            0x01,
            EndpointType::Bulk,
            64,
            1,
            Arc::new(device),
            Arc::new(gadget),
            Arc::new(rules),
            Shutdown::new(),
            Duration::from_millis(20),
        );
    }
}
