//! EP0 state machine (C7): the engine's core loop. Fetches gadget
//! events, answers standard enumeration requests from the descriptor
//! mirror, proxies everything else to the real device, and spins
//! pipelines up/down as the host selects configurations and interface
//! alt settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::device::DevicePort;
use crate::gadget::{EpHandle, Event, GadgetPort};
use crate::pipeline::Pipeline;
use crate::proto::{self, SetupPacket};
use crate::queue::Shutdown;
use crate::rules::{CompiledRules, ControlAction};

/// Drives one proxy session end to end until the gadget reports
/// disconnect or the process-wide shutdown flag is raised.
pub struct Ep0StateMachine {
    gadget: Arc<dyn GadgetPort>,
    device: Arc<dyn DevicePort>,
    rules: Arc<CompiledRules>,
    shutdown: Shutdown,
    active_config: Option<u8>,
    alt_settings: HashMap<u8, u8>,
    pipelines: HashMap<u8, Vec<Pipeline>>,
    ep_handles: HashMap<u8, EpHandle>,
    queue_capacity: usize,
    poll_timeout: Duration,
}

impl Ep0StateMachine {
    pub fn new(
        gadget: Arc<dyn GadgetPort>,
        device: Arc<dyn DevicePort>,
        rules: Arc<CompiledRules>,
        shutdown: Shutdown,
        queue_capacity: usize,
        poll_timeout: Duration,
    ) -> Self {
        Ep0StateMachine {
            gadget,
            device,
            rules,
            shutdown,
            active_config: None,
            alt_settings: HashMap::new(),
            pipelines: HashMap::new(),
            ep_handles: HashMap::new(),
            queue_capacity,
            poll_timeout,
        }
    }

    /// Runs until shutdown or disconnect, consuming `self`.
    pub fn run(mut self) -> crate::error::Result<()> {
        while !self.shutdown.is_signaled() {
            let event = match self.gadget.event_fetch() {
                Ok(event) => event,
                Err(crate::error::ProxyError::Disconnected) => continue,
                Err(e) => {
                    warn!("event_fetch failed: {}", e);
                    return Err(e);
                }
            };
            self.handle_event(event)?;
        }
        self.teardown_pipelines();
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> crate::error::Result<()> {
        match event {
            Event::Connect => info!("host connected"),
            Event::Reset => {
                info!("bus reset");
                self.teardown_pipelines();
                self.active_config = None;
                self.alt_settings.clear();
                if let Err(e) = self.device.reset() {
                    warn!("failed to reset device: {}", e);
                }
            }
            Event::Suspend => info!("bus suspend"),
            Event::Resume => info!("bus resume"),
            Event::Disconnect => {
                info!("host disconnected");
                self.teardown_pipelines();
            }
            Event::ControlSetup(setup) => self.handle_setup(setup)?,
        }
        Ok(())
    }

    fn handle_setup(&mut self, setup: SetupPacket) -> crate::error::Result<()> {
        let payload = if setup.direction_in() { Vec::new() } else { self.read_ep0_payload(&setup)? };

        match self.rules.apply_control(&setup, &payload) {
            ControlAction::Stall => {
                self.gadget.ep0_stall()?;
                return Ok(());
            }
            ControlAction::Drop => {
                // Acknowledge at the wire level without forwarding to
                // the real device, per the `ignore` action.
                if setup.direction_in() {
                    self.gadget.ep0_write(&[])?;
                } else {
                    self.gadget.ep0_read(0)?;
                }
                return Ok(());
            }
            ControlAction::Forward(data) => {
                if setup.is_standard() {
                    self.handle_standard_request(&setup, &data)?;
                } else {
                    self.proxy_request(&setup, &data)?;
                }
            }
        }
        Ok(())
    }

    fn read_ep0_payload(&self, setup: &SetupPacket) -> crate::error::Result<Vec<u8>> {
        if setup.wLength == 0 {
            Ok(Vec::new())
        } else {
            self.gadget.ep0_read(setup.wLength as usize)
        }
    }

    /// Answers `GET_DESCRIPTOR`/`GET_CONFIGURATION`/`GET_INTERFACE`
    /// straight from the descriptor mirror, and intercepts
    /// `SET_CONFIGURATION`/`SET_INTERFACE` to drive pipeline
    /// lifecycle, rather than letting every standard request fall
    /// through to the real device (spec §4.2/§5).
    fn handle_standard_request(&mut self, setup: &SetupPacket, payload: &[u8]) -> crate::error::Result<()> {
        match setup.bRequest {
            proto::GET_DESCRIPTOR if setup.direction_in() => self.answer_get_descriptor(setup)?,
            proto::GET_CONFIGURATION if setup.direction_in() => {
                let value = self.active_config.unwrap_or(0);
                self.gadget.ep0_write(&[value])?;
            }
            proto::GET_INTERFACE if setup.direction_in() => {
                let iface = setup.wIndex as u8;
                let alt = *self.alt_settings.get(&iface).unwrap_or(&0);
                self.gadget.ep0_write(&[alt])?;
            }
            proto::SET_CONFIGURATION => {
                let value = setup.wValue as u8;
                self.set_configuration(value)?;
                self.gadget.ep0_write(&[])?;
            }
            proto::SET_INTERFACE => {
                let iface = setup.wIndex as u8;
                let alt = setup.wValue as u8;
                self.set_alt_setting(iface, alt)?;
                self.gadget.ep0_write(&[])?;
            }
            proto::CLEAR_FEATURE
                if setup.recipient() == proto::RECIPIENT_ENDPOINT
                    && setup.wValue == proto::FEATURE_ENDPOINT_HALT =>
            {
                self.clear_endpoint_halt(setup.wIndex as u8);
                self.proxy_request(setup, payload)?;
            }
            _ => self.proxy_request(setup, payload)?,
        }
        Ok(())
    }

    fn answer_get_descriptor(&self, setup: &SetupPacket) -> crate::error::Result<()> {
        let descriptor_type = (setup.wValue >> 8) as u8;
        let index = (setup.wValue & 0xff) as u8;
        let descriptors = self.device.descriptors();

        let bytes: Option<&[u8]> = match descriptor_type {
            proto::DT_DEVICE => Some(descriptors.device_descriptor_bytes()),
            proto::DT_CONFIGURATION => descriptors.config_descriptor_bytes(index as usize),
            _ => None,
        };

        match bytes {
            Some(bytes) => {
                let len = bytes.len().min(setup.wLength as usize);
                self.gadget.ep0_write(&bytes[..len])?;
            }
            None => {
                // String and other descriptor types are proxied to the
                // real device verbatim rather than mirrored.
                self.forward_descriptor_to_device(setup)?;
            }
        }
        Ok(())
    }

    fn forward_descriptor_to_device(&self, setup: &SetupPacket) -> crate::error::Result<()> {
        match self.device.control(setup, None) {
            Ok(data) => self.gadget.ep0_write(&data)?,
            Err(_) => self.gadget.ep0_stall()?,
        }
        Ok(())
    }

    fn proxy_request(&self, setup: &SetupPacket, payload: &[u8]) -> crate::error::Result<()> {
        let data_out = if setup.direction_in() { None } else { Some(payload) };
        match self.device.control(setup, data_out) {
            Ok(data) => {
                if setup.direction_in() {
                    self.gadget.ep0_write(&data)?;
                } else {
                    self.gadget.ep0_write(&[])?;
                }
            }
            Err(e) => {
                warn!("control request forwarded to device failed: {}", e);
                self.gadget.ep0_stall()?;
            }
        }
        Ok(())
    }

    fn set_configuration(&mut self, value: u8) -> crate::error::Result<()> {
        self.teardown_pipelines();
        self.device.set_configuration(value)?;
        self.active_config = Some(value);
        self.alt_settings.clear();

        if value != 0 {
            for iface in self.device.descriptors().interface_numbers(value) {
                self.device.claim_interface(iface)?;
                self.spawn_pipelines_for(value, iface, 0)?;
                self.alt_settings.insert(iface, 0);
            }
            self.gadget.configure().ok();
        }
        Ok(())
    }

    fn set_alt_setting(&mut self, iface: u8, alt: u8) -> crate::error::Result<()> {
        let Some(config) = self.active_config else {
            return Ok(());
        };
        self.teardown_pipelines_for(iface);
        self.device.set_alt_setting(iface, alt)?;
        self.spawn_pipelines_for(config, iface, alt)?;
        self.alt_settings.insert(iface, alt);
        Ok(())
    }

    fn spawn_pipelines_for(&mut self, config: u8, iface: u8, alt: u8) -> crate::error::Result<()> {
        let mut spawned = Vec::new();
        for endpoint in self.device.descriptors().endpoints(config, iface, alt) {
            let pipeline = Pipeline::spawn(
                endpoint,
                self.device.clone(),
                self.gadget.clone(),
                self.rules.clone(),
                self.queue_capacity,
                self.poll_timeout,
            )?;
            self.ep_handles.insert(pipeline.ep_address(), pipeline.handle());
            spawned.push(pipeline);
        }
        self.pipelines.insert(iface, spawned);
        Ok(())
    }

    fn teardown_pipelines_for(&mut self, iface: u8) {
        if let Some(pipelines) = self.pipelines.remove(&iface) {
            for pipeline in pipelines {
                self.disable_pipeline_endpoint(&pipeline);
                pipeline.shutdown_and_join();
            }
        }
    }

    fn teardown_pipelines(&mut self) {
        for (_, pipelines) in self.pipelines.drain() {
            for pipeline in pipelines {
                self.disable_pipeline_endpoint(&pipeline);
                pipeline.shutdown_and_join();
            }
        }
    }

    /// Removes the torn-down endpoint from the handle map and disables
    /// it on the gadget side, so a reset/`SET_INTERFACE`/
    /// `SET_CONFIGURATION` doesn't leak an enabled endpoint behind.
    fn disable_pipeline_endpoint(&mut self, pipeline: &Pipeline) {
        self.ep_handles.remove(&pipeline.ep_address());
        if let Err(e) = self.gadget.ep_disable(pipeline.handle()) {
            warn!("failed to disable ep {:#04x}: {}", pipeline.ep_address(), e);
        }
    }

    /// Clears the gadget-side halt latch for the endpoint addressed by
    /// a host `CLEAR_FEATURE(ENDPOINT_HALT)` request. `wIndex` carries
    /// the endpoint address including its direction bit, matching the
    /// keys `spawn_pipelines_for` records them under.
    fn clear_endpoint_halt(&self, ep_address: u8) {
        if let Some(&handle) = self.ep_handles.get(&ep_address) {
            if let Err(e) = self.gadget.ep_clear_halt(handle) {
                warn!("failed to clear halt on ep {:#04x}: {}", ep_address, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::DescriptorTree;
    use crate::device::MockDevicePort;
    use crate::gadget::MockGadgetPort;
    use crate::rules::{RawControlRule, RawRuleSet};

    fn device_descriptor_bytes() -> Vec<u8> {
        vec![
            18, 1, // bLength, bDescriptorType
            0x00, 0x02, // bcdUSB
            0, 0, 0, // class/subclass/protocol
            64, // bMaxPacketSize0
            0x09, 0x12, // idVendor
            0x50, 0xff, // idProduct
            0, 0, // bcdDevice
            0, 0, 0, // string indices
            0, // bNumConfigurations
        ]
    }

    fn empty_tree() -> DescriptorTree {
        DescriptorTree::build(&device_descriptor_bytes(), &[], 64).unwrap()
    }

    fn machine_with(gadget: MockGadgetPort, device: MockDevicePort, rules: CompiledRules) -> Ep0StateMachine {
        Ep0StateMachine::new(
            Arc::new(gadget),
            Arc::new(device),
            Arc::new(rules),
            Shutdown::new(),
            4,
            Duration::from_millis(50),
        )
    }

    #[test]
    fn get_descriptor_answers_from_mirror_without_touching_device() {
        let tree = empty_tree();
        let mut device = MockDevicePort::new();
        device.expect_descriptors().return_const(tree);

        let mut gadget = MockGadgetPort::new();
        gadget.expect_ep0_write().times(1).returning(|data| {
            assert_eq!(data.len(), 18);
            Ok(())
        });

        let mut machine = machine_with(gadget, device, CompiledRules::empty());
        let setup = SetupPacket {
            bmRequestType: proto::DIR_DEVICE_TO_HOST,
            bRequest: proto::GET_DESCRIPTOR,
            wValue: (proto::DT_DEVICE as u16) << 8,
            wIndex: 0,
            wLength: 18,
        };
        machine.handle_setup(setup).unwrap();
    }

    #[test]
    fn ignore_action_writes_an_empty_packet_for_a_control_in_transfer() {
        let tree = empty_tree();
        let mut device = MockDevicePort::new();
        device.expect_descriptors().return_const(tree);

        let mut gadget = MockGadgetPort::new();
        gadget.expect_ep0_write().times(1).returning(|data| {
            assert!(data.is_empty());
            Ok(())
        });

        let raw = RawRuleSet {
            control: vec![RawControlRule {
                bm_request_type: None,
                b_request: Some(proto::GET_DESCRIPTOR as u32),
                w_value: None,
                w_index: None,
                w_length: None,
                enable: true,
                action: Some("ignore".to_string()),
                content_pattern: vec![],
                replacement: String::new(),
            }],
            bulk: vec![],
            int: vec![],
        };
        let rules = CompiledRules::compile(raw).unwrap();

        let mut machine = machine_with(gadget, device, rules);
        let setup = SetupPacket {
            bmRequestType: proto::DIR_DEVICE_TO_HOST,
            bRequest: proto::GET_DESCRIPTOR,
            wValue: (proto::DT_DEVICE as u16) << 8,
            wIndex: 0,
            wLength: 18,
        };
        machine.handle_setup(setup).unwrap();
    }

    #[test]
    fn clear_feature_endpoint_halt_clears_the_gadget_and_still_forwards_to_the_device() {
        let tree = empty_tree();
        let mut device = MockDevicePort::new();
        device.expect_descriptors().return_const(tree);
        device.expect_control().times(1).returning(|_, _| Ok(Vec::new()));

        let mut gadget = MockGadgetPort::new();
        gadget.expect_ep_clear_halt().withf(|&handle| handle == 7).times(1).returning(|_| Ok(()));
        gadget.expect_ep0_write().times(1).returning(|_| Ok(()));

        let mut machine = machine_with(gadget, device, CompiledRules::empty());
        machine.ep_handles.insert(0x81, 7);

        let setup = SetupPacket {
            bmRequestType: proto::DIR_HOST_TO_DEVICE | proto::RECIPIENT_ENDPOINT,
            bRequest: proto::CLEAR_FEATURE,
            wValue: proto::FEATURE_ENDPOINT_HALT,
            wIndex: 0x81,
            wLength: 0,
        };
        machine.handle_setup(setup).unwrap();
    }

    #[test]
    fn reset_event_tears_down_pipelines_and_resets_the_device() {
        let tree = empty_tree();
        let mut device = MockDevicePort::new();
        device.expect_descriptors().return_const(tree);
        device.expect_reset().times(1).returning(|| Ok(()));

        let gadget = MockGadgetPort::new();
        let mut machine = machine_with(gadget, device, CompiledRules::empty());
        machine.active_config = Some(1);

        machine.handle_event(Event::Reset).unwrap();
        assert_eq!(machine.active_config, None);
    }
}
