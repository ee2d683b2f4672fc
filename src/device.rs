//! Device port (C3): the userspace side that talks to the real
//! peripheral over `rusb`, the same way `ffp::programmer::Programmer`
//! wraps a `DeviceHandle` for one hardcoded device, generalized here to
//! whatever vendor/product id the operator points the proxy at.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
#[cfg(test)]
use mockall::automock;

use crate::descriptors::DescriptorTree;
use crate::error::{ProxyError, Result};
use crate::proto::{self, SetupPacket};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const BULK_RETRY_LIMIT: u32 = 5;
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of a transfer issued against a live endpoint.
pub enum TransferOutcome {
    Data(Vec<u8>),
    Stalled,
    Disconnected,
}

/// Abstraction over a real USB device, so `control.rs`/`pipeline.rs`
/// can run against a `mockall` fake (grounded the same way as
/// `GadgetPort`, on `cotton-usb-host`'s trait-per-hardware-surface
/// design).
#[cfg_attr(test, automock)]
pub trait DevicePort: Send + Sync {
    fn descriptors(&self) -> &DescriptorTree;
    fn set_configuration(&self, value: u8) -> Result<()>;
    fn claim_interface(&self, number: u8) -> Result<()>;
    fn set_alt_setting(&self, iface: u8, alt: u8) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn control(&self, setup: &SetupPacket, data_out: Option<&[u8]>) -> Result<Vec<u8>>;
    fn transfer_in(&self, ep_address: u8, max_len: usize, endpoint_type: crate::descriptors::EndpointType) -> Result<TransferOutcome>;
    fn transfer_out(&self, ep_address: u8, data: &[u8], endpoint_type: crate::descriptors::EndpointType) -> Result<TransferOutcome>;
    fn clear_halt(&self, ep_address: u8) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Live `rusb`-backed peripheral connection.
pub struct UsbDevice {
    handle: rusb::DeviceHandle<rusb::Context>,
    descriptors: DescriptorTree,
}

impl UsbDevice {
    /// Opens the first device matching `vendor_id`/`product_id`,
    /// retrying with backoff until `deadline` (spec §4.3: the
    /// peripheral may not be plugged in yet when the proxy starts).
    pub fn open(vendor_id: u16, product_id: u16, ep0_floor: u8, deadline: Duration) -> Result<Self> {
        let context = rusb::Context::new()?;
        let started = Instant::now();
        loop {
            match find_and_open(&context, vendor_id, product_id) {
                Some(handle) => return Self::from_handle(handle, ep0_floor),
                None if started.elapsed() >= deadline => {
                    return Err(ProxyError::DeviceNotFound { vendor_id, product_id })
                }
                None => {
                    debug!("device {:04x}:{:04x} not present yet, retrying", vendor_id, product_id);
                    thread::sleep(OPEN_RETRY_INTERVAL);
                }
            }
        }
    }

    fn from_handle(handle: rusb::DeviceHandle<rusb::Context>, ep0_floor: u8) -> Result<Self> {
        let device = handle.device();
        let device_descriptor = device.device_descriptor()?;

        let mut device_bytes = vec![0u8; proto::DEVICE_DESCRIPTOR_LEN];
        read_device_descriptor(&handle, &mut device_bytes)?;

        let mut config_bytes = Vec::with_capacity(device_descriptor.num_configurations() as usize);
        for index in 0..device_descriptor.num_configurations() {
            config_bytes.push(read_configuration_descriptor(&handle, index)?);
        }

        let descriptors = DescriptorTree::build(&device_bytes, &config_bytes, ep0_floor)?;
        Ok(UsbDevice { handle, descriptors })
    }
}

impl DevicePort for UsbDevice {
    fn descriptors(&self) -> &DescriptorTree {
        &self.descriptors
    }

    fn set_configuration(&self, value: u8) -> Result<()> {
        self.handle.set_active_configuration(value)?;
        Ok(())
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        if self.handle.kernel_driver_active(number).unwrap_or(false) {
            self.handle.detach_kernel_driver(number)?;
        }
        self.handle.claim_interface(number)?;
        Ok(())
    }

    fn set_alt_setting(&self, iface: u8, alt: u8) -> Result<()> {
        self.handle.set_alternate_setting(iface, alt)?;
        Ok(())
    }

    /// Issues a USB port reset on the real device (spec §4.3), used
    /// when the host resets the bus on the gadget side so the
    /// downstream peripheral observes the same bus event.
    fn reset(&self) -> Result<()> {
        self.handle.reset()?;
        Ok(())
    }

    fn control(&self, setup: &SetupPacket, data_out: Option<&[u8]>) -> Result<Vec<u8>> {
        if setup.direction_in() {
            let mut buf = vec![0u8; setup.wLength as usize];
            let n = self.handle.read_control(
                setup.bmRequestType,
                setup.bRequest,
                setup.wValue,
                setup.wIndex,
                &mut buf,
                CONTROL_TIMEOUT,
            )?;
            buf.truncate(n);
            Ok(buf)
        } else {
            let payload = data_out.unwrap_or(&[]);
            self.handle.write_control(
                setup.bmRequestType,
                setup.bRequest,
                setup.wValue,
                setup.wIndex,
                payload,
                CONTROL_TIMEOUT,
            )?;
            Ok(Vec::new())
        }
    }

    fn transfer_in(&self, ep_address: u8, max_len: usize, endpoint_type: crate::descriptors::EndpointType) -> Result<TransferOutcome> {
        use crate::descriptors::EndpointType;
        let retries = match endpoint_type {
            EndpointType::Bulk => BULK_RETRY_LIMIT,
            _ => 1,
        };
        let mut buf = vec![0u8; max_len];
        let mut attempt = 0;
        loop {
            let result = match endpoint_type {
                EndpointType::Interrupt => self.handle.read_interrupt(ep_address, &mut buf, CONTROL_TIMEOUT),
                _ => self.handle.read_bulk(ep_address, &mut buf, CONTROL_TIMEOUT),
            };
            match result {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(TransferOutcome::Data(buf));
                }
                Err(rusb::Error::Pipe) => return Ok(TransferOutcome::Stalled),
                Err(rusb::Error::NoDevice) => return Ok(TransferOutcome::Disconnected),
                Err(rusb::Error::Timeout) => return Ok(TransferOutcome::Data(Vec::new())),
                Err(e) if attempt + 1 < retries => {
                    attempt += 1;
                    warn!("transfer_in ep {:#04x} attempt {} failed: {}", ep_address, attempt, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn transfer_out(&self, ep_address: u8, data: &[u8], endpoint_type: crate::descriptors::EndpointType) -> Result<TransferOutcome> {
        use crate::descriptors::EndpointType;
        let retries = match endpoint_type {
            EndpointType::Bulk => BULK_RETRY_LIMIT,
            _ => 1,
        };
        let mut attempt = 0;
        loop {
            let result = match endpoint_type {
                EndpointType::Interrupt => self.handle.write_interrupt(ep_address, data, CONTROL_TIMEOUT),
                _ => self.handle.write_bulk(ep_address, data, CONTROL_TIMEOUT),
            };
            match result {
                Ok(_) => return Ok(TransferOutcome::Data(Vec::new())),
                Err(rusb::Error::Pipe) => return Ok(TransferOutcome::Stalled),
                Err(rusb::Error::NoDevice) => return Ok(TransferOutcome::Disconnected),
                Err(e) if attempt + 1 < retries => {
                    attempt += 1;
                    warn!("transfer_out ep {:#04x} attempt {} failed: {}", ep_address, attempt, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_halt(&self, ep_address: u8) -> Result<()> {
        self.handle.clear_halt(ep_address)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.device().device_descriptor().is_ok()
    }
}

fn find_and_open(
    context: &rusb::Context,
    vendor_id: u16,
    product_id: u16,
) -> Option<rusb::DeviceHandle<rusb::Context>> {
    let devices = context.devices().ok()?;
    for device in devices.iter() {
        let descriptor = device.device_descriptor().ok()?;
        if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
            return device.open().ok();
        }
    }
    None
}

fn read_device_descriptor(handle: &rusb::DeviceHandle<rusb::Context>, buf: &mut [u8]) -> Result<()> {
    let n = handle.read_control(
        proto::DIR_DEVICE_TO_HOST,
        proto::GET_DESCRIPTOR,
        (proto::DT_DEVICE as u16) << 8,
        0,
        buf,
        CONTROL_TIMEOUT,
    )?;
    if n < proto::DEVICE_DESCRIPTOR_LEN {
        return Err(ProxyError::Descriptor(format!("short device descriptor read: {} bytes", n)));
    }
    Ok(())
}

fn read_configuration_descriptor(handle: &rusb::DeviceHandle<rusb::Context>, index: u8) -> Result<Vec<u8>> {
    let mut head = [0u8; 9];
    handle.read_control(
        proto::DIR_DEVICE_TO_HOST,
        proto::GET_DESCRIPTOR,
        (proto::DT_CONFIGURATION as u16) << 8 | index as u16,
        0,
        &mut head,
        CONTROL_TIMEOUT,
    )?;
    let total_len = u16::from_le_bytes([head[2], head[3]]) as usize;

    let mut full = vec![0u8; total_len];
    let n = handle.read_control(
        proto::DIR_DEVICE_TO_HOST,
        proto::GET_DESCRIPTOR,
        (proto::DT_CONFIGURATION as u16) << 8 | index as u16,
        0,
        &mut full,
        CONTROL_TIMEOUT,
    )?;
    full.truncate(n);
    Ok(full)
}
