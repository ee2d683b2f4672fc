//! Descriptor mirror (C4): an immutable, owned snapshot of the
//! peripheral's descriptor tree, built once at enumeration.
//!
//! Field-walking follows the same `bLength`/`bDescriptorType`-prefixed
//! approach as `cotton-usb-host::types::show_descriptors`, but builds
//! an owned tree on the heap instead of borrowing from a caller-held
//! buffer, since the proxy keeps this tree alive for the life of the
//! process.

use crate::error::{ProxyError, Result};
use crate::proto::{DEVICE_DESCRIPTOR_LEN, DT_CONFIGURATION, DT_ENDPOINT, DT_INTERFACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub raw: Vec<u8>,
}

impl EndpointDescriptor {
    pub fn direction_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn transfer_type(&self) -> EndpointType {
        match self.attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_setting: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ConfigurationDescriptor {
    pub value: u8,
    pub raw: Vec<u8>,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Immutable snapshot of a peripheral's device/configuration/interface/
/// endpoint descriptors. Built once, shared read-only thereafter — no
/// locking is needed because nothing ever mutates it (spec §5).
#[derive(Debug, Clone)]
pub struct DescriptorTree {
    device_raw: Vec<u8>,
    configurations: Vec<ConfigurationDescriptor>,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DescriptorTree {
    /// Builds the tree from verbatim bytes read off the real device via
    /// `GET_DESCRIPTOR`. `ep0_floor` overrides `bMaxPacketSize0` up to
    /// at least this value, to satisfy gadget controllers that refuse
    /// to enumerate with a smaller EP0 (spec §3).
    pub fn build(
        device_descriptor_bytes: &[u8],
        config_descriptor_bytes: &[Vec<u8>],
        ep0_floor: u8,
    ) -> Result<Self> {
        if device_descriptor_bytes.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(ProxyError::Descriptor(format!(
                "device descriptor too short: {} bytes",
                device_descriptor_bytes.len()
            )));
        }
        let mut device_raw = device_descriptor_bytes.to_vec();
        device_raw[7] = device_raw[7].max(ep0_floor);

        let vendor_id = u16::from_le_bytes([device_raw[8], device_raw[9]]);
        let product_id = u16::from_le_bytes([device_raw[10], device_raw[11]]);

        let mut configurations = Vec::with_capacity(config_descriptor_bytes.len());
        for raw in config_descriptor_bytes {
            configurations.push(parse_configuration(raw)?);
        }

        Ok(DescriptorTree { device_raw, configurations, vendor_id, product_id })
    }

    pub fn device_descriptor_bytes(&self) -> &[u8] {
        &self.device_raw
    }

    pub fn max_packet_size0(&self) -> u8 {
        self.device_raw[7]
    }

    pub fn config_descriptor_bytes(&self, index: usize) -> Option<&[u8]> {
        self.configurations.get(index).map(|c| c.raw.as_slice())
    }

    pub fn configurations(&self) -> &[ConfigurationDescriptor] {
        &self.configurations
    }

    pub fn find_config_by_value(&self, value: u8) -> Option<usize> {
        self.configurations.iter().position(|c| c.value == value)
    }

    /// Endpoints active for `(config_value, iface, alt)`, or an empty
    /// vec if the combination doesn't exist.
    pub fn endpoints(&self, config_value: u8, iface: u8, alt: u8) -> Vec<EndpointDescriptor> {
        self.find_config_by_value(config_value)
            .and_then(|idx| self.configurations.get(idx))
            .and_then(|cfg| cfg.interfaces.iter().find(|i| i.number == iface && i.alt_setting == alt))
            .map(|i| i.endpoints.clone())
            .unwrap_or_default()
    }

    pub fn interface_numbers(&self, config_value: u8) -> Vec<u8> {
        let mut numbers: Vec<u8> = self
            .find_config_by_value(config_value)
            .and_then(|idx| self.configurations.get(idx))
            .map(|cfg| cfg.interfaces.iter().map(|i| i.number).collect())
            .unwrap_or_default();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }
}

fn parse_configuration(raw: &[u8]) -> Result<ConfigurationDescriptor> {
    let mut idx = 0usize;
    let mut value = 0u8;
    let mut interfaces: Vec<InterfaceDescriptor> = Vec::new();
    let mut current: Option<InterfaceDescriptor> = None;

    while idx + 2 <= raw.len() {
        let len = raw[idx] as usize;
        if len == 0 || idx + len > raw.len() {
            break;
        }
        let dtype = raw[idx + 1];
        match dtype {
            DT_CONFIGURATION if len >= 5 => {
                value = raw[idx + 5];
            }
            DT_INTERFACE if len >= 4 => {
                if let Some(iface) = current.take() {
                    check_unique_endpoints(&iface)?;
                    interfaces.push(iface);
                }
                current = Some(InterfaceDescriptor {
                    number: raw[idx + 2],
                    alt_setting: raw[idx + 3],
                    endpoints: Vec::new(),
                });
            }
            DT_ENDPOINT if len >= 6 => {
                let ep = EndpointDescriptor {
                    address: raw[idx + 2],
                    attributes: raw[idx + 3],
                    max_packet_size: u16::from_le_bytes([raw[idx + 4], raw[idx + 5]]),
                    raw: raw[idx..idx + len].to_vec(),
                };
                if let Some(iface) = current.as_mut() {
                    iface.endpoints.push(ep);
                }
            }
            _ => {}
        }
        idx += len;
    }
    if let Some(iface) = current.take() {
        check_unique_endpoints(&iface)?;
        interfaces.push(iface);
    }

    Ok(ConfigurationDescriptor { value, raw: raw.to_vec(), interfaces })
}

fn check_unique_endpoints(iface: &InterfaceDescriptor) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for ep in &iface.endpoints {
        if !seen.insert(ep.address) {
            return Err(ProxyError::Descriptor(format!(
                "duplicate endpoint address {:#04x} in interface {} alt {}",
                ep.address, iface.number, iface.alt_setting
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_descriptor(max_packet_size0: u8) -> Vec<u8> {
        vec![
            18, 1, // bLength, bDescriptorType
            0x00, 0x02, // bcdUSB
            0, 0, 0, // class/subclass/protocol
            max_packet_size0,
            0x09, 0x12, // idVendor 0x1209
            0x50, 0xff, // idProduct 0xff50
            0, 0, // bcdDevice
            0, 0, 0, // string indices
            1, // bNumConfigurations
        ]
    }

    fn config_with_one_bulk_pair() -> Vec<u8> {
        let mut raw = vec![
            9, 2, 9 + 9 + 7 + 7, 0, 1, 1, 0, 0x80, 50, // configuration descriptor, value=1
            9, 4, 0, 0, 2, 0xff, 0, 0, 0, // interface 0 alt 0, 2 endpoints
        ];
        raw.extend_from_slice(&[7, 5, 0x81, 2, 64, 0, 0]); // EP 0x81 bulk IN
        raw.extend_from_slice(&[7, 5, 0x01, 2, 64, 0, 0]); // EP 0x01 bulk OUT
        raw
    }

    #[test]
    fn overrides_max_packet_size0_up_to_floor() {
        let tree = DescriptorTree::build(&device_descriptor(8), &[], 64).unwrap();
        assert_eq!(tree.max_packet_size0(), 64);
    }

    #[test]
    fn does_not_lower_an_already_larger_max_packet_size0() {
        let tree = DescriptorTree::build(&device_descriptor(128), &[], 64).unwrap();
        assert_eq!(tree.max_packet_size0(), 128);
    }

    #[test]
    fn parses_vendor_and_product_id() {
        let tree = DescriptorTree::build(&device_descriptor(64), &[], 64).unwrap();
        assert_eq!(tree.vendor_id, 0x1209);
        assert_eq!(tree.product_id, 0xff50);
    }

    #[test]
    fn finds_endpoints_for_config_iface_alt() {
        let tree =
            DescriptorTree::build(&device_descriptor(64), &[config_with_one_bulk_pair()], 64).unwrap();
        let eps = tree.endpoints(1, 0, 0);
        assert_eq!(eps.len(), 2);
        assert!(eps.iter().any(|e| e.address == 0x81 && e.direction_in()));
        assert!(eps.iter().any(|e| e.address == 0x01 && !e.direction_in()));
    }

    #[test]
    fn rejects_duplicate_endpoint_addresses() {
        let mut raw = config_with_one_bulk_pair();
        raw.extend_from_slice(&[7, 5, 0x81, 2, 64, 0, 0]); // duplicate 0x81
        let err = DescriptorTree::build(&device_descriptor(64), &[raw], 64).unwrap_err();
        assert!(matches!(err, ProxyError::Descriptor(_)));
    }

    #[test]
    fn config_descriptor_bytes_are_verbatim() {
        let cfg = config_with_one_bulk_pair();
        let tree = DescriptorTree::build(&device_descriptor(64), &[cfg.clone()], 64).unwrap();
        assert_eq!(tree.config_descriptor_bytes(0).unwrap(), cfg.as_slice());
    }
}
