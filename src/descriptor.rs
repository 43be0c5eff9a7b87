//! Standard USB descriptors
//!
//! Every descriptor knows its wire layout. `to_bytes()` produces the packed,
//! little-endian form; `parse()` reads it back and rejects short input or a
//! mismatched `bDescriptorType` with [`Error::BadF`].

use crate::error::{Error, Result};
use crate::transfer::TransferType;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// `bDescriptorType` values
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEVICE_QUALIFIER: u8 = 0x06;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 0x07;
    pub const INTERFACE_POWER: u8 = 0x08;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const BOS: u8 = 0x0F;
    pub const DEVICE_CAPABILITY: u8 = 0x10;
    pub const HID: u8 = 0x21;
    pub const HID_REPORT: u8 = 0x22;
    pub const CS_INTERFACE: u8 = 0x24;
    pub const CS_ENDPOINT: u8 = 0x25;
}

/// `bmAttributes` bits of a configuration descriptor
pub mod config_attributes {
    /// Always set
    pub const RESERVED: u8 = 0x80;
    pub const SELF_POWERED: u8 = 0x40;
    pub const REMOTE_WAKEUP: u8 = 0x20;
}

#[inline]
fn le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Validate the header of a descriptor of fixed length `len`
fn check(buf: &[u8], len: usize, kind: u8) -> Result<()> {
    if buf.len() < len || usize::from(buf[0]) < len || buf[1] != kind {
        return Err(Error::BadF);
    }
    Ok(())
}

/// Device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            bcd_usb: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 64,
            id_vendor: 0,
            id_product: 0,
            bcd_device: 0x0100,
            manufacturer: 0,
            product: 0,
            serial_number: 0,
            num_configurations: 0,
        }
    }
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let usb = self.bcd_usb.to_le_bytes();
        let vid = self.id_vendor.to_le_bytes();
        let pid = self.id_product.to_le_bytes();
        let dev = self.bcd_device.to_le_bytes();
        [
            Self::LEN as u8,
            descriptor_type::DEVICE,
            usb[0],
            usb[1],
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.max_packet_size0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            dev[0],
            dev[1],
            self.manufacturer,
            self.product,
            self.serial_number,
            self.num_configurations,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::DEVICE)?;
        Ok(Self {
            bcd_usb: le16(buf, 2),
            device_class: buf[4],
            device_subclass: buf[5],
            device_protocol: buf[6],
            max_packet_size0: buf[7],
            id_vendor: le16(buf, 8),
            id_product: le16(buf, 10),
            bcd_device: le16(buf, 12),
            manufacturer: buf[14],
            product: buf[15],
            serial_number: buf[16],
            num_configurations: buf[17],
        })
    }
}

/// Configuration descriptor header
///
/// Also used for the other-speed configuration, which only differs in
/// `bDescriptorType`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration: u8,
    pub attributes: u8,
    /// In units of 2 mA
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self, kind: u8) -> [u8; Self::LEN] {
        let total = self.total_length.to_le_bytes();
        [
            Self::LEN as u8,
            kind,
            total[0],
            total[1],
            self.num_interfaces,
            self.configuration_value,
            self.configuration,
            self.attributes | config_attributes::RESERVED,
            self.max_power,
        ]
    }

    /// Parse a configuration, or other-speed configuration, header
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::CONFIGURATION)
            .or_else(|_| check(buf, Self::LEN, descriptor_type::OTHER_SPEED_CONFIGURATION))?;
        Ok(Self {
            total_length: le16(buf, 2),
            num_interfaces: buf[4],
            configuration_value: buf[5],
            configuration: buf[6],
            attributes: buf[7],
            max_power: buf[8],
        })
    }
}

/// Interface descriptor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface: u8,
}

impl InterfaceDescriptor {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        [
            Self::LEN as u8,
            descriptor_type::INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.interface,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::INTERFACE)?;
        Ok(Self {
            interface_number: buf[2],
            alternate_setting: buf[3],
            num_endpoints: buf[4],
            interface_class: buf[5],
            interface_subclass: buf[6],
            interface_protocol: buf[7],
            interface: buf[8],
        })
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    /// Packet size in bits 0..=10; additional transactions per microframe in
    /// bits 11..=12
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mps = self.max_packet_size.to_le_bytes();
        [
            Self::LEN as u8,
            descriptor_type::ENDPOINT,
            self.address,
            self.attributes,
            mps[0],
            mps[1],
            self.interval,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::ENDPOINT)?;
        Ok(Self {
            address: buf[2],
            attributes: buf[3],
            max_packet_size: le16(buf, 4),
            interval: buf[6],
        })
    }

    pub fn endpoint_address(&self) -> EndpointAddress {
        EndpointAddress::from(self.address)
    }

    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    /// Bytes per transaction
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    /// Transactions per (micro)frame, 1 to 3
    pub fn transactions(&self) -> u16 {
        ((self.max_packet_size >> 11) & 0b11) + 1
    }
}

/// Interface association descriptor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAssociationDescriptor {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
    pub function: u8,
}

impl InterfaceAssociationDescriptor {
    pub const LEN: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        [
            Self::LEN as u8,
            descriptor_type::INTERFACE_ASSOCIATION,
            self.first_interface,
            self.interface_count,
            self.function_class,
            self.function_subclass,
            self.function_protocol,
            self.function,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::INTERFACE_ASSOCIATION)?;
        Ok(Self {
            first_interface: buf[2],
            interface_count: buf[3],
            function_class: buf[4],
            function_subclass: buf[5],
            function_protocol: buf[6],
            function: buf[7],
        })
    }
}

/// Device qualifier descriptor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQualifierDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
}

impl DeviceQualifierDescriptor {
    pub const LEN: usize = 10;

    /// The qualifier describing `device` at the other speed
    pub fn for_device(device: &DeviceDescriptor) -> Self {
        Self {
            bcd_usb: device.bcd_usb,
            device_class: device.device_class,
            device_subclass: device.device_subclass,
            device_protocol: device.device_protocol,
            max_packet_size0: device.max_packet_size0,
            num_configurations: device.num_configurations,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let usb = self.bcd_usb.to_le_bytes();
        [
            Self::LEN as u8,
            descriptor_type::DEVICE_QUALIFIER,
            usb[0],
            usb[1],
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.max_packet_size0,
            self.num_configurations,
            0,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::DEVICE_QUALIFIER)?;
        Ok(Self {
            bcd_usb: le16(buf, 2),
            device_class: buf[4],
            device_subclass: buf[5],
            device_protocol: buf[6],
            max_packet_size0: buf[7],
            num_configurations: buf[8],
        })
    }
}

/// Binary device object store header
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BosDescriptor {
    pub total_length: u16,
    pub num_device_caps: u8,
}

impl BosDescriptor {
    pub const LEN: usize = 5;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let total = self.total_length.to_le_bytes();
        [
            Self::LEN as u8,
            descriptor_type::BOS,
            total[0],
            total[1],
            self.num_device_caps,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::LEN, descriptor_type::BOS)?;
        Ok(Self {
            total_length: le16(buf, 2),
            num_device_caps: buf[4],
        })
    }
}

/// One raw descriptor inside a larger blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDescriptor<'a> {
    pub kind: u8,
    /// The whole descriptor, including the two header bytes
    pub bytes: &'a [u8],
}

/// Walks the descriptors of a configuration blob
///
/// Yields an error, then stops, on a descriptor that's shorter than its
/// header or that runs past the end of the blob.
pub struct DescriptorIter<'a> {
    buf: &'a [u8],
}

impl<'a> DescriptorIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<RawDescriptor<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let len = usize::from(self.buf[0]);
        if len < 2 || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(Error::BadF));
        }
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(Ok(RawDescriptor {
            kind: bytes[1],
            bytes,
        }))
    }
}
