//! Configuration building and serialization

use super::endpoint::EndpointRegistry;
use super::function::FunctionOps;
use crate::descriptor::{
    ConfigurationDescriptor, EndpointDescriptor, InterfaceAssociationDescriptor,
    InterfaceDescriptor,
};
use crate::error::{Error, Result};
use crate::transfer::TransferType;
use crate::{Speed, INTERFACE_NUM_MAX};
use alloc::{string::String, sync::Arc, vec::Vec};
use usb_device::endpoint::EndpointAddress;

/// Identifies a configuration by its `bConfigurationValue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigId(pub(crate) u8);

impl ConfigId {
    pub fn value(self) -> u8 {
        self.0
    }
}

/// One alternate setting of one interface
#[derive(Debug, Default, Clone)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alt: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Interface string
    pub name: Option<String>,
    /// Class-specific descriptors that follow the interface descriptor
    pub class_descriptors: Vec<u8>,
}

/// An interface association
#[derive(Debug, Default, Clone)]
pub struct AssociationInfo {
    pub first_interface: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub name: Option<String>,
}

/// A pipe to add to an alternate setting
#[derive(Debug, Clone)]
pub struct PipeInfo {
    /// Endpoint address. With endpoint number zero, the direction bit picks
    /// the direction and the stack picks the endpoint.
    pub address: u8,
    pub kind: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Class-specific descriptors that follow the endpoint descriptor
    pub class_descriptors: Vec<u8>,
}

impl PipeInfo {
    pub fn new(address: u8, kind: TransferType, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address,
            kind,
            max_packet_size,
            interval,
            class_descriptors: Vec::new(),
        }
    }
    pub fn bulk_in(max_packet_size: u16) -> Self {
        Self::new(0x80, TransferType::Bulk, max_packet_size, 0)
    }
    pub fn bulk_out(max_packet_size: u16) -> Self {
        Self::new(0x00, TransferType::Bulk, max_packet_size, 0)
    }
    pub fn interrupt_in(max_packet_size: u16, interval: u8) -> Self {
        Self::new(0x80, TransferType::Interrupt, max_packet_size, interval)
    }
    pub fn interrupt_out(max_packet_size: u16, interval: u8) -> Self {
        Self::new(0x00, TransferType::Interrupt, max_packet_size, interval)
    }
}

pub(crate) struct AltEndpoint {
    pub desc: EndpointDescriptor,
    pub class_descriptors: Vec<u8>,
}

pub(crate) struct AltSetting {
    pub desc: InterfaceDescriptor,
    pub class_descriptors: Vec<u8>,
    pub endpoints: Vec<AltEndpoint>,
    pub ops: Arc<dyn FunctionOps>,
}

/// All alternate settings of one interface number
pub(crate) struct FunctionHeader {
    pub number: u8,
    pub association: Option<InterfaceAssociationDescriptor>,
    pub alts: Vec<AltSetting>,
}

impl FunctionHeader {
    pub fn alt(&self, alt: u8) -> Option<&AltSetting> {
        self.alts.iter().find(|setting| setting.desc.alternate_setting == alt)
    }
}

/// An endpoint claimed by an interface number
///
/// Alternate settings of the same interface share the claim.
struct Claim {
    address: EndpointAddress,
    interface: u8,
    refs: usize,
}

pub(crate) struct Config {
    pub value: u8,
    pub name: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub functions: Vec<FunctionHeader>,
    claims: Vec<Claim>,
    total_len: usize,
}

impl Config {
    pub fn new(value: u8, name: u8) -> Self {
        Self {
            value,
            name,
            attributes: 0,
            max_power: 50,
            functions: Vec::new(),
            claims: Vec::new(),
            total_len: ConfigurationDescriptor::LEN,
        }
    }

    /// Returns the size of the serialized configuration
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn function(&self, number: u8) -> Option<&FunctionHeader> {
        self.functions.iter().find(|func| func.number == number)
    }

    fn function_mut(&mut self, number: u8) -> Option<&mut FunctionHeader> {
        self.functions.iter_mut().find(|func| func.number == number)
    }

    /// Returns the interface that claimed `address`
    pub fn owner_of(&self, address: EndpointAddress) -> Option<u8> {
        self.claims
            .iter()
            .find(|claim| claim.address == address)
            .map(|claim| claim.interface)
    }

    fn grow(&mut self, len: usize, limit: usize) -> Result<()> {
        let total = self.total_len + len;
        if total > limit {
            warn!("configuration {} would grow to {} bytes", self.value, total);
            return Err(Error::Size);
        }
        self.total_len = total;
        Ok(())
    }

    /// Add one alternate setting
    pub fn add_function(
        &mut self,
        desc: InterfaceDescriptor,
        class_descriptors: Vec<u8>,
        ops: Arc<dyn FunctionOps>,
        limit: usize,
    ) -> Result<()> {
        if usize::from(desc.interface_number) >= INTERFACE_NUM_MAX {
            return Err(Error::Inval);
        }
        if let Some(func) = self.function(desc.interface_number) {
            if func.alt(desc.alternate_setting).is_some() {
                return Err(Error::Exist);
            }
        }
        self.grow(InterfaceDescriptor::LEN + class_descriptors.len(), limit)?;
        let setting = AltSetting {
            desc,
            class_descriptors,
            endpoints: Vec::new(),
            ops,
        };
        match self.function_mut(desc.interface_number) {
            Some(func) => func.alts.push(setting),
            None => self.functions.push(FunctionHeader {
                number: desc.interface_number,
                association: None,
                alts: alloc::vec![setting],
            }),
        }
        Ok(())
    }

    /// Add a group of interfaces behind an interface association
    ///
    /// The group is all or nothing. If any interface can't be added, the ones
    /// already added are removed again.
    pub fn add_association(
        &mut self,
        mut iad: InterfaceAssociationDescriptor,
        functions: Vec<(InterfaceDescriptor, Vec<u8>, Arc<dyn FunctionOps>)>,
        limit: usize,
    ) -> Result<()> {
        let first = usize::from(iad.first_interface);
        let count = functions.len();
        if count == 0 || first + count > INTERFACE_NUM_MAX {
            return Err(Error::Inval);
        }
        iad.interface_count = count as u8;
        if (first..first + count).any(|number| self.function(number as u8).is_some()) {
            return Err(Error::Exist);
        }

        let headers = self.functions.len();
        let total_len = self.total_len;
        let result = self.grow(InterfaceAssociationDescriptor::LEN, limit).and_then(|_| {
            functions
                .into_iter()
                .enumerate()
                .try_for_each(|(offset, (mut desc, class_descriptors, ops))| {
                    desc.interface_number = (first + offset) as u8;
                    self.add_function(desc, class_descriptors, ops, limit)
                })
        });
        if let Err(err) = result {
            warn!("rolling back association at interface {}", iad.first_interface);
            self.functions.truncate(headers);
            self.total_len = total_len;
            return Err(err);
        }
        if let Some(func) = self.function_mut(iad.first_interface) {
            func.association = Some(iad);
        }
        Ok(())
    }

    /// Claim an endpoint for `interface`, `alt`
    pub fn add_pipe(
        &mut self,
        registry: &mut EndpointRegistry,
        interface: u8,
        alt: u8,
        pipe: PipeInfo,
        limit: usize,
    ) -> Result<EndpointAddress> {
        let existing = self
            .function(interface)
            .and_then(|func| func.alt(alt))
            .ok_or(Error::NoDev)?
            .endpoints
            .iter()
            .map(|ep| ep.desc.address)
            .collect::<Vec<_>>();

        let request = EndpointAddress::from(pipe.address);
        if request.index() != 0 {
            if let Some(owner) = self.owner_of(request) {
                if owner != interface || existing.contains(&pipe.address) {
                    return Err(Error::Exist);
                }
            }
        }
        if self.total_len + EndpointDescriptor::LEN + pipe.class_descriptors.len() > limit {
            return Err(Error::Size);
        }

        let claims = &self.claims;
        let address = registry.alloc(request, pipe.kind, pipe.max_packet_size, |address| {
            claims.iter().any(|claim| claim.address == address)
        })?;
        self.grow(EndpointDescriptor::LEN + pipe.class_descriptors.len(), limit)?;

        match self.claims.iter_mut().find(|claim| claim.address == address) {
            Some(claim) => claim.refs += 1,
            None => self.claims.push(Claim {
                address,
                interface,
                refs: 1,
            }),
        }
        let setting = self
            .function_mut(interface)
            .and_then(|func| func.alts.iter_mut().find(|s| s.desc.alternate_setting == alt))
            .ok_or(Error::NoDev)?;
        setting.desc.num_endpoints += 1;
        setting.endpoints.push(AltEndpoint {
            desc: EndpointDescriptor {
                address: address.into(),
                attributes: pipe.kind as u8,
                max_packet_size: pipe.max_packet_size,
                interval: pipe.interval,
            },
            class_descriptors: pipe.class_descriptors,
        });
        Ok(address)
    }

    /// Returns the number of alternate settings sharing the endpoint
    #[cfg(test)]
    fn claim_refs(&self, address: EndpointAddress) -> usize {
        self.claims
            .iter()
            .find(|claim| claim.address == address)
            .map_or(0, |claim| claim.refs)
    }

    /// Write the configuration as the host sees it at `speed`
    ///
    /// `kind` is either the configuration or the other-speed configuration
    /// descriptor type. Below high speed, packet sizes are clamped to full
    /// speed limits.
    pub fn serialize(&self, buf: &mut [u8], kind: u8, speed: Speed) -> Result<usize> {
        if buf.len() < self.total_len {
            return Err(Error::Size);
        }
        let mut writer = Writer { buf, pos: 0 };
        let header = ConfigurationDescriptor {
            total_length: self.total_len as u16,
            num_interfaces: self.functions.len() as u8,
            configuration_value: self.value,
            configuration: self.name,
            attributes: self.attributes,
            max_power: self.max_power,
        };
        writer.put(&header.to_bytes(kind));
        for func in &self.functions {
            if let Some(iad) = &func.association {
                writer.put(&iad.to_bytes());
            }
            for setting in &func.alts {
                writer.put(&setting.desc.to_bytes());
                writer.put(&setting.class_descriptors);
                for ep in &setting.endpoints {
                    writer.put(&clamp(ep.desc, speed).to_bytes());
                    writer.put(&ep.class_descriptors);
                }
            }
        }
        Ok(writer.pos)
    }
}

/// Limit an endpoint to what `speed` allows
pub(crate) fn clamp(mut desc: EndpointDescriptor, speed: Speed) -> EndpointDescriptor {
    if speed == Speed::High {
        return desc;
    }
    let limit = match desc.transfer_type() {
        TransferType::Control | TransferType::Bulk | TransferType::Interrupt => 64,
        TransferType::Isochronous => 1023,
    };
    desc.max_packet_size = desc.packet_size().min(limit);
    desc
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}
