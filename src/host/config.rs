//! Configurations read back from a device

use crate::descriptor::{
    descriptor_type, ConfigurationDescriptor, DescriptorIter, EndpointDescriptor,
    InterfaceAssociationDescriptor, InterfaceDescriptor,
};
use crate::error::{Error, Result};
use alloc::vec::Vec;

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAlt {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class and vendor descriptors that follow the interface descriptor, in
    /// order, including those placed between endpoint descriptors
    pub class_descriptors: Vec<u8>,
}

/// All alternate settings of one interface number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub number: u8,
    pub association: Option<InterfaceAssociationDescriptor>,
    pub alts: Vec<InterfaceAlt>,
}

impl HostInterface {
    pub fn alt(&self, alternate_setting: u8) -> Option<&InterfaceAlt> {
        self.alts
            .iter()
            .find(|alt| alt.descriptor.alternate_setting == alternate_setting)
    }
}

/// A parsed configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub descriptor: ConfigurationDescriptor,
    pub interfaces: Vec<HostInterface>,
}

impl HostConfig {
    /// Parse a complete configuration descriptor blob
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut descriptors = DescriptorIter::new(buf);
        let header = descriptors.next().ok_or(Error::BadF)??;
        let descriptor = ConfigurationDescriptor::parse(header.bytes)?;
        if usize::from(descriptor.total_length) > buf.len() {
            return Err(Error::BadF);
        }

        let mut interfaces: Vec<HostInterface> = Vec::new();
        let mut association: Option<InterfaceAssociationDescriptor> = None;
        // (interface index, alt index) of the descriptor being filled
        let mut current: Option<(usize, usize)> = None;
        for raw in descriptors {
            let raw = raw?;
            match raw.kind {
                descriptor_type::INTERFACE_ASSOCIATION => {
                    association = Some(InterfaceAssociationDescriptor::parse(raw.bytes)?);
                }
                descriptor_type::INTERFACE => {
                    let desc = InterfaceDescriptor::parse(raw.bytes)?;
                    let number = desc.interface_number;
                    let grouped = association.filter(|iad| {
                        number >= iad.first_interface
                            && number - iad.first_interface < iad.interface_count
                    });
                    let index = match interfaces.iter().position(|i| i.number == number) {
                        Some(index) => index,
                        None => {
                            interfaces.push(HostInterface {
                                number,
                                association: grouped,
                                alts: Vec::new(),
                            });
                            interfaces.len() - 1
                        }
                    };
                    let alts = &mut interfaces[index].alts;
                    if alts
                        .iter()
                        .any(|alt| alt.descriptor.alternate_setting == desc.alternate_setting)
                    {
                        warn!(
                            "duplicate interface {} alt {}",
                            number, desc.alternate_setting
                        );
                        return Err(Error::BadF);
                    }
                    alts.push(InterfaceAlt {
                        descriptor: desc,
                        endpoints: Vec::new(),
                        class_descriptors: Vec::new(),
                    });
                    current = Some((index, alts.len() - 1));
                }
                descriptor_type::ENDPOINT => {
                    let (interface, alt) = current.ok_or(Error::BadF)?;
                    let endpoint = EndpointDescriptor::parse(raw.bytes)?;
                    interfaces[interface].alts[alt].endpoints.push(endpoint);
                }
                _ => {
                    if let Some((interface, alt)) = current {
                        interfaces[interface].alts[alt]
                            .class_descriptors
                            .extend_from_slice(raw.bytes);
                    }
                }
            }
        }

        for interface in &interfaces {
            for alt in &interface.alts {
                if alt.endpoints.len() != usize::from(alt.descriptor.num_endpoints) {
                    warn!(
                        "interface {} alt {} announces {} endpoints, has {}",
                        interface.number,
                        alt.descriptor.alternate_setting,
                        alt.descriptor.num_endpoints,
                        alt.endpoints.len()
                    );
                }
            }
        }
        Ok(Self {
            descriptor,
            interfaces,
        })
    }

    pub fn interface(&self, number: u8) -> Option<&HostInterface> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    /// Find `address` in alternate setting `alts[i]` of each interface `i`
    pub(crate) fn endpoint(&self, address: u8, alts: &[u8]) -> Option<EndpointDescriptor> {
        self.interfaces.iter().find_map(|interface| {
            let current = alts.get(usize::from(interface.number)).copied()?;
            interface
                .alt(current)?
                .endpoints
                .iter()
                .find(|ep| ep.address == address)
                .copied()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::HostConfig;
    use crate::descriptor::descriptor_type;
    use crate::testing;
    use crate::Error;

    #[test]
    fn parse_interfaces_and_alts() {
        let config = HostConfig::parse(&testing::emulated_config()).unwrap();
        assert_eq!(config.descriptor.configuration_value, 1);
        assert_eq!(config.interfaces.len(), 3);

        let bulk = config.interface(0).unwrap();
        assert_eq!(bulk.alts.len(), 1);
        assert_eq!(bulk.alts[0].endpoints.len(), 2);
        assert!(bulk.association.is_none());

        let audio = config.interface(1).unwrap();
        assert_eq!(audio.alts.len(), 2);
        assert!(audio.alt(0).unwrap().endpoints.is_empty());
        let streaming = audio.alt(1).unwrap();
        assert_eq!(streaming.endpoints[0].address, 0x83);
        assert_eq!(streaming.class_descriptors[1], descriptor_type::CS_INTERFACE);

        assert!(config.endpoint(0x83, &[0, 0]).is_none());
        assert_eq!(config.endpoint(0x83, &[0, 1]).unwrap().max_packet_size, 192);
        assert_eq!(config.endpoint(0x02, &[0, 0]).unwrap().max_packet_size, 512);
    }

    #[test]
    fn association_covers_its_interfaces() {
        let mut blob = testing::emulated_config();
        // IAD over interfaces 0 and 1, right after the header
        let iad = [8, descriptor_type::INTERFACE_ASSOCIATION, 0, 2, 0xFF, 0, 0, 0];
        blob.splice(9..9, iad);
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());
        let config = HostConfig::parse(&blob).unwrap();
        assert_eq!(config.interface(1).unwrap().association.unwrap().interface_count, 2);
    }

    #[test]
    fn reject_malformed() {
        let blob = testing::emulated_config();
        assert_eq!(HostConfig::parse(&blob[..20]), Err(Error::BadF));
        let mut overrun = blob.clone();
        overrun[9] = 200;
        assert_eq!(HostConfig::parse(&overrun), Err(Error::BadF));
        // An endpoint before any interface
        let mut orphan = blob[..9].to_vec();
        orphan.extend_from_slice(&[7, descriptor_type::ENDPOINT, 0x81, 2, 0, 2, 0]);
        orphan[2] = 16;
        assert_eq!(HostConfig::parse(&orphan), Err(Error::BadF));
    }
}
