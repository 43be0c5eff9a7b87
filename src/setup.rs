//! SETUP packets

use crate::descriptor::descriptor_type;
use crate::error::{Error, Result};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

/// The 8 byte header of every control transfer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// `bmRequestType` for a standard, device-to-host, device request
const STANDARD_IN: u8 = 0x80;
const STANDARD_OUT: u8 = 0x00;

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::BadF);
        }
        Ok(Self {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data stage
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type)
    }

    pub fn request_kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Indicates if the transfer has a data stage
    pub fn has_data(&self) -> bool {
        self.length != 0
    }

    /// `(descriptor type, descriptor index)` of a GET_DESCRIPTOR request
    pub fn descriptor_type_index(&self) -> (u8, u8) {
        ((self.value >> 8) as u8, self.value as u8)
    }

    pub fn get_descriptor(kind: u8, index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            request_type: STANDARD_IN,
            request: Request::GET_DESCRIPTOR,
            value: u16::from(kind) << 8 | u16::from(index),
            index: lang_id,
            length,
        }
    }

    pub fn get_device_descriptor(length: u16) -> Self {
        Self::get_descriptor(descriptor_type::DEVICE, 0, 0, length)
    }

    pub fn get_config_descriptor(index: u8, length: u16) -> Self {
        Self::get_descriptor(descriptor_type::CONFIGURATION, index, 0, length)
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: STANDARD_OUT,
            request: Request::SET_ADDRESS,
            value: u16::from(address),
            ..Default::default()
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        Self {
            request_type: STANDARD_OUT,
            request: Request::SET_CONFIGURATION,
            value: u16::from(value),
            ..Default::default()
        }
    }

    pub fn get_configuration() -> Self {
        Self {
            request_type: STANDARD_IN,
            request: Request::GET_CONFIGURATION,
            length: 1,
            ..Default::default()
        }
    }

    pub fn set_interface(interface: u8, alt: u8) -> Self {
        Self {
            request_type: STANDARD_OUT | Recipient::Interface as u8,
            request: Request::SET_INTERFACE,
            value: u16::from(alt),
            index: u16::from(interface),
            length: 0,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for `endpoint`
    pub fn clear_halt(endpoint: u8) -> Self {
        Self {
            request_type: STANDARD_OUT | Recipient::Endpoint as u8,
            request: Request::CLEAR_FEATURE,
            value: Request::FEATURE_ENDPOINT_HALT,
            index: u16::from(endpoint),
            length: 0,
        }
    }

    pub fn get_status(recipient: Recipient, index: u16) -> Self {
        Self {
            request_type: STANDARD_IN | recipient as u8,
            request: Request::GET_STATUS,
            value: 0,
            index,
            length: 2,
        }
    }

    /// A class or vendor request with the given direction and recipient
    pub fn new(
        direction: UsbDirection,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: direction as u8 | (kind as u8) << 5 | recipient as u8,
            request,
            value,
            index,
            length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SetupPacket;
    use crate::Error;
    use usb_device::control::{Recipient, Request, RequestType};
    use usb_device::UsbDirection;

    #[test]
    fn wire_layout() {
        let setup = SetupPacket::get_device_descriptor(18);
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0, 0, 18, 0]);
        assert_eq!(SetupPacket::from_bytes(&setup.to_bytes()), Ok(setup));
        assert_eq!(SetupPacket::from_bytes(&[0; 7]), Err(Error::BadF));
    }

    #[test]
    fn decode_request_type() {
        let setup = SetupPacket::from_bytes(&[0xA1, 0x01, 0, 1, 2, 0, 8, 0]).unwrap();
        assert_eq!(setup.direction(), UsbDirection::In);
        assert_eq!(setup.request_kind(), RequestType::Class);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.descriptor_type_index(), (1, 0));
        assert!(setup.has_data());

        let setup = SetupPacket::from_bytes(&[0x60, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(setup.request_kind(), RequestType::Reserved);
        assert_eq!(setup.direction(), UsbDirection::Out);
        assert!(!setup.has_data());
    }

    #[test]
    fn constructors() {
        assert_eq!(
            SetupPacket::set_address(5).to_bytes(),
            [0x00, 0x05, 5, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            SetupPacket::clear_halt(0x81).to_bytes(),
            [0x02, Request::CLEAR_FEATURE, 0, 0, 0x81, 0, 0, 0]
        );
        let vendor = SetupPacket::new(
            UsbDirection::In,
            RequestType::Vendor,
            Recipient::Device,
            0x20,
            0,
            4,
            16,
        );
        assert_eq!(vendor.request_type, 0xC0);
    }
}
