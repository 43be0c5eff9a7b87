//! Enumeration of a newly attached device

use super::device::DeviceEntry;
use super::{control, HostConfig, HostEndpoint, HostInner};
use crate::descriptor::{ConfigurationDescriptor, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::pipe::Data;
use crate::setup::SetupPacket;
use crate::Speed;
use alloc::{sync::Arc, vec};

/// Bytes of the device descriptor read before the address is set
const DEVICE_DESCRIPTOR_HEAD: u16 = 8;

fn control_in(
    host: &Arc<HostInner>,
    ep0: &HostEndpoint,
    setup: &SetupPacket,
    buf: &mut [u8],
) -> Result<usize> {
    let n = control::run(
        host,
        ep0,
        setup,
        Data::In(buf),
        host.options.enumeration_timeout_ms,
    )?;
    if n < usize::from(setup.length) {
        warn!(
            "dev {} short descriptor: {} of {} bytes",
            ep0.device_address, n, setup.length
        );
        return Err(Error::Proto);
    }
    Ok(n)
}

fn control_out(host: &Arc<HostInner>, ep0: &HostEndpoint, setup: &SetupPacket) -> Result<()> {
    control::run(
        host,
        ep0,
        setup,
        Data::Out(&[]),
        host.options.enumeration_timeout_ms,
    )?;
    Ok(())
}

/// Check bMaxPacketSize0 against the bus speed
fn ep0_max_packet_size(speed: Speed, mps0: u8) -> Result<u16> {
    let valid = match speed {
        Speed::Low => mps0 == 8,
        Speed::Full => matches!(mps0, 8 | 16 | 32 | 64),
        Speed::High => mps0 == 64,
    };
    if !valid {
        warn!("bMaxPacketSize0 {} invalid at {:?} speed", mps0, speed);
        return Err(Error::Proto);
    }
    Ok(u16::from(mps0))
}

/// Address, describe and configure the device answering at address zero
pub(super) fn enumerate(
    host: &Arc<HostInner>,
    port: u8,
    speed: Speed,
) -> Result<Arc<DeviceEntry>> {
    let default_mps = if speed == Speed::Low { 8 } else { 64 };
    let mut ep0 = HostEndpoint::control(0, speed, default_mps);

    let mut head = [0; DEVICE_DESCRIPTOR_HEAD as usize];
    let setup = SetupPacket::get_device_descriptor(DEVICE_DESCRIPTOR_HEAD);
    control_in(host, &ep0, &setup, &mut head)?;
    ep0.descriptor.max_packet_size = ep0_max_packet_size(speed, head[7])?;

    let address = host.address_alloc()?;
    debug!("ENUM port {} {:?} address {}", port, speed, address);
    configure(host, port, ep0, address).map_err(|err| {
        warn!("ENUM port {} failed: {:?}", port, err);
        host.address_free(address);
        err
    })
}

fn configure(
    host: &Arc<HostInner>,
    port: u8,
    mut ep0: HostEndpoint,
    address: u8,
) -> Result<Arc<DeviceEntry>> {
    control_out(host, &ep0, &SetupPacket::set_address(address))?;
    host.lib.os().delay_ms(host.options.set_address_delay_ms);
    ep0.device_address = address;

    let mut buf = [0; DeviceDescriptor::LEN];
    let setup = SetupPacket::get_device_descriptor(DeviceDescriptor::LEN as u16);
    control_in(host, &ep0, &setup, &mut buf)?;
    let descriptor = DeviceDescriptor::parse(&buf)?;
    if descriptor.num_configurations == 0 {
        return Err(Error::BadF);
    }

    let mut header = [0; ConfigurationDescriptor::LEN];
    let setup = SetupPacket::get_config_descriptor(0, ConfigurationDescriptor::LEN as u16);
    control_in(host, &ep0, &setup, &mut header)?;
    let total = ConfigurationDescriptor::parse(&header)?.total_length;
    if usize::from(total) < ConfigurationDescriptor::LEN {
        return Err(Error::BadF);
    }

    let mut blob = vec![0; usize::from(total)];
    control_in(host, &ep0, &SetupPacket::get_config_descriptor(0, total), &mut blob)?;
    let config = HostConfig::parse(&blob)?;

    let value = config.descriptor.configuration_value;
    control_out(host, &ep0, &SetupPacket::set_configuration(value))?;
    info!(
        "ATTACH dev {} {:x}:{:x} port {} config {}",
        address, descriptor.id_vendor, descriptor.id_product, port, value
    );

    Ok(Arc::new(DeviceEntry::new(host, port, ep0, descriptor, config)))
}
