//! Hardware endpoint registry
//!
//! The controller driver registers its physical endpoints once. Pipes claim
//! them while the configurations are built.

use crate::error::{Error, Result};
use crate::os::TimedMutex;
use crate::transfer::TransferType;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use usb_device::endpoint::EndpointAddress;

bitflags::bitflags! {
    /// Transfer types that a hardware endpoint can carry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeSupport : u8 {
        const CONTROL = 1 << TransferType::Control as u8;
        const ISOCHRONOUS = 1 << TransferType::Isochronous as u8;
        const BULK = 1 << TransferType::Bulk as u8;
        const INTERRUPT = 1 << TransferType::Interrupt as u8;
    }
}

impl TypeSupport {
    pub const fn supports(self, kind: TransferType) -> bool {
        self.bits() & (1 << kind as u8) != 0
    }
}

/// A physical endpoint
pub(crate) struct HwEndpoint {
    pub address: EndpointAddress,
    pub types: TypeSupport,
    /// Largest packet the hardware can move; zero means unlimited
    pub mps_limit: u16,
    /// Current type and max packet size, set by the last allocation or by
    /// the alternate setting that enabled the endpoint
    kind: AtomicU8,
    mps: AtomicU16,
    pub enabled: AtomicBool,
    pub stalled: AtomicBool,
    /// Serializes synchronous calls on pipes using this endpoint
    pub sync: Arc<TimedMutex<()>>,
}

impl HwEndpoint {
    fn accepts(&self, kind: TransferType, mps: u16) -> bool {
        self.types.supports(kind) && (self.mps_limit == 0 || mps <= self.mps_limit)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn kind(&self) -> TransferType {
        TransferType::from_attributes(self.kind.load(Ordering::Acquire))
    }

    pub fn mps(&self) -> u16 {
        self.mps.load(Ordering::Acquire)
    }

    /// Set the current type and packet size
    pub fn select(&self, kind: TransferType, mps: u16) {
        self.kind.store(kind as u8, Ordering::Release);
        self.mps.store(mps, Ordering::Release);
    }
}

/// Registered endpoints, kept in registration order
#[derive(Default)]
pub(crate) struct EndpointRegistry {
    endpoints: Vec<HwEndpoint>,
}

impl EndpointRegistry {
    /// Add a physical endpoint
    pub fn register(
        &mut self,
        address: EndpointAddress,
        types: TypeSupport,
        mps_limit: u16,
    ) -> Result<()> {
        if address.index() == 0 {
            return Err(Error::Inval);
        }
        if self.get(address).is_some() {
            return Err(Error::Exist);
        }
        self.endpoints.push(HwEndpoint {
            address,
            types,
            mps_limit,
            kind: AtomicU8::new(TransferType::Bulk as u8),
            mps: AtomicU16::new(0),
            enabled: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            sync: Arc::new(TimedMutex::new(())),
        });
        Ok(())
    }

    pub fn get(&self, address: EndpointAddress) -> Option<&HwEndpoint> {
        self.endpoints.iter().find(|ep| ep.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HwEndpoint> {
        self.endpoints.iter()
    }

    /// Pick the endpoint for a new pipe
    ///
    /// A nonzero endpoint number in `request` selects that exact endpoint.
    /// Otherwise the first registered endpoint, in registration order, that
    /// isn't `taken` and accepts the direction, type and packet size wins.
    pub fn alloc(
        &mut self,
        request: EndpointAddress,
        kind: TransferType,
        mps: u16,
        taken: impl Fn(EndpointAddress) -> bool,
    ) -> Result<EndpointAddress> {
        let ep = if request.index() != 0 {
            self.endpoints
                .iter()
                .find(|ep| ep.address == request && ep.accepts(kind, mps))
        } else {
            let direction = request.direction();
            self.endpoints.iter().find(|ep| {
                ep.address.direction() == direction && ep.accepts(kind, mps) && !taken(ep.address)
            })
        }
        .ok_or(Error::NoDev)?;
        ep.select(kind, mps);
        debug!(
            "ALLOC EP{} {:?} {:?} MPS {}",
            ep.address.index(),
            ep.address.direction(),
            kind,
            mps
        );
        Ok(ep.address)
    }

    /// Disable and un-stall every endpoint
    pub fn reset(&self) {
        for ep in &self.endpoints {
            ep.set_enabled(false);
            ep.set_stalled(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EndpointRegistry, TypeSupport};
    use crate::{transfer::TransferType, Error};
    use usb_device::endpoint::EndpointAddress;

    fn addr(raw: u8) -> EndpointAddress {
        EndpointAddress::from(raw)
    }

    fn registry() -> EndpointRegistry {
        let mut registry = EndpointRegistry::default();
        registry.register(addr(0x81), TypeSupport::INTERRUPT, 64).unwrap();
        registry.register(addr(0x01), TypeSupport::all(), 512).unwrap();
        registry.register(addr(0x82), TypeSupport::BULK | TypeSupport::INTERRUPT, 512).unwrap();
        registry.register(addr(0x83), TypeSupport::ISOCHRONOUS, 0).unwrap();
        registry.register(addr(0x84), TypeSupport::all(), 512).unwrap();
        registry
    }

    #[test]
    fn register_twice() {
        let mut registry = registry();
        assert_eq!(registry.register(addr(0x81), TypeSupport::all(), 8), Err(Error::Exist));
        assert_eq!(registry.register(addr(0x80), TypeSupport::all(), 8), Err(Error::Inval));
    }

    #[test]
    fn first_fit_in_registration_order() {
        let mut registry = registry();
        let none = |_: EndpointAddress| false;
        assert_eq!(registry.alloc(addr(0x80), TransferType::Bulk, 512, none), Ok(addr(0x82)));
        assert_eq!(registry.alloc(addr(0x80), TransferType::Interrupt, 8, none), Ok(addr(0x81)));
        assert_eq!(registry.alloc(addr(0x80), TransferType::Interrupt, 128, none), Ok(addr(0x82)));
        assert_eq!(registry.alloc(addr(0x80), TransferType::Isochronous, 3072, none), Ok(addr(0x83)));
        assert_eq!(registry.alloc(addr(0x00), TransferType::Bulk, 64, none), Ok(addr(0x01)));

        let taken = |ep: EndpointAddress| u8::from(ep) == 0x82;
        assert_eq!(registry.alloc(addr(0x80), TransferType::Bulk, 512, taken), Ok(addr(0x84)));

        assert_eq!(registry.alloc(addr(0x00), TransferType::Bulk, 1024, none), Err(Error::NoDev));
        let ep = registry.get(addr(0x84)).unwrap();
        assert_eq!((ep.kind(), ep.mps()), (TransferType::Bulk, 512));
    }

    #[test]
    fn exact_address() {
        let mut registry = registry();
        assert_eq!(registry.alloc(addr(0x84), TransferType::Bulk, 64, |_| true), Ok(addr(0x84)));
        assert_eq!(registry.alloc(addr(0x85), TransferType::Bulk, 64, |_| false), Err(Error::NoDev));
        assert_eq!(registry.alloc(addr(0x81), TransferType::Bulk, 64, |_| false), Err(Error::NoDev));
    }
}
