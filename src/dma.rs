//! DMA mapping seam
//!
//! The stack never assumes cache coherency. Before a transfer reaches the
//! hardware driver, its buffer is mapped with a [`DmaMapper`]; when the
//! transfer completes, the mapping is torn down again.

use crate::error::Result;
use usb_device::UsbDirection;

/// Maps transfer buffers for DMA
pub trait DmaMapper: Send + Sync {
    /// Prepare `buffer` for a transfer in `direction`, returning the bus address
    fn map(&self, buffer: &mut [u8], direction: UsbDirection) -> Result<usize>;
    /// Undo a mapping produced by [`map()`](DmaMapper::map)
    fn unmap(&self, addr: usize, buffer: &mut [u8], direction: UsbDirection);
    /// Required alignment for DMA buffers, in bytes
    fn align(&self) -> usize {
        1
    }
}

/// Rounds `len` up to the next multiple of `align`
///
/// `align` must be a power of two.
pub const fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// Identity mapping for cache-coherent memory
///
/// The bus address is the CPU address. Use this on hosted targets, and on
/// MCUs without a data cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct Coherent;

impl DmaMapper for Coherent {
    fn map(&self, buffer: &mut [u8], _: UsbDirection) -> Result<usize> {
        Ok(buffer.as_mut_ptr() as usize)
    }
    fn unmap(&self, _: usize, _: &mut [u8], _: UsbDirection) {}
}

/// Cortex-M7 D-cache maintenance
///
/// OUT buffers are cleaned before the hardware reads them. IN buffers are
/// cleaned and invalidated before the transfer, and invalidated again after
/// the hardware wrote them.
#[cfg(target_arch = "arm")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CortexM7Cache;

#[cfg(target_arch = "arm")]
impl DmaMapper for CortexM7Cache {
    fn map(&self, buffer: &mut [u8], direction: UsbDirection) -> Result<usize> {
        let addr = buffer.as_mut_ptr() as usize;
        if addr % crate::cache::LINESIZE != 0 {
            warn!("DMA buffer {:x} not cache aligned", addr);
        }
        match direction {
            UsbDirection::Out => crate::cache::clean_dcache_by_address(addr, buffer.len()),
            UsbDirection::In => {
                crate::cache::clean_invalidate_dcache_by_address(addr, buffer.len())
            }
        }
        Ok(addr)
    }
    fn unmap(&self, addr: usize, buffer: &mut [u8], direction: UsbDirection) {
        if direction == UsbDirection::In {
            crate::cache::invalidate_dcache_by_address(addr, buffer.len());
        }
    }
    fn align(&self) -> usize {
        crate::cache::LINESIZE
    }
}

#[cfg(test)]
mod tests {
    use super::{align_up, Coherent, DmaMapper};
    use usb_device::UsbDirection;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn coherent_is_identity() {
        let mut buffer = [0u8; 16];
        let addr = Coherent.map(&mut buffer, UsbDirection::In).unwrap();
        assert_eq!(addr, buffer.as_ptr() as usize);
        assert_eq!(Coherent.align(), 1);
    }
}
