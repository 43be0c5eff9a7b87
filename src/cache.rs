//! Cache maintenance operations
//!
//! These functions were adapted from the cortex-m (0.7.1) crate.
//! cortex-m only lets you access these functions when you have
//! the SCB in cortex_m::Peripherals collection. But, we neither want
//! to steal the peripheral(s), nor own them. So, we're duplicating
//! the routines that we need, and making sure that we're using
//! them safely.
//!
//! cortex-m crate available at <https://github.com/rust-embedded/cortex-m>.

/// Cache lines are fixed to 32 bytes on Cortex-M7 and not present in earlier Cortex-M
pub const LINESIZE: usize = 32;

#[derive(Clone, Copy)]
enum Op {
    Clean,
    Invalidate,
    CleanInvalidate,
}

fn by_address(op: Op, addr: usize, size: usize) {
    // No-op zero sized operations
    if size == 0 {
        return;
    }

    // Safety: write-only registers, pointer to static memory
    let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

    cortex_m::asm::dsb();

    let num_lines = ((size - 1) / LINESIZE) + 1;
    let mut addr = addr & !(LINESIZE - 1);

    for _ in 0..num_lines {
        // Safety: write to Cortex-M write-only register
        unsafe {
            match op {
                Op::Clean => cbp.dccmvac.write(addr as u32),
                Op::Invalidate => cbp.dcimvac.write(addr as u32),
                Op::CleanInvalidate => cbp.dccimvac.write(addr as u32),
            }
        };
        addr += LINESIZE;
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Cleans D-cache by address.
///
/// Writes dirty lines covering `addr..addr + size` back to main memory so
/// that a DMA read observes what the CPU wrote.
pub fn clean_dcache_by_address(addr: usize, size: usize) {
    by_address(Op::Clean, addr, size)
}

/// Invalidates D-cache by address.
///
/// Surrounding data sharing the first or last cache line is discarded too;
/// callers align DMA buffers to [`LINESIZE`].
pub fn invalidate_dcache_by_address(addr: usize, size: usize) {
    by_address(Op::Invalidate, addr, size)
}

/// Cleans and invalidates D-cache by address.
///
/// Cleaning and invalidating causes data in the D-cache to be written back to main memory,
/// and then marks that data in the D-cache as invalid, causing future reads to first fetch
/// from main memory.
pub fn clean_invalidate_dcache_by_address(addr: usize, size: usize) {
    by_address(Op::CleanInvalidate, addr, size)
}
