//! Monotonic address-space allocators for MMIO windows and, in RSLD mode,
//! the shared-memory arena. Grounded on kvmtool's
//! `virtio_mmio_get_io_space_block`/`virtio_mmio_get_shm_space_block`
//! (`virtio/mmio.c`), which hand out non-overlapping regions from a single
//! advancing cursor rather than a general-purpose allocator — exactly the
//! shape §3 Invariant 1 needs (`SPEC_FULL.md` §B).

use crate::error::{Result, TransportError};
use crate::regs::IO_SIZE;

/// Hands out non-overlapping `IO_SIZE`-byte MMIO windows starting at
/// `base`. One instance per VM; every [`crate::transport::MmioTransport`]
/// registration draws its `window_base` from here (§3 Invariant 1).
#[derive(Debug)]
pub struct MmioAllocator {
    next: u64,
    limit: u64,
}

impl MmioAllocator {
    pub fn new(base: u64, limit: u64) -> Self {
        MmioAllocator { next: base, limit }
    }

    pub fn alloc(&mut self) -> Result<u64> {
        let addr = self.next;
        let end = addr
            .checked_add(u64::from(IO_SIZE))
            .ok_or_else(|| TransportError::Resource("mmio address space overflow".into()))?;
        if end > self.limit {
            return Err(TransportError::Resource(
                "mmio address space exhausted".into(),
            ));
        }
        self.next = end;
        Ok(addr)
    }
}

/// Hands out shared-memory blocks from a single cursor seeded at
/// `hvl_shmem_phys_addr + FDT_MAX_SIZE` (§4.7, §6 "shared-memory layout",
/// `SPEC_FULL.md` §B). Each device's block holds its shadow header, its
/// configuration window, and `ops.get_mem_size()` bytes of private arena.
#[derive(Debug)]
pub struct ShmemAllocator {
    next: u64,
    limit: u64,
}

impl ShmemAllocator {
    pub fn new(shmem_phys_addr: u64, fdt_max_size: u64, limit: u64) -> Self {
        ShmemAllocator {
            next: shmem_phys_addr + fdt_max_size,
            limit,
        }
    }

    pub fn alloc(&mut self, header_and_config_size: u64, private_arena_size: u64) -> Result<u64> {
        let addr = self.next;
        let size = header_and_config_size
            .checked_add(private_arena_size)
            .ok_or_else(|| TransportError::Resource("shmem block size overflow".into()))?;
        let end = addr
            .checked_add(size)
            .ok_or_else(|| TransportError::Resource("shmem address space overflow".into()))?;
        if end > self.limit {
            return Err(TransportError::Resource(
                "shared-memory arena exhausted".into(),
            ));
        }
        self.next = end;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_mmio_windows_never_overlap() {
        let mut alloc = MmioAllocator::new(0x1000_0000, 0x2000_0000);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert!(a + u64::from(IO_SIZE) <= b);
    }

    #[test]
    fn mmio_allocator_reports_resource_error_when_exhausted() {
        let mut alloc = MmioAllocator::new(0x1000_0000, 0x1000_0000 + u64::from(IO_SIZE));
        assert!(alloc.alloc().is_ok());
        assert!(alloc.alloc().is_err());
    }

    #[test]
    fn shmem_allocator_seeds_after_fdt_region() {
        let mut alloc = ShmemAllocator::new(0x4000_0000, 0x1000, 0x1_0000_0000);
        let first = alloc.alloc(256, 4096).unwrap();
        assert_eq!(first, 0x4000_1000);
        let second = alloc.alloc(256, 4096).unwrap();
        assert_eq!(second, first + 256 + 4096);
    }
}
