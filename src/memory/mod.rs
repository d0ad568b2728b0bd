pub mod addr;
pub mod alloc;
pub mod bitmap;
pub mod boot;
pub mod consts;
pub mod error;
pub mod pager;
pub mod paging;
pub mod sim;

pub use addr::{PhysAddr, VirtAddr};
pub use alloc::{BlockMap, HeapManager, KernelMemory};
pub use boot::{MemoryRegion, RegionKind};
pub use error::{halt, Fatal};
pub use pager::PageManager;
pub use paging::{ManagerId, Mmu, PageDirectoryEntry, PageTable, PagingContext, PhysicalMemory};
pub use sim::{SimError, SimulatedMmu};

/// Aligns `value` to `align`. Always rounds up.
pub const fn align_up(value: usize, align: usize) -> usize {
    let remainder = value % align;
    if remainder == 0 {
        value // Already aligned
    } else {
        value + align - remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(32772, 16), 32784);
        assert_eq!(align_up(2051, 4), 2052);
    }
}
