use log::{debug, info};

use super::{addr::PhysAddr, align_up, consts::PAGE_SIZE, pager::PageManager};

/// Multiboot memory map entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Defective,
    Other(u32),
}

impl From<u32> for RegionKind {
    fn from(kind: u32) -> Self {
        match kind {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Defective,
            other => Self::Other(other),
        }
    }
}

/// One `(base, length, type)` tuple of the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    pub const fn available(base: u64, length: u64) -> Self {
        Self::new(base, length, RegionKind::Available)
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Start addresses of every whole 4MiB frame inside this region that a 32-bit
    /// page directory can reach.
    pub fn whole_frames(&self) -> impl Iterator<Item = PhysAddr> {
        let page = PAGE_SIZE as u64;
        let limit = u64::from(u32::MAX) + 1;
        // Clamp first so rounding a base near the top of the address space can't overflow
        let first = align_up(self.base.min(limit) as usize, PAGE_SIZE) as u64;
        let end = self.end().min(limit);

        (first..end)
            .step_by(PAGE_SIZE)
            .take_while(move |frame| frame + page <= end)
            .map(|frame| PhysAddr::new(frame as u32))
    }
}

impl PageManager<'_> {
    /// Hands every whole frame of the available regions back to the physical pool.
    ///
    /// Returns the number of frames freed.
    pub fn free_available_regions(&mut self, regions: &[MemoryRegion]) -> usize {
        let mut freed = 0;

        for region in regions {
            if region.kind != RegionKind::Available || region.length < PAGE_SIZE as u64 {
                debug!(
                    "Skipping region {:#X}+{:#X} ({:?})",
                    region.base, region.length, region.kind
                );
                continue;
            }

            for frame in region.whole_frames() {
                self.free_phys_page(frame);
                freed += 1;
            }
        }

        info!("Memory map freed {freed} physical frames");
        freed
    }
}
