use core::sync::atomic::{AtomicU32, Ordering};

use log::{info, warn};
use modular_bitfield::prelude::*;

use super::{
    addr::PhysAddr,
    consts::{DIRECTORY_ENTRIES, PAGE_SHIFT},
};

/// A page directory entry mapping one 4MiB page (CR4.PSE).
///
/// Bit layout, least significant first:
///
/// | bits  | field            |
/// |-------|------------------|
/// | 0     | present          |
/// | 1     | write access     |
/// | 2     | user access      |
/// | 3     | write-through    |
/// | 4     | cache disabled   |
/// | 5     | accessed         |
/// | 6     | reserved, zero   |
/// | 7     | large page (set) |
/// | 8     | ignored          |
/// | 9-11  | free for OS use  |
/// | 12-21 | padding (zero)   |
/// | 22-31 | frame number     |
#[bitfield(bits = 32)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectoryEntry {
    present: bool,
    pub write_access: bool,
    pub user_access: bool,
    write_through: bool,
    cache_disabled: bool,
    accessed: bool,
    reserved_zero: bool,
    large_page: bool,
    #[skip]
    ignored: B1,
    #[skip]
    os_use: B3,
    #[skip]
    padding: B10,
    frame_number: B10,
}

impl PageDirectoryEntry {
    /// An unmapped large-page entry.
    pub fn reset_state() -> Self {
        Self::new().with_large_page(true)
    }

    pub fn reset(&mut self) {
        *self = Self::reset_state();
    }

    pub fn is_present(&self) -> bool {
        self.present()
    }

    pub fn is_large_page(&self) -> bool {
        self.large_page()
    }

    pub fn is_accessed(&self) -> bool {
        self.accessed()
    }

    pub fn is_write_through(&self) -> bool {
        self.write_through()
    }

    pub fn is_cache_disabled(&self) -> bool {
        self.cache_disabled()
    }

    pub fn reserved_bit(&self) -> bool {
        self.reserved_zero()
    }

    pub fn frame(&self) -> usize {
        self.frame_number() as usize
    }

    /// Points the entry at the 4MiB frame containing `phys` and marks it present.
    pub fn set_physical_address(&mut self, phys: PhysAddr) {
        self.set_frame_number((phys.as_u32() >> PAGE_SHIFT) as u16);
        self.set_present(true);
    }

    pub fn physical_address(&self) -> PhysAddr {
        PhysAddr::new(u32::from(self.frame_number()) << PAGE_SHIFT)
    }

    pub fn bits(&self) -> u32 {
        u32::from(*self)
    }
}

/// The page directory: entry `i` maps virtual `[i * 4MiB, (i + 1) * 4MiB)`.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageDirectoryEntry; DIRECTORY_ENTRIES],
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            entries: [PageDirectoryEntry::reset_state(); DIRECTORY_ENTRIES],
        }
    }

    pub fn reset(&mut self) {
        self.entries.iter_mut().for_each(PageDirectoryEntry::reset);
    }

    pub fn entry(&self, index: usize) -> &PageDirectoryEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageDirectoryEntry {
        &mut self.entries[index]
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The paging control registers.
pub trait Mmu {
    /// Writes `directory` into CR3 and turns on large pages and paging (CR4.PSE, CR0.PG).
    /// Reloading the same directory flushes the TLB.
    fn load_directory(&mut self, directory: &PageTable);

    /// Clears CR0.PG.
    fn disable_paging(&mut self);
}

/// Access to the contents of physical frames.
pub trait PhysicalMemory {
    /// The kernel's view of the 4MiB frame starting at `frame`.
    fn frame_mut(&mut self, frame: PhysAddr) -> &mut [u8];
}

static NEXT_MANAGER_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u32);

impl ManagerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Owns the paging hardware and remembers which page manager currently drives it.
///
/// At most one manager is active at a time.
pub struct PagingContext<M> {
    mmu: M,
    current: Option<ManagerId>,
}

impl<M: Mmu> PagingContext<M> {
    pub const fn new(mmu: M) -> Self {
        Self { mmu, current: None }
    }

    pub fn current_manager(&self) -> Option<ManagerId> {
        self.current
    }

    pub fn is_active(&self, id: ManagerId) -> bool {
        self.current == Some(id)
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    /// Makes `id` the active manager and loads `table`.
    ///
    /// The single slot is replaced, so whichever manager was active before stops being
    /// active.
    pub(crate) fn activate(&mut self, id: ManagerId, table: &PageTable) {
        if let Some(previous) = self.current.replace(id) {
            if previous != id {
                warn!("Deactivating page manager {previous:?} in favour of {id:?}");
            }
        }

        self.mmu.load_directory(table);
        info!("Paging enabled, directory at {:#X}", table.address());
    }

    /// Loads `table` again if `id` is the active manager.
    pub(crate) fn reload(&mut self, id: ManagerId, table: &PageTable) {
        if self.is_active(id) {
            self.mmu.load_directory(table);
        }
    }

    /// Turns paging off if `id` is the active manager; returns whether it was.
    pub(crate) fn deactivate(&mut self, id: ManagerId) -> bool {
        if !self.is_active(id) {
            return false;
        }

        self.mmu.disable_paging();
        self.current = None;
        info!("Paging disabled");
        true
    }
}

impl<M: PhysicalMemory> PagingContext<M> {
    pub fn frame_mut(&mut self, frame: PhysAddr) -> &mut [u8] {
        self.mmu.frame_mut(frame)
    }
}
