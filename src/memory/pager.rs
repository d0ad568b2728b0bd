use log::debug;

use super::{
    addr::{PhysAddr, VirtAddr},
    bitmap::PageBitmap,
    consts::DIRECTORY_ENTRIES,
    error::{halt, Fatal},
    paging::{ManagerId, Mmu, PageDirectoryEntry, PageTable, PagingContext},
};

/// Tracks which 4MiB virtual pages and physical frames are in use and keeps the
/// page directory in sync with that.
///
/// Every change to the directory is flushed to the hardware right away if this
/// manager is the active one.
pub struct PageManager<'t> {
    id: ManagerId,
    table: &'t mut PageTable,
    /// Set bit = virtual page allocated.
    virtual_map: PageBitmap,
    /// Set bit = physical frame allocated.
    physical_map: PageBitmap,
}

impl<'t> PageManager<'t> {
    /// Takes over `table` and resets every entry in it.
    ///
    /// All virtual memory starts off free, all physical memory starts off allocated
    /// until the boot memory map hands ranges back.
    pub fn init(table: &'t mut PageTable) -> Self {
        table.reset();

        let manager = Self {
            id: ManagerId::next(),
            table,
            virtual_map: PageBitmap::empty(),
            physical_map: PageBitmap::full(),
        };
        debug!(
            "Page manager {:?} owns directory at {:#X}",
            manager.id,
            manager.table.address()
        );
        manager
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn is_enabled<M: Mmu>(&self, ctx: &PagingContext<M>) -> bool {
        ctx.is_active(self.id)
    }

    /// Makes this the active manager, deactivating whichever one was before.
    pub fn enable_paging<M: Mmu>(&mut self, ctx: &mut PagingContext<M>) {
        ctx.activate(self.id, &*self.table);
    }

    /// Reloads the directory into the hardware, but only if this manager is active.
    pub fn update_paging<M: Mmu>(&self, ctx: &mut PagingContext<M>) {
        ctx.reload(self.id, &*self.table);
    }

    /// Turns paging off if this is the active manager, otherwise does nothing.
    pub fn disable_paging<M: Mmu>(&mut self, ctx: &mut PagingContext<M>) {
        ctx.deactivate(self.id);
    }

    /// Maps the virtual page containing `virt` to the frame containing `phys` and
    /// marks both as allocated.
    ///
    /// Mapping a virtual page that is already mapped is not checked for; the old
    /// mapping is overwritten and its frame stays marked as allocated.
    pub fn alloc_page_at<M: Mmu>(
        &mut self,
        ctx: &mut PagingContext<M>,
        virt: VirtAddr,
        phys: PhysAddr,
    ) {
        self.alloc_virt_page(virt);
        self.alloc_phys_page(phys);
        self.install(virt.page_index(), phys);
        self.update_paging(ctx);
    }

    /// Allocates the lowest free virtual page, backs it with the lowest free frame and
    /// returns its address.
    ///
    /// Halts when either the virtual address space or physical memory is exhausted.
    pub fn alloc_page<M: Mmu>(&mut self, ctx: &mut PagingContext<M>) -> VirtAddr {
        let Some(virt_index) = self.virtual_map.first_clear(DIRECTORY_ENTRIES) else {
            halt(Fatal::VirtualSpaceExhausted);
        };
        let Some(phys_index) = self.physical_map.first_clear(DIRECTORY_ENTRIES) else {
            halt(Fatal::PhysicalMemoryExhausted);
        };

        let virt = VirtAddr::from_page_index(virt_index);
        let phys = PhysAddr::from_page_index(phys_index);
        self.alloc_page_at(ctx, virt, phys);
        virt
    }

    /// Unmaps the page containing `virt` and releases both it and its frame.
    ///
    /// The page must be mapped; debug builds panic otherwise.
    pub fn free_page<M: Mmu>(&mut self, ctx: &mut PagingContext<M>, virt: VirtAddr) {
        let index = virt.page_index();
        let entry = *self.table.entry(index);
        debug_assert!(entry.is_present(), "free of unmapped page {virt}");
        let phys = entry.physical_address();

        self.free_virt_page(virt);
        self.free_phys_page(phys);
        self.table.entry_mut(index).reset();
        debug!("Unmapped {virt} (frame {phys})");

        self.update_paging(ctx);
    }

    pub fn free_phys_page(&mut self, phys: PhysAddr) {
        self.physical_map.clear(phys.page_index());
    }

    pub fn alloc_phys_page(&mut self, phys: PhysAddr) {
        self.physical_map.set(phys.page_index());
    }

    pub fn free_virt_page(&mut self, virt: VirtAddr) {
        self.virtual_map.clear(virt.page_index());
    }

    pub fn alloc_virt_page(&mut self, virt: VirtAddr) {
        self.virtual_map.set(virt.page_index());
    }

    pub fn is_virt_allocated(&self, virt: VirtAddr) -> bool {
        self.virtual_map.test(virt.page_index())
    }

    pub fn is_phys_allocated(&self, phys: PhysAddr) -> bool {
        self.physical_map.test(phys.page_index())
    }

    /// The physical address `virt` resolves to, if its page is mapped.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.table.entry(virt.page_index());
        entry
            .is_present()
            .then(|| entry.physical_address().add(virt.page_offset()))
    }

    pub fn entry(&self, virt: VirtAddr) -> PageDirectoryEntry {
        *self.table.entry(virt.page_index())
    }

    pub fn table(&self) -> &PageTable {
        self.table
    }

    pub fn virtual_map(&self) -> &PageBitmap {
        &self.virtual_map
    }

    pub fn physical_map(&self) -> &PageBitmap {
        &self.physical_map
    }

    /// Direct access to the virtual map, e.g. to pre-reserve address space.
    pub fn virtual_map_mut(&mut self) -> &mut PageBitmap {
        &mut self.virtual_map
    }

    fn install(&mut self, index: usize, phys: PhysAddr) {
        let entry = self.table.entry_mut(index);
        entry.set_physical_address(phys);
        entry.set_write_access(true);
        debug!(
            "Mapped {} -> {}",
            VirtAddr::from_page_index(index),
            entry.physical_address()
        );
    }
}
