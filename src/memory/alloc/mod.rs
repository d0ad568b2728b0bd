mod block_map;

use log::{debug, info};
use spin::Mutex;

pub use self::block_map::BlockMap;
use super::{
    addr::{PhysAddr, VirtAddr},
    bitmap::PageBitmap,
    boot::MemoryRegion,
    consts::MAX_ALLOC,
    error::{halt, Fatal},
    pager::PageManager,
    paging::{Mmu, PageTable, PagingContext, PhysicalMemory},
};
use crate::config::BootConfig;

/// The kernel heap: a growing set of pages, each formatted as a [`BlockMap`].
///
/// Pages are taken from the page manager on demand and never given back.
pub struct HeapManager {
    /// Set bit = the virtual page with that index is a block map.
    pages: PageBitmap,
}

impl HeapManager {
    /// An empty heap; the first allocation brings in the first page.
    pub const fn init() -> Self {
        Self {
            pages: PageBitmap::empty(),
        }
    }

    /// Allocates `size` bytes aligned to at least `align` (0 for the natural alignment).
    ///
    /// Existing heap pages are tried lowest first. If none has room a new page is
    /// requested from `pager`. Halts if even a fresh page cannot hold the request.
    pub fn malloc<M: Mmu + PhysicalMemory>(
        &mut self,
        pager: &mut PageManager<'_>,
        ctx: &mut PagingContext<M>,
        size: usize,
        align: usize,
    ) -> VirtAddr {
        if size > MAX_ALLOC || align > MAX_ALLOC {
            halt(Fatal::OversizedRequest { size, align });
        }

        for index in self.pages.iter_set() {
            let page = VirtAddr::from_page_index(index);
            if let Some(ptr) = Self::block_map(pager, ctx, page).malloc(size, align) {
                return ptr;
            }
        }

        let page = pager.alloc_page(ctx);
        self.pages.set(page.page_index());
        info!("Heap grew by page {page}");

        let mut map = BlockMap::format(page, Self::page_bytes(pager, ctx, page));
        match map.malloc(size, align) {
            Some(ptr) => ptr,
            None => halt(Fatal::FreshPageExhausted { size, align }),
        }
    }

    /// Frees an allocation returned by [`HeapManager::malloc`].
    ///
    /// Halts if `ptr` is not inside a heap page.
    pub fn free<M: PhysicalMemory>(
        &mut self,
        pager: &PageManager<'_>,
        ctx: &mut PagingContext<M>,
        ptr: VirtAddr,
    ) {
        if !self.pages.test(ptr.page_index()) {
            halt(Fatal::UnmanagedFree(ptr));
        }

        Self::block_map(pager, ctx, ptr.page_base()).free(ptr);
    }

    pub fn is_heap_page(&self, virt: VirtAddr) -> bool {
        self.pages.test(virt.page_index())
    }

    /// Every heap page, lowest first.
    pub fn heap_pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.pages.iter_set().map(VirtAddr::from_page_index)
    }

    pub fn page_bitmap(&self) -> &PageBitmap {
        &self.pages
    }

    /// Opens the block map of the heap page at `page`.
    pub fn block_map<'a, M: PhysicalMemory>(
        pager: &PageManager<'_>,
        ctx: &'a mut PagingContext<M>,
        page: VirtAddr,
    ) -> BlockMap<'a> {
        BlockMap::open(page, Self::page_bytes(pager, ctx, page))
    }

    fn page_bytes<'a, M: PhysicalMemory>(
        pager: &PageManager<'_>,
        ctx: &'a mut PagingContext<M>,
        page: VirtAddr,
    ) -> &'a mut [u8] {
        let Some(frame) = pager.translate(page) else {
            halt(Fatal::UnmappedHeapPage(page));
        };
        ctx.frame_mut(frame)
    }
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::init()
    }
}

struct MemoryState<'t, M> {
    ctx: PagingContext<M>,
    pager: PageManager<'t>,
    heap: HeapManager,
}

/// Paging and heap behind one lock, so every entry point runs as a single critical
/// section.
pub struct KernelMemory<'t, M> {
    state: Mutex<MemoryState<'t, M>>,
}

impl<'t, M: Mmu + PhysicalMemory> KernelMemory<'t, M> {
    /// Runs the boot sequence over `table`: frees the available regions of the memory
    /// map, maps the kernel frames 1:1 and turns paging on.
    pub fn boot(
        table: &'t mut PageTable,
        mmu: M,
        regions: &[MemoryRegion],
        config: &BootConfig,
    ) -> Self {
        let mut ctx = PagingContext::new(mmu);
        let mut pager = PageManager::init(table);
        pager.free_available_regions(regions);

        for index in 0..config.kernel_frames {
            let virt = VirtAddr::from_page_index(index);
            pager.alloc_page_at(&mut ctx, virt, PhysAddr::from_page_index(index));
        }
        debug!("Identity mapped {} kernel frames", config.kernel_frames);

        pager.enable_paging(&mut ctx);

        Self {
            state: Mutex::new(MemoryState {
                ctx,
                pager,
                heap: HeapManager::init(),
            }),
        }
    }

    /// `malloc(size)` with the natural alignment for `size`.
    pub fn malloc(&self, size: usize) -> VirtAddr {
        self.aligned_alloc(0, size)
    }

    pub fn aligned_alloc(&self, align: usize, size: usize) -> VirtAddr {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state
            .heap
            .malloc(&mut state.pager, &mut state.ctx, size, align)
    }

    pub fn free(&self, ptr: VirtAddr) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.heap.free(&state.pager, &mut state.ctx, ptr);
    }

    /// Runs `f` over `len` bytes starting at `ptr`, or returns `None` if `ptr` is unmapped.
    ///
    /// The range must not cross a page boundary.
    pub fn with_bytes<R>(
        &self,
        ptr: VirtAddr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let phys = state.pager.translate(ptr)?;
        let frame = state.ctx.frame_mut(phys.page_base());
        let bytes = frame.get_mut(phys.page_offset()..phys.page_offset() + len)?;
        Some(f(bytes))
    }

    /// Runs `f` with the page manager and paging context held under the lock.
    pub fn with_pager<R>(
        &self,
        f: impl FnOnce(&mut PageManager<'t>, &mut PagingContext<M>) -> R,
    ) -> R {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        f(&mut state.pager, &mut state.ctx)
    }

    /// Runs `f` with the heap, page manager and paging context held under the lock.
    pub fn with_heap<R>(
        &self,
        f: impl FnOnce(&mut HeapManager, &mut PageManager<'t>, &mut PagingContext<M>) -> R,
    ) -> R {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        f(&mut state.heap, &mut state.pager, &mut state.ctx)
    }

    pub fn heap_pages(&self) -> Vec<VirtAddr> {
        self.state.lock().heap.heap_pages().collect()
    }
}
