mod logger;

use std::error::Error;

use apex_memory::{
    memory::{KernelMemory, PageTable, SimulatedMmu},
    BootConfig,
};
use logger::StdoutLogger;

fn main() -> Result<(), Box<dyn Error>> {
    let config = BootConfig::from_env()?;
    StdoutLogger::new(config.log_level).init()?;

    let mmu = match &config.memory_file {
        Some(path) => SimulatedMmu::backed_by_file(path, config.physical_frames)?,
        None => SimulatedMmu::anonymous(config.physical_frames)?,
    };
    let regions = mmu.memory_map();
    println!("* Initiated {} MiB of simulated RAM.", mmu.frames() * 4);

    let mut table = Box::new(PageTable::new());
    let memory = KernelMemory::boot(&mut table, mmu, &regions, &config);
    println!("* Paging enabled.");

    let greeting = memory.malloc(64);
    memory
        .with_bytes(greeting, 13, |bytes| bytes.copy_from_slice(b"Hello, APEX!\n"))
        .ok_or("heap allocation is not mapped")?;
    let table_ptr = memory.aligned_alloc(4096, 4096);
    println!("* Allocated {greeting} and {table_ptr}.");

    let page = memory.with_pager(|pager, ctx| {
        let page = pager.alloc_page(ctx);
        pager.free_page(ctx, page);
        page
    });
    println!("* Allocated and freed page {page}.");

    memory.free(table_ptr);
    memory.free(greeting);
    println!("* Heap pages: {:?}", memory.heap_pages());

    Ok(())
}
