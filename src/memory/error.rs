use log::error;
use thiserror::Error;

use super::addr::VirtAddr;

/// Conditions the memory subsystem cannot recover from. Each one stops the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("no free virtual page left")]
    VirtualSpaceExhausted,
    #[error("no free physical frame left")]
    PhysicalMemoryExhausted,
    #[error("free of {0} which is not inside a heap page")]
    UnmanagedFree(VirtAddr),
    #[error("a fresh heap page could not fit {size} bytes aligned to {align}")]
    FreshPageExhausted { size: usize, align: usize },
    #[error("allocation of {size} bytes aligned to {align} exceeds the 1MiB limit")]
    OversizedRequest { size: usize, align: usize },
    #[error("heap page {0} is not mapped")]
    UnmappedHeapPage(VirtAddr),
    #[error("corrupt allocation header before {0}")]
    CorruptHeader(VirtAddr),
}

/// Stops the machine.
///
/// There is nothing to unwind to this early in boot, so the reason is logged and the
/// simulation panics with it.
#[track_caller]
pub fn halt(reason: Fatal) -> ! {
    error!("HALT: {reason}");
    panic!("HALT: {reason}");
}
