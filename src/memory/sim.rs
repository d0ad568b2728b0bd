use std::{
    fs::OpenOptions,
    io::{self, Seek, Write},
    path::Path,
};

use log::trace;
use memmap::{MmapMut, MmapOptions};
use thiserror::Error;

use super::{
    addr::PhysAddr,
    boot::{MemoryRegion, RegionKind},
    consts::{DIRECTORY_ENTRIES, PAGE_SIZE},
    paging::{Mmu, PageTable, PhysicalMemory},
};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("simulated RAM must be 1 to 1024 frames, got {0}")]
    FrameCount(usize),
    #[error("failed to map simulated RAM: {0}")]
    Map(#[from] io::Error),
}

/// A machine with `frames` 4MiB frames of RAM starting at physical address 0, backed
/// by a memory mapping, and a paging register that records what is loaded into it.
pub struct SimulatedMmu {
    memory: MmapMut,
    frames: usize,
    directory: Option<usize>,
    paging: bool,
    loads: usize,
}

impl SimulatedMmu {
    /// RAM backed by anonymous memory.
    pub fn anonymous(frames: usize) -> Result<Self, SimError> {
        let len = Self::checked_len(frames)?;
        Ok(Self::with_memory(MmapMut::map_anon(len)?, frames))
    }

    /// RAM backed by a zeroed memory file at `path`, so it can be inspected afterwards.
    pub fn backed_by_file(path: impl AsRef<Path>, frames: usize) -> Result<Self, SimError> {
        let len = Self::checked_len(frames)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Set the size of the file to the memory size and clear it
        file.set_len(len as u64)?;
        file.rewind()?;
        file.write_all(&vec![0u8; len])?;

        let memory = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self::with_memory(memory, frames))
    }

    fn with_memory(memory: MmapMut, frames: usize) -> Self {
        Self {
            memory,
            frames,
            directory: None,
            paging: false,
            loads: 0,
        }
    }

    fn checked_len(frames: usize) -> Result<usize, SimError> {
        if frames == 0 || frames > DIRECTORY_ENTRIES {
            return Err(SimError::FrameCount(frames));
        }
        Ok(frames * PAGE_SIZE)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// The memory map a boot loader would report for this machine: all of RAM available,
    /// followed by a reserved hole.
    pub fn memory_map(&self) -> Vec<MemoryRegion> {
        let ram = (self.frames * PAGE_SIZE) as u64;
        vec![
            MemoryRegion::available(0, ram),
            MemoryRegion::new(ram, PAGE_SIZE as u64, RegionKind::Reserved),
        ]
    }

    /// How many times a directory was written to the paging register.
    pub fn loads(&self) -> usize {
        self.loads
    }

    pub fn is_paging_enabled(&self) -> bool {
        self.paging
    }

    /// Address of the directory last loaded.
    pub fn loaded_directory(&self) -> Option<usize> {
        self.directory
    }
}

impl Mmu for SimulatedMmu {
    fn load_directory(&mut self, directory: &PageTable) {
        self.directory = Some(directory.address());
        self.paging = true;
        self.loads += 1;
        trace!("CR3 <- {:#X}", directory.address());
    }

    fn disable_paging(&mut self) {
        self.paging = false;
        trace!("CR0.PG <- 0");
    }
}

impl PhysicalMemory for SimulatedMmu {
    fn frame_mut(&mut self, frame: PhysAddr) -> &mut [u8] {
        let index = frame.page_index();
        assert!(
            index < self.frames,
            "Bus error: frame {frame} is outside simulated RAM"
        );
        &mut self.memory[index * PAGE_SIZE..][..PAGE_SIZE]
    }
}
