//! Memory management for the APEX kernel: a page manager handing out 4MiB pages
//! through a single page directory, and a block heap built on top of those pages.
//!
//! The hardware is reached through the [`memory::Mmu`] and [`memory::PhysicalMemory`]
//! traits; [`memory::SimulatedMmu`] runs everything on a memory-mapped stand-in for RAM.

pub mod config;
pub mod memory;

pub use config::BootConfig;
