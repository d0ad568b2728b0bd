use core::fmt;

use super::consts::{PAGE_SHIFT, PAGE_SIZE};

macro_rules! address_type {
    ($name:ident) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(addr: u32) -> Self {
                Self(addr)
            }

            /// The address of the first byte of the 4MiB page with the given index.
            pub const fn from_page_index(index: usize) -> Self {
                Self((index << PAGE_SHIFT) as u32)
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }

            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            pub const fn page_index(self) -> usize {
                (self.0 >> PAGE_SHIFT) as usize
            }

            pub const fn page_offset(self) -> usize {
                self.0 as usize & (PAGE_SIZE - 1)
            }

            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_SIZE as u32 - 1))
            }

            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 as usize % align == 0
            }

            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#010X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010X}", self.0)
            }
        }
    };
}

address_type!(VirtAddr);
address_type!(PhysAddr);
