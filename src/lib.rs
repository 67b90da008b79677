#![cfg_attr(not(test), no_std)]
#![deny(unused_must_use)]
#![deny(clippy::missing_safety_doc)]

extern crate alloc;

mod error;
mod list;
mod locked;
mod region;
mod strategy;
mod tree;
mod util;

pub use self::error::{AllocError, InitError, ParseStrategyError, ReleaseError};
pub use self::list::fat::FatListAllocator;
pub use self::list::thin::ThinListAllocator;
pub use self::list::{FreeBlock, FreeBlocks};
pub use self::locked::LockedHeap;
pub use self::region::HeapRegion;
pub use self::strategy::{AnyHeap, HeapAllocator, Strategy};
pub use self::tree::TreeAllocator;
pub use self::util::ALIGN;
