//! First-fit allocators keeping their free blocks in an address-ordered
//! linked list. Every block, free or allocated, starts with a header; the
//! list links are offsets from the heap base.
//!
//! Keeping the list sorted by address means that a single forward pass is
//! enough to merge all physically adjacent free blocks after a release.

use alloc::string::String;
use core::fmt::Write;

use crate::util::{is_aligned, ALIGN};
use crate::{HeapRegion, InitError};

pub mod fat;
pub mod thin;

/// Both list variants need the same from their backing memory: an aligned
/// base and room for one header followed by at least one word.
pub(crate) fn check_region(region: &HeapRegion, header_size: usize) -> Result<(), InitError> {
    if !is_aligned(region.base_addr()) {
        return Err(InitError::Misaligned(region.base_addr()));
    }
    let required = header_size + ALIGN;
    if region.len() < required {
        return Err(InitError::TooSmall {
            capacity: region.len(),
            required,
        });
    }
    Ok(())
}

/// A free block as seen by diagnostics. Offsets are relative to the heap base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset of the block header
    pub offset: usize,
    /// Offset of the first usable byte
    pub buffer: usize,
    /// Usable bytes following the header
    pub size: usize,
}

impl FreeBlock {
    /// Offset one past the last usable byte.
    pub fn end(&self) -> usize {
        self.buffer + self.size
    }
}

type Visit = fn(&HeapRegion, usize) -> (FreeBlock, Option<usize>);

/// Walks a free list from its head, in address order.
pub struct FreeBlocks<'a> {
    region: &'a HeapRegion,
    cursor: Option<usize>,
    visit: Visit,
}

impl<'a> FreeBlocks<'a> {
    pub(crate) fn new(region: &'a HeapRegion, head: Option<usize>, visit: Visit) -> Self {
        Self {
            region,
            cursor: head,
            visit,
        }
    }
}

impl Iterator for FreeBlocks<'_> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let (block, next) = (self.visit)(self.region, self.cursor?);
        self.cursor = next;
        Some(block)
    }
}

/// Steps through the allocated blocks following a free block (or the heap
/// start) until reaching `target`. `next_block` maps a block offset to the
/// offset of the block physically after it. True iff `target` is a block start.
///
/// Only headers written by the allocator are read: the walk starts on a block
/// boundary and never passes `target`, so data inside live allocations
/// cannot forge a block.
pub(crate) fn is_block_start(
    mut at: usize,
    target: usize,
    next_block: impl Fn(usize) -> usize,
) -> bool {
    while at < target {
        let next = next_block(at);
        if next <= at {
            return false;
        }
        at = next;
    }
    at == target
}

pub(crate) fn render(blocks: FreeBlocks<'_>) -> String {
    let mut out = String::new();
    let mut count = 0;
    let mut total = 0;
    let _ = writeln!(out, "----------\nFree list:\n----------");
    for block in blocks {
        let _ = writeln!(
            out,
            "addr: {:#x}\nsize: {}\nbuffer: {:#x}\n",
            block.offset, block.size, block.buffer
        );
        count += 1;
        total += block.size;
    }
    let _ = writeln!(out, "{} free blocks, {} bytes", count, total);
    out
}

/// Panics unless the list is sorted, in bounds, and fully coalesced.
#[cfg(any(test, feature = "extra-checks"))]
pub(crate) fn assert_well_formed(blocks: FreeBlocks<'_>, capacity: usize) {
    let mut previous: Option<FreeBlock> = None;
    for block in blocks {
        assert!(block.size > 0, "Empty free block at {:#x}", block.offset);
        assert!(block.end() <= capacity, "Free block at {:#x} overruns heap", block.offset);
        if let Some(p) = previous {
            assert!(p.offset < block.offset, "Free list out of order at {:#x}", block.offset);
            assert!(p.end() < block.offset, "Uncoalesced neighbours at {:#x}", block.offset);
        }
        previous = Some(block);
    }
}
