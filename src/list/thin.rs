use alloc::string::String;
use core::{mem, ptr};

use static_assertions as sa;

use super::{FreeBlock, FreeBlocks};
use crate::error::rejected;
use crate::util::{is_aligned, link, raw, request_size, NIL};
use crate::{AllocError, HeapAllocator, HeapRegion, InitError, ReleaseError};

/// Header in front of every block. `next` is only meaningful while the block is free.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ThinHeader {
    next: usize,
    size: usize,
}

sa::assert_eq_size!(ThinHeader, [usize; 2]);

/// A first-fit allocator over a singly-linked, address-ordered free list.
/// Costs two words per block.
///
/// Releasing walks the list from the head to find the insertion point, steps
/// over the allocated blocks behind the predecessor to make sure the pointer
/// starts a block, and then walks the list once more to merge adjacent blocks.
#[derive(Debug)]
pub struct ThinListAllocator {
    storage: HeapRegion,
    head: Option<usize>,
}

impl ThinListAllocator {
    pub const HEADER_SIZE: usize = mem::size_of::<ThinHeader>();

    fn header(&self, offset: usize) -> ThinHeader {
        self.storage.read(offset)
    }

    fn set_header(&self, offset: usize, header: ThinHeader) {
        self.storage.write(offset, header)
    }

    /// Points `prev` (or the head, if there is no `prev`) at `next`.
    fn set_next(&mut self, prev: Option<usize>, next: Option<usize>) {
        match prev {
            Some(p) => {
                let mut item = self.header(p);
                item.next = raw(next);
                self.set_header(p, item);
            }
            None => self.head = next,
        }
    }

    fn visit(region: &HeapRegion, offset: usize) -> (FreeBlock, Option<usize>) {
        let header: ThinHeader = region.read(offset);
        let block = FreeBlock {
            offset,
            buffer: offset + Self::HEADER_SIZE,
            size: header.size,
        };
        (block, link(header.next))
    }

    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks::new(&self.storage, self.head, Self::visit)
    }

    /// Merge every free block with its successor when they touch.
    fn coalesce(&mut self) {
        let Some(mut cursor) = self.head else {
            return;
        };
        loop {
            let mut block = self.header(cursor);
            let Some(next) = link(block.next) else {
                break;
            };
            if cursor + Self::HEADER_SIZE + block.size == next {
                let absorbed = self.header(next);
                block.size += absorbed.size + Self::HEADER_SIZE;
                block.next = absorbed.next;
                self.set_header(cursor, block);
            } else {
                cursor = next;
            }
        }
    }

    fn verify(&self) {
        #[cfg(feature = "extra-checks")]
        super::assert_well_formed(self.free_blocks(), self.storage.len());
    }
}

impl HeapAllocator for ThinListAllocator {
    fn init(region: HeapRegion) -> Result<Self, InitError> {
        super::check_region(&region, Self::HEADER_SIZE)?;
        region.write(
            0,
            ThinHeader {
                next: NIL,
                size: region.len() - Self::HEADER_SIZE,
            },
        );
        log::debug!("Initialized thin free list over {:?}", region);
        Ok(Self {
            storage: region,
            head: Some(0),
        })
    }

    fn allocate(&mut self, size: usize) -> Result<ptr::NonNull<u8>, AllocError> {
        let size = request_size(size).ok_or(AllocError)?;

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(offset) = cursor {
            let mut block = self.header(offset);
            if block.size >= size {
                let mut next = link(block.next);
                if block.size - size > Self::HEADER_SIZE {
                    // Carve the tail into a new free block taking our place in the list
                    let rest = offset + Self::HEADER_SIZE + size;
                    self.set_header(
                        rest,
                        ThinHeader {
                            next: block.next,
                            size: block.size - size - Self::HEADER_SIZE,
                        },
                    );
                    next = Some(rest);
                    block.size = size;
                }
                block.next = NIL;
                self.set_header(offset, block);
                self.set_next(prev, next);
                self.verify();

                let buffer = offset + Self::HEADER_SIZE;
                log::trace!("Allocated {:#x} bytes at +{:#x}", block.size, buffer);
                return Ok(self.storage.ptr_at(buffer));
            }
            prev = cursor;
            cursor = link(block.next);
        }

        log::trace!("No free block for {:#x} bytes", size);
        Err(AllocError)
    }

    unsafe fn release(&mut self, ptr: ptr::NonNull<u8>) -> Result<(), ReleaseError> {
        let addr = ptr.as_ptr() as usize;
        let buffer = self
            .storage
            .offset_of(ptr)
            .ok_or_else(|| rejected(ReleaseError::OutOfBounds(addr)))?;
        if buffer < Self::HEADER_SIZE || !is_aligned(buffer) {
            return Err(rejected(ReleaseError::NotAllocated(addr)));
        }
        let target = buffer - Self::HEADER_SIZE;

        // Find the first free block above the target, remembering its predecessor
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == target {
                return Err(rejected(ReleaseError::DoubleFree(addr)));
            }
            if current > target {
                break;
            }
            let block = self.header(current);
            if target < current + Self::HEADER_SIZE + block.size {
                // Points into the middle of a free block
                return Err(rejected(ReleaseError::NotAllocated(addr)));
            }
            prev = cursor;
            cursor = link(block.next);
        }

        // Everything between the predecessor and the target is allocated
        let start = prev.map_or(0, |p| p + Self::HEADER_SIZE + self.header(p).size);
        let walked = super::is_block_start(start, target, |at| {
            at.saturating_add(Self::HEADER_SIZE)
                .saturating_add(self.header(at).size)
        });
        if !walked {
            return Err(rejected(ReleaseError::NotAllocated(addr)));
        }

        let mut block = self.header(target);
        let limit = cursor.unwrap_or(self.storage.len());
        if block.size == 0 || buffer.checked_add(block.size).map_or(true, |end| end > limit) {
            return Err(rejected(ReleaseError::NotAllocated(addr)));
        }

        log::trace!("Releasing {:#x} bytes at +{:#x}", block.size, buffer);
        block.next = raw(cursor);
        self.set_header(target, block);
        self.set_next(prev, Some(target));
        self.coalesce();
        self.verify();
        Ok(())
    }

    fn dump(&self) -> String {
        super::render(self.free_blocks())
    }

    fn memory_available(&self) -> usize {
        self.free_blocks().map(|block| block.size).sum()
    }

    fn region(&self) -> &HeapRegion {
        &self.storage
    }
}
