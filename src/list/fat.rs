use alloc::string::String;
use core::{mem, ptr};

use static_assertions as sa;

use super::{FreeBlock, FreeBlocks};
use crate::error::rejected;
use crate::util::{is_aligned, link, raw, request_size, NIL};
use crate::{AllocError, HeapAllocator, HeapRegion, InitError, ReleaseError};

/// A doubly-linked list header, with the offset of the block's data cached
/// next to its size.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct FatHeader {
    prev: usize,
    next: usize,
    size: usize,
    buffer: usize,
}

impl FatHeader {
    fn new(offset: usize, size: usize, prev: Option<usize>, next: Option<usize>) -> Self {
        Self {
            prev: raw(prev),
            next: raw(next),
            size,
            buffer: offset + mem::size_of::<Self>(),
        }
    }

    fn end(&self) -> usize {
        self.buffer + self.size
    }
}

sa::assert_eq_size!(FatHeader, [usize; 4]);

/// A first-fit allocator over a doubly-linked, address-ordered free list.
///
/// Compared to [`ThinListAllocator`](crate::ThinListAllocator) every block
/// carries two more words: a back link, so a block can be unlinked without
/// knowing its predecessor, and the cached start of its data.
#[derive(Debug)]
pub struct FatListAllocator {
    storage: HeapRegion,
    head: Option<usize>,
}

impl FatListAllocator {
    pub const HEADER_SIZE: usize = mem::size_of::<FatHeader>();

    fn header(&self, offset: usize) -> FatHeader {
        self.storage.read(offset)
    }

    fn set_header(&self, offset: usize, header: FatHeader) {
        self.storage.write(offset, header)
    }

    fn set_next(&mut self, block: Option<usize>, next: Option<usize>) {
        match block {
            Some(b) => {
                let mut item = self.header(b);
                item.next = raw(next);
                self.set_header(b, item);
            }
            None => self.head = next,
        }
    }

    fn set_prev(&mut self, block: Option<usize>, prev: Option<usize>) {
        if let Some(b) = block {
            let mut item = self.header(b);
            item.prev = raw(prev);
            self.set_header(b, item);
        }
    }

    fn visit(region: &HeapRegion, offset: usize) -> (FreeBlock, Option<usize>) {
        let header: FatHeader = region.read(offset);
        let block = FreeBlock {
            offset,
            buffer: header.buffer,
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
            if block.end() == next {
                let absorbed = self.header(next);
                block.size += absorbed.size + Self::HEADER_SIZE;
                block.next = absorbed.next;
                self.set_header(cursor, block);
                self.set_prev(link(absorbed.next), Some(cursor));
            } else {
                cursor = next;
            }
        }
    }

    fn verify(&self) {
        #[cfg(feature = "extra-checks")]
        {
            super::assert_well_formed(self.free_blocks(), self.storage.len());
            let mut prev = None;
            let mut cursor = self.head;
            while let Some(current) = cursor {
                let header = self.header(current);
                assert_eq!(link(header.prev), prev, "Broken back link at {:#x}", current);
                prev = cursor;
                cursor = link(header.next);
            }
        }
    }
}

impl HeapAllocator for FatListAllocator {
    fn init(region: HeapRegion) -> Result<Self, InitError> {
        super::check_region(&region, Self::HEADER_SIZE)?;
        region.write(
            0,
            FatHeader::new(0, region.len() - Self::HEADER_SIZE, None, None),
        );
        log::debug!("Initialized fat free list over {:?}", region);
        Ok(Self {
            storage: region,
            head: Some(0),
        })
    }

    fn allocate(&mut self, size: usize) -> Result<ptr::NonNull<u8>, AllocError> {
        let size = request_size(size).ok_or(AllocError)?;

        let mut cursor = self.head;
        while let Some(offset) = cursor {
            let mut block = self.header(offset);
            if block.size >= size {
                let prev = link(block.prev);
                let next = link(block.next);
                if block.size - size > Self::HEADER_SIZE {
                    // The tail becomes a free block in our place
                    let rest = block.buffer + size;
                    self.set_header(
                        rest,
                        FatHeader::new(rest, block.size - size - Self::HEADER_SIZE, prev, next),
                    );
                    self.set_next(prev, Some(rest));
                    self.set_prev(next, Some(rest));
                    block.size = size;
                } else {
                    self.set_next(prev, next);
                    self.set_prev(next, prev);
                }
                block.prev = NIL;
                block.next = NIL;
                self.set_header(offset, block);
                self.verify();

                log::trace!("Allocated {:#x} bytes at +{:#x}", block.size, block.buffer);
                return Ok(self.storage.ptr_at(block.buffer));
            }
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

        // Find the first free block above the target. Its back link is the
        // predecessor; without one, the predecessor is the list's last block.
        let mut last = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == target {
                return Err(rejected(ReleaseError::DoubleFree(addr)));
            }
            if current > target {
                break;
            }
            let block = self.header(current);
            if target < block.end() {
                return Err(rejected(ReleaseError::NotAllocated(addr)));
            }
            last = cursor;
            cursor = link(block.next);
        }

        let start = last.map_or(0, |l| self.header(l).end());
        let walked = super::is_block_start(start, target, |at| {
            at.saturating_add(Self::HEADER_SIZE)
                .saturating_add(self.header(at).size)
        });
        if !walked {
            return Err(rejected(ReleaseError::NotAllocated(addr)));
        }

        let block = self.header(target);
        let limit = cursor.unwrap_or(self.storage.len());
        if block.buffer != buffer
            || block.size == 0
            || buffer.checked_add(block.size).map_or(true, |end| end > limit)
        {
            return Err(rejected(ReleaseError::NotAllocated(addr)));
        }

        log::trace!("Releasing {:#x} bytes at +{:#x}", block.size, buffer);
        let prev = match cursor {
            Some(next) => link(self.header(next).prev),
            None => last,
        };
        self.set_header(target, FatHeader::new(target, block.size, prev, cursor));
        self.set_next(prev, Some(target));
        self.set_prev(cursor, Some(target));
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
