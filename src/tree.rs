//! A buddy-style allocator that splits a power-of-two heap on demand and
//! keeps all of its bookkeeping in the headers of the nodes themselves.

use alloc::string::String;
use core::fmt::Write;
use core::{mem, ptr};

use static_assertions as sa;

use crate::error::rejected;
use crate::util::{is_aligned, link, raw, request_size};
use crate::{AllocError, HeapAllocator, HeapRegion, InitError, ReleaseError};

/// Header at the start of every node, allocated or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct NodeHeader {
    /// Whether the node's own (leftmost, deepest) block is handed out:
    /// one of `FRESH`, `ALLOCATED` or `RELEASED`
    state: u8,
    /// Bit `L` is set iff the node is split at level `L`
    split_flags: u8,
    /// Level at which `parent` owns this node as its right child
    parent_level: u8,
    parent: usize,
    /// Total size of the node, including this header; a power of two
    size: usize,
    /// Free bytes in the node's whole subtree
    free_space: usize,
}

sa::assert_eq_size!(NodeHeader, [usize; 4]);

/// Never handed out since the node was created
const FRESH: u8 = 0;
const ALLOCATED: u8 = 1;
/// Handed out and given back at least once
const RELEASED: u8 = 2;

impl NodeHeader {
    fn new(size: usize, parent: Option<usize>, parent_level: usize) -> Self {
        Self {
            state: FRESH,
            split_flags: 0,
            parent_level: parent_level as u8,
            parent: raw(parent),
            size,
            free_space: size - mem::size_of::<Self>(),
        }
    }

    fn is_allocated(&self) -> bool {
        self.state == ALLOCATED
    }

    fn parent(&self) -> Option<usize> {
        link(self.parent)
    }
}

/// Given a power-of-two-sized block of memory, recursively halves it on
/// demand, and merges the halves back once both of them are free again.
///
/// Every node starts with a header. Splitting a node at level `L` writes a
/// new node, the *right child*, into the second half of the node's level `L`
/// block. The *left child* is not a node of its own: it is the same node
/// viewed one level deeper, which is why a node needs no child pointers.
/// A node may be split at most `MAX_SPLITS` times this way; deeper divisions
/// happen inside its right children, which are full nodes with their own
/// split levels.
///
/// ```txt
///  offset 0                                                       size
///  |------------------------------------------------------------------|
///  | root, level 0                                                    |
///  |---------------------------------|--------------------------------|
///  | root, level 1                   | right child A (level 0)        |
///  |----------------|----------------|----------------|---------------|
///  | root, level 2  | right child B  | A, level 1     | right child C |
///  |----------------|----------------|----------------|---------------|
/// ```
///
/// Every node caches the free bytes in its subtree. The free bytes of a
/// deeper view of the node are the cache minus the caches of the right
/// children split off above that view, so allocation can skip any subtree
/// that cannot possibly fit a request without descending into it.
///
/// Allocation tries the right child before the deeper left view. That keeps
/// the largest untouched block on the left for as long as possible, a
/// middle ground between first fit and best fit.
///
/// `MAX_SPLITS` must be between 1 and 7, as the split flags are stored in
/// a byte next to nothing else.
#[derive(Debug)]
pub struct TreeAllocator<const MAX_SPLITS: usize = 2> {
    /// The root node lives at offset 0
    storage: HeapRegion,
}

impl<const MAX_SPLITS: usize> TreeAllocator<MAX_SPLITS> {
    pub const HEADER_SIZE: usize = mem::size_of::<NodeHeader>();

    /// Nodes are never split into halves smaller than this.
    pub const MIN_BLOCK_SIZE: usize = 2 * Self::HEADER_SIZE;

    const VALID_DEPTH: () = assert!(
        MAX_SPLITS >= 1 && MAX_SPLITS <= 7,
        "MAX_SPLITS must be within 1..=7"
    );

    fn node(&self, offset: usize) -> NodeHeader {
        self.storage.read(offset)
    }

    fn set_node(&self, offset: usize, node: NodeHeader) {
        self.storage.write(offset, node)
    }

    fn is_split_at(node: &NodeHeader, level: usize) -> bool {
        level < MAX_SPLITS && (node.split_flags >> level) & 1 != 0
    }

    fn mark_split(node: &mut NodeHeader, level: usize) {
        debug_assert!(level < MAX_SPLITS);
        debug_assert!(level == 0 || Self::is_split_at(node, level - 1));
        node.split_flags |= 1 << level;
    }

    fn unmark_split(node: &mut NodeHeader, level: usize) {
        debug_assert!(!Self::is_split_at(node, level + 1));
        node.split_flags &= !(1 << level);
    }

    /// The first level at which the node is not split. Split levels always
    /// form a prefix, so this is also the number of right children.
    fn split_depth(node: &NodeHeader) -> usize {
        (0..MAX_SPLITS)
            .find(|&level| !Self::is_split_at(node, level))
            .unwrap_or(MAX_SPLITS)
    }

    /// Size of the node's block when viewed at `level`.
    fn block_size(node: &NodeHeader, level: usize) -> usize {
        node.size >> level
    }

    fn right_of(offset: usize, node: &NodeHeader, level: usize) -> usize {
        offset + (node.size >> (level + 1))
    }

    /// Free bytes within the node's block at `level`.
    fn free_at(&self, offset: usize, node: &NodeHeader, level: usize) -> usize {
        let mut space = node.free_space;
        for i in 0..level {
            let right = self.node(Self::right_of(offset, node, i)).free_space;
            debug_assert!(right <= space, "Negative free space at {:#x}", offset);
            space = space.saturating_sub(right);
        }
        space
    }

    fn can_split(node: &NodeHeader, level: usize) -> bool {
        level < MAX_SPLITS && Self::block_size(node, level) / 2 >= Self::MIN_BLOCK_SIZE
    }

    fn fits_after_split(node: &NodeHeader, level: usize, size: usize) -> bool {
        size <= Self::block_size(node, level) / 2 - Self::HEADER_SIZE
    }

    fn split(&self, offset: usize, node: &mut NodeHeader, level: usize) {
        let right = Self::right_of(offset, node, level);
        let half = Self::block_size(node, level) / 2;
        self.set_node(right, NodeHeader::new(half, Some(offset), level));
        Self::mark_split(node, level);
        self.set_node(offset, *node);
    }

    /// Recomputes the cached free space of a node from its right children
    /// and its deepest view.
    fn refresh(&self, offset: usize) {
        let mut node = self.node(offset);
        let depth = Self::split_depth(&node);
        let mut space: usize = (0..depth)
            .map(|level| self.node(Self::right_of(offset, &node, level)).free_space)
            .sum();
        if !node.is_allocated() {
            space += Self::block_size(&node, depth) - Self::HEADER_SIZE;
        }
        node.free_space = space;
        self.set_node(offset, node);
    }

    /// Recursive helper for handling allocation. Returns the offset of the
    /// node whose block was handed out.
    fn allocate_in(&self, offset: usize, level: usize, size: usize) -> Option<usize> {
        let mut node = self.node(offset);
        if size > self.free_at(offset, &node, level) {
            return None;
        }

        let mut fresh_split = false;
        if !Self::is_split_at(&node, level) {
            if node.is_allocated() {
                return None;
            }
            if !Self::can_split(&node, level) || !Self::fits_after_split(&node, level, size) {
                // Splitting is either wasteful or would not leave enough room
                node.state = ALLOCATED;
                self.set_node(offset, node);
                self.refresh(offset);
                return Some(offset);
            }
            self.split(offset, &mut node, level);
            fresh_split = true;
        }

        let right = Self::right_of(offset, &node, level);
        let found = self
            .allocate_in(right, 0, size)
            .or_else(|| self.allocate_in(offset, level + 1, size));

        match found {
            Some(_) => self.refresh(offset),
            None if fresh_split => {
                let mut node = self.node(offset);
                Self::unmark_split(&mut node, level);
                self.set_node(offset, node);
            }
            None => {}
        }
        found
    }

    /// True iff `target` is the offset of a node currently in the tree.
    fn locate(&self, target: usize) -> bool {
        let mut offset = 0;
        let mut level = 0;
        while offset != target {
            let node = self.node(offset);
            if !Self::is_split_at(&node, level) {
                return false;
            }
            let right = Self::right_of(offset, &node, level);
            if target >= right {
                offset = right;
                level = 0;
            } else {
                level += 1;
            }
        }
        true
    }

    /// The halves of the node's level `level` block can be merged.
    fn can_reclaim(&self, offset: usize, node: &NodeHeader, level: usize) -> bool {
        let left_free = !node.is_allocated() && !Self::is_split_at(node, level + 1);
        let right = self.node(Self::right_of(offset, node, level));
        left_free && !right.is_allocated() && !Self::is_split_at(&right, 0)
    }

    /// Merges free halves of the node from `level` upwards. If that collapses
    /// the node completely, its parent might be able to merge as well.
    fn reclaim(&self, offset: usize, mut level: usize) {
        let mut node = self.node(offset);
        while level > 0 && self.can_reclaim(offset, &node, level - 1) {
            Self::unmark_split(&mut node, level - 1);
            level -= 1;
        }
        self.set_node(offset, node);
        self.refresh(offset);

        match node.parent() {
            Some(parent) if level == 0 => self.reclaim(parent, node.parent_level as usize + 1),
            mut cursor => {
                while let Some(ancestor) = cursor {
                    self.refresh(ancestor);
                    cursor = self.node(ancestor).parent();
                }
            }
        }
    }

    fn render_tree(&self, out: &mut String, offset: usize, level: usize, depth: usize) {
        let node = self.node(offset);
        let _ = write!(out, "{:indent$}", "", indent = depth * 2);
        if Self::is_split_at(&node, level) {
            let _ = writeln!(out, "*");
            self.render_tree(out, Self::right_of(offset, &node, level), 0, depth + 1);
            self.render_tree(out, offset, level + 1, depth + 1);
        } else {
            let _ = writeln!(out, "{}", self.free_at(offset, &node, level));
        }
    }

    fn render_map(&self, out: &mut String, offset: usize, level: usize) {
        let node = self.node(offset);
        if Self::is_split_at(&node, level) {
            self.render_map(out, offset, level + 1);
            self.render_map(out, Self::right_of(offset, &node, level), 0);
        } else {
            let cell = if node.is_allocated() { '#' } else { '_' };
            out.push('|');
            for _ in 0..Self::block_size(&node, level) / Self::MIN_BLOCK_SIZE {
                out.push(cell);
            }
        }
    }

    /// Recomputes the free space of the view `(offset, level)` from scratch,
    /// checking every header met on the way against it.
    #[cfg(any(test, feature = "extra-checks"))]
    fn audit(&self, offset: usize, level: usize) -> usize {
        let node = self.node(offset);
        if level == 0 {
            assert!(node.size.is_power_of_two(), "Bad size at {:#x}", offset);
            assert_eq!(offset % node.size, 0, "Misplaced node at {:#x}", offset);
            assert_eq!(node.split_flags >> MAX_SPLITS, 0, "Too deep at {:#x}", offset);
            assert_eq!(
                node.split_flags & (node.split_flags >> 1),
                node.split_flags >> 1,
                "Split levels are not a prefix at {:#x}",
                offset
            );
        }

        let space = if Self::is_split_at(&node, level) {
            let right_offset = Self::right_of(offset, &node, level);
            let right = self.node(right_offset);
            assert_eq!(right.parent(), Some(offset));
            assert_eq!(right.parent_level as usize, level);
            assert_eq!(right.size, Self::block_size(&node, level + 1));
            assert!(
                !self.can_reclaim(offset, &node, level),
                "Unmerged free halves at {:#x} level {}",
                offset,
                level
            );
            self.audit(offset, level + 1) + self.audit(right_offset, 0)
        } else if node.is_allocated() {
            0
        } else {
            Self::block_size(&node, level) - Self::HEADER_SIZE
        };

        if level == 0 {
            assert_eq!(node.free_space, space, "Stale free space at {:#x}", offset);
        }
        space
    }

    #[cfg(any(test, feature = "extra-checks"))]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.node(0).parent(), None);
        self.audit(0, 0);
    }

    fn verify(&self) {
        #[cfg(feature = "extra-checks")]
        self.assert_consistent();
    }
}

impl<const MAX_SPLITS: usize> HeapAllocator for TreeAllocator<MAX_SPLITS> {
    fn init(region: HeapRegion) -> Result<Self, InitError> {
        let () = Self::VALID_DEPTH;

        if !is_aligned(region.base_addr()) {
            return Err(InitError::Misaligned(region.base_addr()));
        }
        if !region.len().is_power_of_two() {
            return Err(InitError::NotPowerOfTwo(region.len()));
        }
        if region.len() < Self::MIN_BLOCK_SIZE {
            return Err(InitError::TooSmall {
                capacity: region.len(),
                required: Self::MIN_BLOCK_SIZE,
            });
        }

        region.write(0, NodeHeader::new(region.len(), None, 0));
        log::debug!(
            "Initialized tree with at most {} splits per node over {:?}",
            MAX_SPLITS,
            region
        );
        Ok(Self { storage: region })
    }

    fn allocate(&mut self, size: usize) -> Result<ptr::NonNull<u8>, AllocError> {
        let size = request_size(size).ok_or(AllocError)?;
        let Some(node) = self.allocate_in(0, 0, size) else {
            log::trace!("No subtree can fit {:#x} bytes", size);
            return Err(AllocError);
        };
        self.verify();

        let buffer = node + Self::HEADER_SIZE;
        log::trace!("Allocated {:#x} bytes at +{:#x}", size, buffer);
        Ok(self.storage.ptr_at(buffer))
    }

    unsafe fn release(&mut self, ptr: ptr::NonNull<u8>) -> Result<(), ReleaseError> {
        let addr = ptr.as_ptr() as usize;
        let buffer = self
            .storage
            .offset_of(ptr)
            .ok_or_else(|| rejected(ReleaseError::OutOfBounds(addr)))?;
        let target = buffer
            .checked_sub(Self::HEADER_SIZE)
            .filter(|&target| self.locate(target))
            .ok_or_else(|| rejected(ReleaseError::NotAllocated(addr)))?;

        let mut node = self.node(target);
        match node.state {
            ALLOCATED => {}
            RELEASED => return Err(rejected(ReleaseError::DoubleFree(addr))),
            _ => return Err(rejected(ReleaseError::NotAllocated(addr))),
        }

        log::trace!("Releasing node at +{:#x}", target);
        let depth = Self::split_depth(&node);
        node.state = RELEASED;
        self.set_node(target, node);
        self.reclaim(target, depth);
        self.verify();
        Ok(())
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        self.render_tree(&mut out, 0, 0, 0);
        self.render_map(&mut out, 0, 0);
        out.push_str("|\n");
        out
    }

    fn memory_available(&self) -> usize {
        self.node(0).free_space
    }

    fn region(&self) -> &HeapRegion {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::churn;

    type Tree = TreeAllocator;
    const H: usize = Tree::HEADER_SIZE;

    fn offset<const M: usize>(allocator: &TreeAllocator<M>, p: ptr::NonNull<u8>) -> usize {
        allocator.region().offset_of(p).unwrap()
    }

    /// The root is a single free block again.
    fn assert_collapsed<const M: usize>(allocator: &TreeAllocator<M>) {
        let root = allocator.node(0);
        assert_eq!(root.split_flags, 0);
        assert!(!root.is_allocated());
        assert_eq!(root.parent(), None);
        assert_eq!(
            root.free_space,
            allocator.region().len() - TreeAllocator::<M>::HEADER_SIZE
        );
    }

    #[test]
    fn internal_calculations() {
        assert_eq!(H, 4 * mem::size_of::<usize>());
        assert_eq!(Tree::MIN_BLOCK_SIZE, 2 * H);

        let mut node = NodeHeader::new(1024, None, 0);
        assert_eq!(node.free_space, 1024 - H);
        assert_eq!(Tree::split_depth(&node), 0);
        assert_eq!(Tree::right_of(0, &node, 0), 512);
        assert_eq!(Tree::right_of(0, &node, 1), 256);
        assert_eq!(Tree::right_of(512, &node, 2), 512 + 128);
        assert_eq!(Tree::block_size(&node, 2), 256);

        Tree::mark_split(&mut node, 0);
        Tree::mark_split(&mut node, 1);
        assert!(Tree::is_split_at(&node, 0));
        assert!(Tree::is_split_at(&node, 1));
        assert!(!Tree::is_split_at(&node, 2));
        assert_eq!(Tree::split_depth(&node), 2);
        assert!(!Tree::can_split(&node, 2));

        Tree::unmark_split(&mut node, 1);
        assert_eq!(Tree::split_depth(&node), 1);
        assert_eq!(node.split_flags, 0b1);
    }

    #[test]
    fn rejects_bad_regions() {
        let mut backing = HeapRegion::test_backing(1000);
        assert_eq!(
            Tree::init(HeapRegion::test_new(&mut backing)).err(),
            Some(InitError::NotPowerOfTwo(1000))
        );

        let mut backing = HeapRegion::test_backing(32);
        assert_eq!(
            Tree::init(HeapRegion::test_new(&mut backing)).err(),
            Some(InitError::TooSmall {
                capacity: 32,
                required: 2 * H
            })
        );

        let mut backing = HeapRegion::test_backing(2048);
        let region = unsafe {
            HeapRegion::from_raw_parts(
                ptr::NonNull::new_unchecked(backing.as_mut_ptr().cast::<u8>().add(4)),
                1024,
            )
        };
        let base = region.base_addr();
        assert_eq!(Tree::init(region).err(), Some(InitError::Misaligned(base)));
    }

    #[test]
    fn simple() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();

        assert_eq!(allocator.memory_available(), 1024 - H);
        assert_eq!(allocator.dump(), "992\n|________________|\n");

        let b0 = allocator.allocate(4).expect("alloc");
        allocator.assert_consistent();

        // Split down the right side until halves get too small
        assert_eq!(offset(&allocator, b0), 1024 - 64 + H);
        assert_eq!(
            allocator.dump(),
            "*\n  *\n    *\n      *\n        0\n        32\n      96\n    224\n  480\n\
             |________|____|__|_|#|\n"
        );

        // Check that we do not get a segfault or anything
        unsafe {
            ptr::write(b0.as_ptr().cast::<u64>(), u64::MAX);
            assert_eq!(ptr::read(b0.as_ptr().cast::<u64>()), u64::MAX);
        }

        unsafe {
            allocator.release(b0).expect("release");
        }
        allocator.assert_consistent();
        assert_eq!(allocator.memory_available(), 1024 - H);
        assert_eq!(allocator.dump(), "992\n|________________|\n");
    }

    #[test]
    fn three_small_blocks_merge_back() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();
        let initial = allocator.dump();

        let p = allocator.allocate(8).expect("alloc");
        let q = allocator.allocate(8).expect("alloc");
        let r = allocator.allocate(8).expect("alloc");
        allocator.assert_consistent();

        assert_eq!(offset(&allocator, p), 960 + H);
        // Too small to split again, so the node itself is used one level deeper
        assert_eq!(offset(&allocator, q), 896 + H);
        // The 256 byte node splits at its second level
        assert_eq!(offset(&allocator, r), 832 + H);
        assert_eq!(allocator.memory_available(), 480 + 224 + 32);

        unsafe {
            allocator.release(q).expect("release");
        }
        allocator.assert_consistent();
        unsafe {
            allocator.release(p).expect("release");
        }
        allocator.assert_consistent();
        unsafe {
            allocator.release(r).expect("release");
        }
        allocator.assert_consistent();

        assert_eq!(allocator.node(0), NodeHeader::new(1024, None, 0));
        assert_eq!(allocator.dump(), initial);
    }

    #[test]
    fn mebibyte_reclaims_fully() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut backing = HeapRegion::test_backing(1 << 20);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();
        let initial = allocator.dump();

        let small = allocator.allocate(mem::size_of::<i32>()).expect("alloc");
        unsafe { ptr::write(small.as_ptr().cast::<i32>(), 32) };
        allocator.assert_consistent();

        // Half of the root's left half minus a header is just too small,
        // so the request takes the whole left half
        let large = allocator.allocate(256 << 10).expect("alloc");
        assert_eq!(offset(&allocator, large), H);
        allocator.assert_consistent();
        assert_eq!(unsafe { ptr::read(small.as_ptr().cast::<i32>()) }, 32);

        unsafe {
            allocator.release(small).expect("release");
        }
        allocator.assert_consistent();
        assert_eq!(allocator.node(0).split_flags, 0b1);

        unsafe {
            allocator.release(large).expect("release");
        }
        allocator.assert_consistent();

        assert_collapsed(&allocator);
        assert_eq!(allocator.dump(), initial);
    }

    #[test]
    fn exact_fit_takes_root() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();

        assert_eq!(allocator.allocate(1024 - H + 1), Err(AllocError));

        let all = allocator.allocate(1024 - H).expect("exact fit");
        assert_eq!(offset(&allocator, all), H);
        assert_eq!(allocator.memory_available(), 0);
        assert_eq!(allocator.allocate(1), Err(AllocError));
        assert_eq!(allocator.dump(), "0\n|################|\n");

        unsafe {
            allocator.release(all).expect("release");
        }
        assert_eq!(allocator.memory_available(), 1024 - H);
    }

    #[test]
    fn failed_allocation_changes_nothing() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();

        let _a = allocator.allocate(8).expect("alloc");
        let _b = allocator.allocate(400).expect("alloc");
        let before = allocator.dump();
        let available = allocator.memory_available();

        assert_eq!(allocator.allocate(512), Err(AllocError));
        assert_eq!(allocator.allocate(usize::MAX), Err(AllocError));
        assert_eq!(allocator.dump(), before);
        assert_eq!(allocator.memory_available(), available);
        allocator.assert_consistent();
    }

    #[test]
    fn fragmented_free_space_is_not_enough() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();

        let blocks: Vec<_> = (0..5).map(|_| allocator.allocate(24).expect("alloc")).collect();
        allocator.assert_consistent();

        // Plenty of bytes left in total, but not in one piece
        let available = allocator.memory_available();
        assert!(available >= 400);
        assert_eq!(allocator.allocate(available), Err(AllocError));

        for b in blocks {
            unsafe {
                allocator.release(b).expect("release");
            }
            allocator.assert_consistent();
        }
        assert_eq!(allocator.memory_available(), 1024 - H);
    }

    #[test]
    fn invalid_releases() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();
        let addr = |p: ptr::NonNull<u8>| p.as_ptr() as usize;

        let p = allocator.allocate(8).expect("alloc");
        let q = allocator.allocate(8).expect("alloc");
        let before = allocator.dump();

        let mut elsewhere = [0u64; 4];
        let foreign = ptr::NonNull::from(&mut elsewhere).cast::<u8>();
        let inside = unsafe { ptr::NonNull::new_unchecked(q.as_ptr().add(8)) };
        unsafe {
            assert_eq!(allocator.release(foreign), Err(ReleaseError::OutOfBounds(addr(foreign))));
            assert_eq!(allocator.release(inside), Err(ReleaseError::NotAllocated(addr(inside))));
            assert_eq!(
                allocator.release(allocator.region().base()),
                Err(ReleaseError::NotAllocated(allocator.region().base_addr()))
            );
        }
        assert_eq!(allocator.dump(), before);

        unsafe {
            allocator.release(q).expect("release");
            // `p` keeps the released node split, so it is still there
            assert_eq!(allocator.release(q), Err(ReleaseError::DoubleFree(addr(q))));
            allocator.release(p).expect("release");
            // Merged away by now
            assert_eq!(allocator.release(p), Err(ReleaseError::NotAllocated(addr(p))));
        }
        allocator.assert_consistent();
        assert_eq!(allocator.memory_available(), 1024 - H);
    }

    #[test]
    fn never_handed_out_is_not_allocated() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();
        let at = |allocator: &Tree, offset: usize| allocator.region().ptr_at(offset + H);

        let root = at(&allocator, 0);
        unsafe {
            assert_eq!(
                allocator.release(root),
                Err(ReleaseError::NotAllocated(root.as_ptr() as usize))
            );
        }

        // Splitting creates right children whose blocks nobody has seen yet
        let p = allocator.allocate(8).expect("alloc");
        let right = at(&allocator, 512);
        let before = allocator.dump();
        unsafe {
            assert_eq!(
                allocator.release(right),
                Err(ReleaseError::NotAllocated(right.as_ptr() as usize))
            );
            assert_eq!(
                allocator.release(root),
                Err(ReleaseError::NotAllocated(root.as_ptr() as usize))
            );
        }
        assert_eq!(allocator.dump(), before);

        unsafe {
            allocator.release(p).expect("release");
        }
        let all = allocator.allocate(1024 - H).expect("alloc");
        assert_eq!(all, root);
        unsafe {
            allocator.release(all).expect("release");
            assert_eq!(
                allocator.release(all),
                Err(ReleaseError::DoubleFree(all.as_ptr() as usize))
            );
        }
        allocator.assert_consistent();
        assert_collapsed(&allocator);
    }

    #[test]
    fn single_split_level() {
        let mut backing = HeapRegion::test_backing(1024);
        let mut allocator =
            TreeAllocator::<1>::init(HeapRegion::test_new(&mut backing)).unwrap();

        // Every node splits once, so the chain of right children gets deeper instead
        let p = allocator.allocate(8).expect("alloc");
        let q = allocator.allocate(8).expect("alloc");
        assert_eq!(offset(&allocator, p), 960 + TreeAllocator::<1>::HEADER_SIZE);
        assert_eq!(offset(&allocator, q), 896 + TreeAllocator::<1>::HEADER_SIZE);
        allocator.assert_consistent();

        unsafe {
            allocator.release(p).expect("release");
            allocator.release(q).expect("release");
        }
        allocator.assert_consistent();
        assert_eq!(allocator.memory_available(), 1024 - H);
    }

    #[test]
    fn deepest_split_level_merges() {
        let mut backing = HeapRegion::test_backing(4096);
        let mut allocator =
            TreeAllocator::<7>::init(HeapRegion::test_new(&mut backing)).unwrap();

        // Fill the root's left views until the root is split all the way down
        let mut blocks = Vec::new();
        while let Ok(p) = allocator.allocate(24) {
            blocks.push(p);
            allocator.assert_consistent();
        }
        assert!(TreeAllocator::<7>::split_depth(&allocator.node(0)) >= 5);

        // The root's own block goes last, starting a merge from its deepest level
        blocks.sort();
        let root_block = blocks.remove(0);
        assert_eq!(offset(&allocator, root_block), H);
        for p in blocks {
            unsafe {
                allocator.release(p).expect("release");
            }
            allocator.assert_consistent();
        }
        unsafe {
            allocator.release(root_block).expect("release");
        }
        allocator.assert_consistent();
        assert_collapsed(&allocator);
    }

    #[test]
    fn almost_fuzz() {
        let _ = env_logger::builder().is_test(true).try_init();

        for (seed, capacity, max_size) in [(7, 1024, 64), (8, 4096, 300), (9, 1 << 16, 5000)] {
            let mut backing = HeapRegion::test_backing(capacity);
            let mut allocator = Tree::init(HeapRegion::test_new(&mut backing)).unwrap();
            churn(&mut allocator, seed, 2000, max_size, H, |a| a.assert_consistent());
            assert_collapsed(&allocator);
        }

        let mut backing = HeapRegion::test_backing(1 << 16);
        let mut allocator =
            TreeAllocator::<4>::init(HeapRegion::test_new(&mut backing)).unwrap();
        let header = TreeAllocator::<4>::HEADER_SIZE;
        churn(&mut allocator, 10, 2000, 2000, header, |a| a.assert_consistent());
        assert_collapsed(&allocator);
    }
}
