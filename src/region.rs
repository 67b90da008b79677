use core::{fmt, mem, ptr};

/// The fixed-size backing memory of a heap: a non-null base pointer
/// with its length in bytes.
///
/// Allocators never store absolute addresses inside the region. All
/// bookkeeping is addressed by offsets from the base, and every header
/// access goes through [`read`](Self::read) / [`write`](Self::write),
/// which check that the whole value lies inside the region.
pub struct HeapRegion {
    ptr: ptr::NonNull<u8>,
    len: usize,
}

// The region is exclusively owned by the allocator it is bound to.
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    /// Wraps a statically allocated buffer, e.g. a `static mut` heap array.
    pub fn new(buffer: &'static mut [u8]) -> Self {
        let len = buffer.len();
        Self {
            ptr: ptr::NonNull::from(buffer).cast(),
            len,
        }
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as the region (or the allocator it is bound to) is alive, and nothing
    /// else may access that memory except through pointers handed out by the
    /// allocator.
    pub unsafe fn from_raw_parts(ptr: ptr::NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base(&self) -> ptr::NonNull<u8> {
        self.ptr
    }

    pub fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Check if a pointer is inside the backing memory, returning its offset.
    pub fn offset_of(&self, ptr: ptr::NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base_addr())?;
        (offset < self.len).then_some(offset)
    }

    /// Pointer to the byte at `offset`. One-past-the-end is allowed.
    pub(crate) fn ptr_at(&self, offset: usize) -> ptr::NonNull<u8> {
        assert!(offset <= self.len, "Offset {:#x} outside heap", offset);
        // Safety: in bounds of the backing allocation, as asserted above
        unsafe { self.ptr.add(offset) }
    }

    fn check_access<T>(&self, offset: usize) {
        assert!(
            offset
                .checked_add(mem::size_of::<T>())
                .is_some_and(|end| end <= self.len),
            "Header at {:#x} runs past the end of the heap",
            offset
        );
        debug_assert_eq!(
            (self.base_addr() + offset) % mem::align_of::<T>(),
            0,
            "Misaligned header at {:#x}",
            offset
        );
    }

    /// Reads a header stored at `offset`.
    ///
    /// Callers only store plain-integer `#[repr(C)]` headers, for which
    /// every bit pattern is a valid value.
    pub(crate) fn read<T: Copy>(&self, offset: usize) -> T {
        self.check_access::<T>(offset);
        // Safety: bounds and alignment are checked above
        unsafe { ptr::read(self.ptr.add(offset).cast::<T>().as_ptr()) }
    }

    pub(crate) fn write<T: Copy>(&self, offset: usize, value: T) {
        self.check_access::<T>(offset);
        // Safety: bounds and alignment are checked above
        unsafe { ptr::write(self.ptr.add(offset).cast::<T>().as_ptr(), value) }
    }

    /// Backing memory for tests. The words keep the region 8-byte aligned and
    /// are filled with a nonzero pattern so that nothing relies on zeroed memory.
    #[cfg(test)]
    pub(crate) fn test_backing(size: usize) -> alloc::boxed::Box<[u64]> {
        assert_eq!(size % 8, 0);
        vec![0xd7d7_d7d7_d7d7_d7d7u64; size / 8].into_boxed_slice()
    }

    #[cfg(test)]
    pub(crate) fn test_new(backing: &mut [u64]) -> Self {
        let len = mem::size_of_val(backing);
        unsafe { Self::from_raw_parts(ptr::NonNull::from(backing).cast(), len) }
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("base", &self.ptr)
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}
