use alloc::string::String;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use crate::util::ALIGN;
use crate::{AllocError, HeapAllocator, HeapRegion, InitError, ReleaseError};

/// A heap that can be shared between threads, and registered as the
/// `#[global_allocator]` once its region has been handed over.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: LockedHeap<TreeAllocator> = LockedHeap::empty();
///
/// static mut MEMORY: [u8; 1 << 20] = [0; 1 << 20];
///
/// HEAP.init(HeapRegion::new(unsafe { &mut *core::ptr::addr_of_mut!(MEMORY) }))?;
/// ```
pub struct LockedHeap<A> {
    inner: Mutex<Option<A>>,
}

impl<A: HeapAllocator> LockedHeap<A> {
    /// A heap without backing memory; every allocation fails until `init`.
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn init(&self, region: HeapRegion) -> Result<(), InitError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(InitError::AlreadyInitialized);
        }
        *inner = Some(A::init(region)?);
        Ok(())
    }

    /// Takes over an already initialized allocator.
    pub fn install(&self, heap: A) -> Result<(), InitError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(InitError::AlreadyInitialized);
        }
        *inner = Some(heap);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Runs `f` on the allocator while holding the lock.
    /// `None` if the heap is not initialized.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }

    pub fn allocate(&self, size: usize) -> Result<ptr::NonNull<u8>, AllocError> {
        self.with(|heap| heap.allocate(size))
            .unwrap_or(Err(AllocError))
    }

    /// # Safety
    /// Same as [`HeapAllocator::release`].
    pub unsafe fn release(&self, ptr: ptr::NonNull<u8>) -> Result<(), ReleaseError> {
        self.with(|heap| heap.release(ptr))
            .unwrap_or(Err(ReleaseError::Uninitialized))
    }

    pub fn dump(&self) -> Option<String> {
        self.with(|heap| heap.dump())
    }

    pub fn memory_available(&self) -> usize {
        self.with(|heap| heap.memory_available()).unwrap_or(0)
    }
}

unsafe impl<A: HeapAllocator + Send> GlobalAlloc for LockedHeap<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            log::warn!("Cannot satisfy alignment of {} bytes", layout.align());
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = ptr::NonNull::new(ptr) else {
            return;
        };
        if let Err(err) = self.release(ptr) {
            log::warn!("Dropped bad deallocation: {}", err);
        }
    }
}
