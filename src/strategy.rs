use alloc::string::{String, ToString};
use core::{fmt, ptr, str};

use crate::{
    AllocError, FatListAllocator, HeapRegion, InitError, ParseStrategyError, ReleaseError,
    ThinListAllocator, TreeAllocator,
};

/// The contract shared by every allocation strategy.
///
/// An allocator owns exactly one [`HeapRegion`] and keeps all of its state
/// inside that region (plus a few words in the allocator value itself).
/// The only way to get one is through a successful [`init`](Self::init).
pub trait HeapAllocator {
    /// Installs the strategy's bookkeeping into `region`.
    fn init(region: HeapRegion) -> Result<Self, InitError>
    where
        Self: Sized;

    /// Returns a pointer to at least `size` bytes, rounded up to a multiple
    /// of [`ALIGN`](crate::ALIGN). The pointer is `ALIGN`-aligned and never
    /// overlaps another live allocation. Nothing changes on failure.
    fn allocate(&mut self, size: usize) -> Result<ptr::NonNull<u8>, AllocError>;

    /// Makes the storage behind `ptr` available for later allocations.
    ///
    /// Pointers that are not live allocations of this allocator are
    /// rejected where the allocator can tell, without modifying any state.
    ///
    /// # Safety
    /// `ptr` should have been returned by `allocate` on this allocator, and
    /// the memory behind it must not be used after this call.
    unsafe fn release(&mut self, ptr: ptr::NonNull<u8>) -> Result<(), ReleaseError>;

    /// Human-readable snapshot of the free-space structure.
    fn dump(&self) -> String;

    /// Free bytes, excluding bookkeeping. Diagnostic only.
    fn memory_available(&self) -> usize;

    fn region(&self) -> &HeapRegion;
}

/// Which allocator to bind to a heap, chosen by the host at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    /// [`ThinListAllocator`]
    Thin,
    /// [`FatListAllocator`]
    Fat,
    /// [`TreeAllocator`] with the default split depth
    #[default]
    Tree,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Thin, Strategy::Fat, Strategy::Tree];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Thin => "thin",
            Strategy::Fat => "fat",
            Strategy::Tree => "tree",
        }
    }

    pub fn init(self, region: HeapRegion) -> Result<AnyHeap, InitError> {
        log::debug!("Binding {} allocator to {:?}", self, region);
        Ok(match self {
            Strategy::Thin => AnyHeap::Thin(ThinListAllocator::init(region)?),
            Strategy::Fat => AnyHeap::Fat(FatListAllocator::init(region)?),
            Strategy::Tree => AnyHeap::Tree(TreeAllocator::init(region)?),
        })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl str::FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| s.trim().eq_ignore_ascii_case(strategy.name()))
            .ok_or_else(|| ParseStrategyError(s.to_string()))
    }
}

/// An allocator of any strategy, selected at runtime through [`Strategy::init`].
#[derive(Debug)]
pub enum AnyHeap {
    Thin(ThinListAllocator),
    Fat(FatListAllocator),
    Tree(TreeAllocator),
}

impl AnyHeap {
    pub fn strategy(&self) -> Strategy {
        match self {
            AnyHeap::Thin(_) => Strategy::Thin,
            AnyHeap::Fat(_) => Strategy::Fat,
            AnyHeap::Tree(_) => Strategy::Tree,
        }
    }

    fn inner(&self) -> &dyn HeapAllocator {
        match self {
            AnyHeap::Thin(a) => a,
            AnyHeap::Fat(a) => a,
            AnyHeap::Tree(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn HeapAllocator {
        match self {
            AnyHeap::Thin(a) => a,
            AnyHeap::Fat(a) => a,
            AnyHeap::Tree(a) => a,
        }
    }
}

impl HeapAllocator for AnyHeap {
    /// Uses the default strategy; pick another one with [`Strategy::init`].
    fn init(region: HeapRegion) -> Result<Self, InitError> {
        Strategy::default().init(region)
    }

    fn allocate(&mut self, size: usize) -> Result<ptr::NonNull<u8>, AllocError> {
        self.inner_mut().allocate(size)
    }

    unsafe fn release(&mut self, ptr: ptr::NonNull<u8>) -> Result<(), ReleaseError> {
        self.inner_mut().release(ptr)
    }

    fn dump(&self) -> String {
        self.inner().dump()
    }

    fn memory_available(&self) -> usize {
        self.inner().memory_available()
    }

    fn region(&self) -> &HeapRegion {
        self.inner().region()
    }
}

/// Random allocate/release workload. Checks after every step that live
/// allocations stay in bounds and never overlap, that free space never exceeds
/// the capacity minus one `header_size`, and runs `check` on the allocator.
/// Finally releases everything and expects the initial free space back.
#[cfg(test)]
pub(crate) fn churn<A: HeapAllocator>(
    heap: &mut A,
    seed: u64,
    rounds: usize,
    max_size: usize,
    header_size: usize,
    check: impl Fn(&A),
) {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::util::{request_size, ALIGN};

    let mut rng = StdRng::seed_from_u64(seed);
    let initial = heap.memory_available();
    let start = heap.region().base_addr();
    let end = start + heap.region().len();
    let ceiling = heap.region().len() - header_size;
    assert!(initial <= ceiling);
    let mut live: Vec<(usize, usize)> = Vec::new();

    for _ in 0..rounds {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(0..=max_size);
            if let Ok(p) = heap.allocate(size) {
                let addr = p.as_ptr() as usize;
                let len = request_size(size).unwrap();
                assert!(start <= addr && addr + len <= end, "Allocation outside heap");
                assert_eq!(addr % ALIGN, 0);
                for &(a, l) in &live {
                    assert!(addr + len <= a || a + l <= addr, "Overlapping allocations");
                }
                // Scribble over the whole allocation, bookkeeping must survive this
                unsafe { ptr::write_bytes(p.as_ptr(), 0xa5, len) };
                live.push((addr, len));
            }
        } else {
            let (addr, _) = live.swap_remove(rng.gen_range(0..live.len()));
            unsafe {
                heap.release(ptr::NonNull::new(addr as *mut u8).unwrap())
                    .expect("release");
            }
        }
        check(heap);
        assert!(heap.memory_available() <= ceiling, "More free space than the heap holds");
    }

    for (addr, _) in live.drain(..) {
        unsafe {
            heap.release(ptr::NonNull::new(addr as *mut u8).unwrap())
                .expect("release");
        }
        check(heap);
    }
    assert_eq!(heap.memory_available(), initial);
}
