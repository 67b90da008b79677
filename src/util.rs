/// Granularity of every request, and the alignment of every returned pointer.
pub const ALIGN: usize = 8;

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two()); // Disallows zero as well
    let align_mask = alignment - 1; // 0x100 => 0xff
    if value & align_mask == 0 {
        value
    } else {
        (value | align_mask) + 1
    }
}

/// Rounds a request up to the allocation granularity. Zero-sized requests
/// still get a word, so that two live allocations never share an address.
/// `None` if rounding would overflow.
pub(crate) fn request_size(size: usize) -> Option<usize> {
    let size = size.max(1);
    size.checked_add(ALIGN - 1).map(|s| s & !(ALIGN - 1))
}

pub(crate) fn is_aligned(addr: usize) -> bool {
    align_up(addr, ALIGN) == addr
}

/// Stored link value meaning "none".
pub(crate) const NIL: usize = usize::MAX;

pub(crate) fn link(raw: usize) -> Option<usize> {
    (raw != NIL).then_some(raw)
}

pub(crate) fn raw(link: Option<usize>) -> usize {
    link.unwrap_or(NIL)
}
