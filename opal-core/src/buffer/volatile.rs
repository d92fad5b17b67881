use crate::buffer::frame::Frame;
use crate::buffer::page::{PageID, PageSizeClass, SIZE_CLASS_COUNT};
use crate::error::{Error, Result};
use libc::{
    MADV_DONTFORK, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE,
    PROT_NONE, PROT_READ, PROT_WRITE, c_void, madvise, mmap, mprotect, munmap,
};

/// When enabled, free slots are protected with PROT_NONE so stray
/// accesses to non-resident pages trap immediately.
pub const ENABLE_MPROTECT: bool = false;

/// Reserve a large virtual range. The mapping is lazily committed, so
/// reserving far more than physical memory is fine.
#[inline]
pub(super) unsafe fn mmap_reserve(total_bytes: usize) -> Result<*mut u8> {
    unsafe {
        let region = mmap(
            std::ptr::null_mut(),
            total_bytes,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
            -1,
            0,
        );
        if region == MAP_FAILED {
            return Err(Error::InsufficientMemory(total_bytes));
        }
        madvise(region, total_bytes, MADV_DONTFORK);
        Ok(region as *mut u8)
    }
}

#[inline]
pub(super) unsafe fn mmap_release(ptr: *mut u8, total_bytes: usize) {
    unsafe {
        munmap(ptr as *mut c_void, total_bytes);
    }
}

#[inline]
unsafe fn madvise_dontneed(ptr: *mut u8, len: usize) -> bool {
    unsafe { madvise(ptr as *mut c_void, len, MADV_DONTNEED) == 0 }
}

/// Bind the physical backing of a byte range to one NUMA node.
/// Returns false when the kernel refuses (no NUMA support, invalid
/// node). Callers treat failure as soft: accounting still moves the
/// page between tiers.
#[cfg(target_os = "linux")]
pub(super) fn bind_to_numa_node(ptr: *mut u8, len: usize, node: u32) -> bool {
    const MPOL_BIND: libc::c_int = 2;
    const MPOL_MF_MOVE: libc::c_uint = 1 << 1;
    let mut node_mask: u64 = 1 << node;
    let res = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut c_void,
            len,
            MPOL_BIND,
            &mut node_mask as *mut u64,
            64usize,
            MPOL_MF_MOVE,
        )
    };
    res == 0
}

#[cfg(not(target_os = "linux"))]
pub(super) fn bind_to_numa_node(_ptr: *mut u8, _len: usize, _node: u32) -> bool {
    false
}

/// Per-size-class slab of virtual memory.
///
/// The region is a contiguous range carved out of one reserved
/// mapping, divided into `capacity` equal slots. Page `i` of the
/// class always occupies slot `i`; no slot is ever moved, so the
/// virtual address of a page is stable for the process lifetime.
/// Residency is controlled by committing (first touch) and releasing
/// (`madvise(MADV_DONTNEED)`) the backing memory.
///
/// The region also owns the dense frame arena for its class.
pub struct VolatileRegion {
    size_class: PageSizeClass,
    start: *mut u8,
    capacity: usize,
    frames: Box<[Frame]>,
}

// The raw region pointer is only dereferenced through slot-bounded
// offsets.
unsafe impl Send for VolatileRegion {}
unsafe impl Sync for VolatileRegion {}

impl VolatileRegion {
    pub(super) fn new(size_class: PageSizeClass, start: *mut u8, region_bytes: usize) -> Self {
        let capacity = region_bytes / size_class.bytes();
        debug_assert!(capacity > 0, "volatile region too small");
        let frames: Box<[Frame]> = (0..capacity as u64)
            .map(|i| Frame::new(PageID::new(size_class, i)))
            .collect();
        if ENABLE_MPROTECT {
            unsafe {
                mprotect(start as *mut c_void, region_bytes, PROT_NONE);
            }
        }
        VolatileRegion {
            size_class,
            start,
            capacity,
            frames,
        }
    }

    #[inline]
    pub fn size_class(&self) -> PageSizeClass {
        self.size_class
    }

    /// Maximum number of pages of this class.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn frame(&self, index: u64) -> &Frame {
        &self.frames[index as usize]
    }

    /// Virtual address of the slot for page `index`. Stable across
    /// evictions and reloads.
    #[inline]
    pub fn page_data(&self, index: u64) -> *mut u8 {
        debug_assert!((index as usize) < self.capacity);
        // SAFETY: index is bounded by capacity, the slot lies inside
        // the reserved mapping.
        unsafe { self.start.add(index as usize * self.size_class.bytes()) }
    }

    /// Make the slot accessible before a load or fresh allocation.
    #[inline]
    pub fn unprotect_page(&self, index: u64) {
        if ENABLE_MPROTECT {
            unsafe {
                mprotect(
                    self.page_data(index) as *mut c_void,
                    self.size_class.bytes(),
                    PROT_READ | PROT_WRITE,
                );
            }
        }
    }

    /// Release the physical backing of the slot after eviction.
    #[inline]
    pub fn free_page(&self, index: u64) {
        let ptr = self.page_data(index);
        unsafe {
            let ok = madvise_dontneed(ptr, self.size_class.bytes());
            debug_assert!(ok, "madvise failed on volatile region slot");
        }
        if ENABLE_MPROTECT {
            unsafe {
                mprotect(
                    ptr as *mut c_void,
                    self.size_class.bytes(),
                    PROT_NONE,
                );
            }
        }
    }

    /// Move the physical backing of the slot to the given NUMA node.
    /// The virtual address does not change.
    #[inline]
    pub fn bind_page_to_node(&self, index: u64, node: u32) -> bool {
        bind_to_numa_node(self.page_data(index), self.size_class.bytes(), node)
    }

    /// Reverse lookup for unswizzling: if `ptr` lies inside this
    /// region, returns the page index and the byte offset within the
    /// page.
    #[inline]
    pub fn find_page(&self, ptr: *const u8) -> Option<(u64, usize)> {
        let addr = ptr as usize;
        let start = self.start as usize;
        let end = start + self.capacity * self.size_class.bytes();
        if addr < start || addr >= end {
            return None;
        }
        let rel = addr - start;
        Some((
            (rel / self.size_class.bytes()) as u64,
            rel % self.size_class.bytes(),
        ))
    }
}

/// Split one reserved mapping into per-size-class regions, largest
/// class alignment preserved by construction (every class size divides
/// the per-region share after rounding).
pub(super) fn create_volatile_regions(
    mapped_region: *mut u8,
    reserved_bytes: usize,
) -> Vec<VolatileRegion> {
    let max_bytes = PageSizeClass::MAX.bytes();
    let per_region = (reserved_bytes / SIZE_CLASS_COUNT) / max_bytes * max_bytes;
    assert!(per_region >= max_bytes, "reserved virtual memory too small");
    PageSizeClass::all()
        .enumerate()
        .map(|(i, class)| {
            // SAFETY: disjoint per-class subranges of the reserved mapping.
            let start = unsafe { mapped_region.add(i * per_region) };
            VolatileRegion::new(class, start, per_region)
        })
        .collect()
}
