use crate::buffer::managed_ptr::BufferManagedPtr;
use crate::buffer::manager::BufferManager;
use crate::buffer::page::{PageID, PageSizeClass, find_fitting_size_class};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Allocations at most this large are packed into a shared page of the
/// smallest class; anything bigger gets a dedicated page.
pub const SMALL_ALLOC_LIMIT: usize = PageSizeClass::MIN.bytes() / 2;

#[derive(Debug, Clone, Copy)]
struct OpenPage {
    page_id: PageID,
    offset: usize,
}

struct PageAllocInfo {
    live_allocs: usize,
    shared: bool,
}

/// Bump-packing state of the byte allocator.
///
/// Lock order: `open_page` before any `live` shard.
#[derive(Default)]
pub(super) struct PackedAllocState {
    open_page: Mutex<Option<OpenPage>>,
    live: DashMap<PageID, PageAllocInfo>,
}

impl BufferManager {
    /// Reserve a byte range inside buffer-managed pages and return a
    /// pointer to its start. Small allocations are packed into the
    /// current open page until it is exhausted; large allocations use
    /// a dedicated page of the smallest sufficient class. Alignment up
    /// to the page size is honored.
    pub fn allocate(&self, size: usize, align: usize) -> Result<BufferManagedPtr<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        if size <= SMALL_ALLOC_LIMIT && align <= SMALL_ALLOC_LIMIT {
            return self.allocate_packed(size, align);
        }
        let class = find_fitting_size_class(size.max(align))?;
        let page_id = self.new_page(class)?;
        self.alloc_state.live.insert(
            page_id,
            PageAllocInfo {
                live_allocs: 1,
                shared: false,
            },
        );
        Ok(BufferManagedPtr::new(page_id, 0))
    }

    fn allocate_packed(&self, size: usize, align: usize) -> Result<BufferManagedPtr<u8>> {
        let mut open_guard = self.alloc_state.open_page.lock();
        if let Some(open) = open_guard.as_mut() {
            let offset = open.offset.next_multiple_of(align);
            if offset + size <= PageSizeClass::MIN.bytes() {
                open.offset = offset + size;
                let page_id = open.page_id;
                let mut info = self
                    .alloc_state
                    .live
                    .get_mut(&page_id)
                    .expect("open page without allocation info");
                info.live_allocs += 1;
                return Ok(BufferManagedPtr::new(page_id, offset));
            }
            // Exhausted. Close it; if everything inside was already
            // freed the page goes away now.
            let closed = open_guard.take().unwrap();
            let empty = self
                .alloc_state
                .live
                .remove_if(&closed.page_id, |_, info| info.live_allocs == 0)
                .is_some();
            if empty {
                self.release_page(closed.page_id);
            }
        }
        let page_id = self.new_page(PageSizeClass::MIN)?;
        self.alloc_state.live.insert(
            page_id,
            PageAllocInfo {
                live_allocs: 1,
                shared: true,
            },
        );
        *open_guard = Some(OpenPage {
            page_id,
            offset: size,
        });
        Ok(BufferManagedPtr::new(page_id, 0))
    }

    /// Return a byte range to the allocator. When its page becomes
    /// fully empty the page is released and its PageID reused.
    pub fn deallocate(&self, ptr: BufferManagedPtr<u8>, size: usize, align: usize) {
        let _ = (size, align);
        if ptr.is_null() {
            return;
        }
        let page_id = ptr.page_id();
        let (remaining, shared) = match self.alloc_state.live.get_mut(&page_id) {
            Some(mut info) => {
                debug_assert!(info.live_allocs > 0, "double free on buffer page");
                info.live_allocs -= 1;
                (info.live_allocs, info.shared)
            }
            None => {
                debug_assert!(false, "deallocate of unknown buffer page");
                return;
            }
        };
        if remaining > 0 {
            return;
        }
        if !shared {
            self.alloc_state.live.remove(&page_id);
            self.release_page(page_id);
            return;
        }
        // The open page keeps accepting packed allocations even when
        // momentarily empty; closed shared pages go away.
        let open_guard = self.alloc_state.open_page.lock();
        let is_open = matches!(&*open_guard, Some(open) if open.page_id == page_id);
        if is_open {
            return;
        }
        let removed = self
            .alloc_state
            .live
            .remove_if(&page_id, |_, info| info.live_allocs == 0)
            .is_some();
        drop(open_guard);
        if removed {
            self.release_page(page_id);
        }
    }
}

/// Allocator handle consumed by column containers.
///
/// A plain value carrying the runtime context, so storage code that
/// needs buffer-managed memory never reaches for a hidden global.
/// Containers parameterized over this type live entirely inside
/// buffer-pool pages.
#[derive(Clone, Copy)]
pub struct BufferAllocator {
    manager: &'static BufferManager,
}

impl BufferAllocator {
    #[inline]
    pub fn new(manager: &'static BufferManager) -> Self {
        BufferAllocator { manager }
    }

    #[inline]
    pub fn manager(&self) -> &'static BufferManager {
        self.manager
    }

    #[inline]
    pub fn allocate(&self, size: usize, align: usize) -> Result<BufferManagedPtr<u8>> {
        self.manager.allocate(size, align)
    }

    #[inline]
    pub fn deallocate(&self, ptr: BufferManagedPtr<u8>, size: usize, align: usize) {
        self.manager.deallocate(ptr, size, align);
    }
}
