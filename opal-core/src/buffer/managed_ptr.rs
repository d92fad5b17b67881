use crate::buffer::manager::BufferManager;
use crate::buffer::page::{INVALID_PAGE_ID, PageID};
use crate::error::Result;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Relocatable, swizzleable reference into buffer-managed memory.
///
/// The value is the pair `{PageID, byte_offset}`. Arithmetic and
/// comparison never consult the buffer manager; only [`resolve`]
/// does, triggering read-through when the page is not resident.
/// Because pages live at fixed virtual slots, the pair identifies one
/// address for the whole process lifetime, and it stays valid across
/// evictions and reloads.
///
/// The pointer does not own the page. Callers that dereference the
/// resolved address pair it with `pin`/`unpin` (or a
/// [`crate::buffer::manager::PageGuard`]).
///
/// [`resolve`]: BufferManagedPtr::resolve
pub struct BufferManagedPtr<T> {
    page_id: PageID,
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BufferManagedPtr<T> {
    #[inline]
    pub fn new(page_id: PageID, byte_offset: usize) -> Self {
        BufferManagedPtr {
            page_id,
            offset: byte_offset,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn null() -> Self {
        BufferManagedPtr::new(INVALID_PAGE_ID, 0)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        !self.page_id.valid()
    }

    #[inline]
    pub fn page_id(&self) -> PageID {
        self.page_id
    }

    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    /// Element-wise pointer arithmetic on the embedded offset.
    #[inline]
    pub fn add(self, count: usize) -> Self {
        self.byte_add(count * size_of::<T>())
    }

    #[inline]
    pub fn sub(self, count: usize) -> Self {
        self.byte_sub(count * size_of::<T>())
    }

    #[inline]
    pub fn byte_add(self, bytes: usize) -> Self {
        BufferManagedPtr::new(self.page_id, self.offset + bytes)
    }

    #[inline]
    pub fn byte_sub(self, bytes: usize) -> Self {
        BufferManagedPtr::new(self.page_id, self.offset - bytes)
    }

    /// Element distance to another pointer into the same page.
    #[inline]
    pub fn offset_from(self, other: Self) -> isize {
        debug_assert_eq!(self.page_id, other.page_id);
        (self.offset as isize - other.offset as isize) / size_of::<T>() as isize
    }

    #[inline]
    pub fn cast<U>(self) -> BufferManagedPtr<U> {
        BufferManagedPtr::new(self.page_id, self.offset)
    }

    /// Resolve to a raw address by consulting the buffer manager.
    /// Null pointers resolve to null; everything else is made
    /// resident first.
    pub fn resolve(&self, manager: &BufferManager) -> Result<*mut T> {
        if self.is_null() {
            return Ok(std::ptr::null_mut());
        }
        let base = manager.resolve_address(self.page_id)?;
        // SAFETY: offsets stay within the page by the allocator
        // contract; the slot address is stable.
        Ok(unsafe { base.add(self.offset) } as *mut T)
    }

    // Two pointers are equal iff they resolve to the same address:
    // with fixed page slots that is the normalized pair, with every
    // null pointer collapsing to the same location.
    #[inline]
    fn normalized(&self) -> (PageID, usize) {
        if self.is_null() {
            (INVALID_PAGE_ID, 0)
        } else {
            (self.page_id, self.offset)
        }
    }
}

impl<T> Clone for BufferManagedPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferManagedPtr<T> {}

impl<T> Default for BufferManagedPtr<T> {
    #[inline]
    fn default() -> Self {
        BufferManagedPtr::null()
    }
}

impl<T> PartialEq for BufferManagedPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl<T> Eq for BufferManagedPtr<T> {}

impl<T> PartialOrd for BufferManagedPtr<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for BufferManagedPtr<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl<T> Hash for BufferManagedPtr<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl<T> std::ops::Add<usize> for BufferManagedPtr<T> {
    type Output = Self;
    #[inline]
    fn add(self, count: usize) -> Self {
        BufferManagedPtr::add(self, count)
    }
}

impl<T> std::ops::AddAssign<usize> for BufferManagedPtr<T> {
    #[inline]
    fn add_assign(&mut self, count: usize) {
        *self = BufferManagedPtr::add(*self, count);
    }
}

impl<T> std::ops::Sub<usize> for BufferManagedPtr<T> {
    type Output = Self;
    #[inline]
    fn sub(self, count: usize) -> Self {
        BufferManagedPtr::sub(self, count)
    }
}

impl<T> std::ops::SubAssign<usize> for BufferManagedPtr<T> {
    #[inline]
    fn sub_assign(&mut self, count: usize) {
        *self = BufferManagedPtr::sub(*self, count);
    }
}

impl<T> fmt::Debug for BufferManagedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "BufferManagedPtr(null)");
        }
        write!(f, "BufferManagedPtr({}, offset={})", self.page_id, self.offset)
    }
}
