use parking_lot::Mutex;

/// Trait to extend u64 slice with bitmap functionalities.
/// To avoid naming conflicts, all methods are prefixed with "bitmap_".
pub trait Bitmap {
    /// Returns bool value at given bit.
    fn bitmap_get(&self, idx: usize) -> bool;

    /// Set bit to true at given position.
    fn bitmap_set(&mut self, idx: usize) -> bool;

    /// Unset given bit to be false.
    fn bitmap_unset(&mut self, idx: usize) -> bool;

    /// Returns mutable units.
    fn bitmap_units_mut(&mut self) -> &mut [u64];

    /// Set the first zero bit to true within given range.
    #[inline]
    fn bitmap_set_first(&mut self, unit_start_idx: usize, unit_end_idx: usize) -> Option<usize> {
        if unit_start_idx >= unit_end_idx {
            return None;
        }
        let mut unit_idx = unit_start_idx;
        for v in &mut self.bitmap_units_mut()[unit_start_idx..unit_end_idx] {
            let bit_idx = (*v).trailing_ones();
            if bit_idx < 64 {
                *v |= 1 << bit_idx;
                return Some(unit_idx * 64 + bit_idx as usize);
            }
            unit_idx += 1;
        }
        None
    }
}

impl Bitmap for [u64] {
    #[inline]
    fn bitmap_get(&self, idx: usize) -> bool {
        let unit_idx = idx / 64;
        let bit_idx = idx % 64;
        self[unit_idx] & (1 << bit_idx) != 0
    }

    #[inline]
    fn bitmap_set(&mut self, idx: usize) -> bool {
        let unit_idx = idx / 64;
        let bit_idx = idx % 64;
        if self[unit_idx] & (1 << bit_idx) != 0 {
            return false;
        }
        self[unit_idx] |= 1 << bit_idx;
        true
    }

    #[inline]
    fn bitmap_unset(&mut self, idx: usize) -> bool {
        let unit_idx = idx / 64;
        let bit_idx = idx % 64;
        if self[unit_idx] & (1 << bit_idx) == 0 {
            return false;
        }
        self[unit_idx] &= !(1 << bit_idx);
        true
    }

    #[inline]
    fn bitmap_units_mut(&mut self) -> &mut [u64] {
        self
    }
}

/// Create a new bitmap with all zeros.
#[inline]
pub fn new_bitmap(nbr_of_bits: usize) -> Box<[u64]> {
    let len = nbr_of_bits.div_ceil(64);
    vec![0u64; len].into_boxed_slice()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FreeBitmap {
    free_unit_idx: usize,
    bitmap: Box<[u64]>,
}

/// AllocMap is an allocation controller backed by bitmap.
#[derive(Debug)]
pub struct AllocMap {
    len: usize,
    inner: Mutex<FreeBitmap>,
}

impl AllocMap {
    /// Create a new AllocMap.
    #[inline]
    pub fn new(len: usize) -> Self {
        AllocMap {
            inner: Mutex::new(FreeBitmap {
                free_unit_idx: 0,
                bitmap: new_bitmap(len),
            }),
            len,
        }
    }

    /// Try to allocate a new object, returns index of object.
    #[inline]
    pub fn try_allocate(&self) -> Option<usize> {
        let unit_end_idx = self.len.div_ceil(64);
        let mut g = self.inner.lock();
        let unit_start_idx = g.free_unit_idx;
        if let Some(idx) = g.bitmap.bitmap_set_first(unit_start_idx, unit_end_idx)
            && idx < self.len
        {
            if idx / 64 != g.free_unit_idx {
                // free unit exhausted.
                g.free_unit_idx = idx / 64;
            }
            return Some(idx);
        }
        // Because when deallocating, free unit index is always moved
        // to the smallest free position, it's impossible to have free
        // bit among [0..free_unit_idx].
        None
    }

    /// Deallocate an object with its index.
    #[inline]
    pub fn deallocate(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let mut g = self.inner.lock();
        if g.bitmap.bitmap_unset(idx) {
            if idx / 64 < g.free_unit_idx {
                g.free_unit_idx = idx / 64;
            }
            return true;
        }
        false
    }

    /// Returns whether the object at given index is allocated.
    #[inline]
    pub fn is_allocated(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let g = self.inner.lock();
        g.bitmap.bitmap_get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_set_unset() {
        let mut bm = new_bitmap(130);
        assert!(!bm.bitmap_get(0));
        assert!(bm.bitmap_set(0));
        assert!(!bm.bitmap_set(0));
        assert!(bm.bitmap_get(0));
        assert!(bm.bitmap_set(129));
        assert!(bm.bitmap_get(129));
        assert!(bm.bitmap_unset(0));
        assert!(!bm.bitmap_unset(0));
    }

    #[test]
    fn test_bitmap_set_first() {
        let mut bm = new_bitmap(128);
        for i in 0..64 {
            assert_eq!(bm.bitmap_set_first(0, 2), Some(i));
        }
        assert_eq!(bm.bitmap_set_first(0, 2), Some(64));
        assert_eq!(bm.bitmap_set_first(1, 1), None);
    }

    #[test]
    fn test_alloc_map() {
        let map = AllocMap::new(100);
        assert_eq!(map.try_allocate(), Some(0));
        assert_eq!(map.try_allocate(), Some(1));
        assert!(map.is_allocated(0));
        assert!(!map.is_allocated(2));
        assert!(map.deallocate(0));
        assert!(!map.deallocate(0));
        // Freed slots are reused lowest-first.
        assert_eq!(map.try_allocate(), Some(0));
    }

    #[test]
    fn test_alloc_map_exhaustion() {
        let map = AllocMap::new(65);
        for i in 0..65 {
            assert_eq!(map.try_allocate(), Some(i));
        }
        assert_eq!(map.try_allocate(), None);
        assert!(map.deallocate(64));
        assert_eq!(map.try_allocate(), Some(64));
    }
}
