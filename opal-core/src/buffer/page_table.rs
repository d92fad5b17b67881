use crate::buffer::page::PageID;
use dashmap::DashMap;

/// Concurrent residency table.
///
/// Tracks the set of PageIDs whose frame is currently in a
/// non-evicted state (Loading, Resident, MarkedForEviction or
/// LockedExclusive). Frames themselves live in the dense per-class
/// arena of the volatile region and are addressed by `PageID` index,
/// so the table carries membership, not pointers.
///
/// Readers are lock-free in the common case; writers serialize per
/// shard.
#[derive(Default)]
pub struct PageTable {
    map: DashMap<PageID, ()>,
}

impl PageTable {
    #[inline]
    pub fn new() -> Self {
        PageTable {
            map: DashMap::new(),
        }
    }

    #[inline]
    pub fn contains(&self, page_id: PageID) -> bool {
        self.map.contains_key(&page_id)
    }

    /// Insert the page if absent. Returns false if it was present.
    #[inline]
    pub fn insert_if_absent(&self, page_id: PageID) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.map.entry(page_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vac) => {
                vac.insert(());
                true
            }
        }
    }

    /// Remove the page. Returns false if it was absent.
    #[inline]
    pub fn erase(&self, page_id: PageID) -> bool {
        self.map.remove(&page_id).is_some()
    }

    /// Number of non-evicted pages. Approximate under concurrency.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::PageSizeClass;

    #[test]
    fn test_page_table_membership() {
        let table = PageTable::new();
        let a = PageID::new(PageSizeClass::KiB4, 1);
        let b = PageID::new(PageSizeClass::KiB8, 1);
        assert!(table.insert_if_absent(a));
        assert!(!table.insert_if_absent(a));
        assert!(table.contains(a));
        assert!(!table.contains(b));
        assert_eq!(table.len(), 1);
        assert!(table.erase(a));
        assert!(!table.erase(a));
        assert!(table.is_empty());
    }
}
