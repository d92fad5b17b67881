use crate::buffer::page::{INVALID_PAGE_ID, PageID};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Residency state of one page. Packed together with a monotonically
/// increasing version into a single atomic word so that every state
/// transition can atomically detect concurrent mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Page bytes live only on the SSD region.
    Evicted = 0,
    /// A reader won the race to load the page and the SSD read is in
    /// progress. Concurrent readers wait for Resident.
    Loading = 1,
    /// Page bytes occupy the frame's slot in the volatile region.
    Resident = 2,
    /// Enqueued as an eviction candidate. A pin transitions back to
    /// Resident, the evictor transitions to Evicted.
    MarkedForEviction = 3,
    /// A writer holds the frame for write-back.
    LockedExclusive = 4,
}

impl From<u8> for FrameState {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => FrameState::Evicted,
            1 => FrameState::Loading,
            2 => FrameState::Resident,
            3 => FrameState::MarkedForEviction,
            4 => FrameState::LockedExclusive,
            _ => unreachable!("invalid frame state"),
        }
    }
}

const VERSION_BITS: u32 = 56;
const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;

/// Extract the state half of a packed state-and-version word.
#[inline]
pub fn state_of(state_and_version: u64) -> FrameState {
    FrameState::from((state_and_version >> VERSION_BITS) as u8)
}

/// Extract the version half of a packed state-and-version word.
#[inline]
pub fn version_of(state_and_version: u64) -> u64 {
    state_and_version & VERSION_MASK
}

#[inline]
fn pack(state: FrameState, version: u64) -> u64 {
    ((state as u64) << VERSION_BITS) | (version & VERSION_MASK)
}

fn transition_permitted(from: FrameState, to: FrameState) -> bool {
    use FrameState::*;
    matches!(
        (from, to),
        (Evicted, Loading)
            | (Loading, Resident)
            | (Resident, MarkedForEviction)
            | (MarkedForEviction, Resident)
            | (MarkedForEviction, Evicted)
            | (Resident, LockedExclusive)
            | (LockedExclusive, Resident)
    )
}

/// Frame is the metadata header of one page: residency state machine,
/// pin count, dirty flag and tier placement. Frames live in a dense
/// arena owned by the volatile region of their size class; external
/// references are `PageID` values, never frame pointers.
pub struct Frame {
    page_id: PageID,
    state_and_version: AtomicU64,
    pin_count: AtomicU64,
    dirty: AtomicBool,
    // Version recorded when the frame was last enqueued as an
    // eviction candidate. Used by the purge sweep to detect junk.
    eviction_timestamp: AtomicU64,
    // Tier currently backing the slot (0 = DRAM, 1 = NUMA).
    memory_node: AtomicU8,
    // Pins since the page was last loaded. Drives Lazy promotion.
    access_count: AtomicU32,
}

impl Frame {
    #[inline]
    pub fn new(page_id: PageID) -> Self {
        Frame {
            page_id,
            state_and_version: AtomicU64::new(pack(FrameState::Evicted, 0)),
            pin_count: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            eviction_timestamp: AtomicU64::new(0),
            memory_node: AtomicU8::new(0),
            access_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageID {
        self.page_id
    }

    /// Snapshot of the packed state-and-version word.
    #[inline]
    pub fn state_and_version(&self) -> u64 {
        self.state_and_version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        state_of(self.state_and_version())
    }

    #[inline]
    pub fn version(&self) -> u64 {
        version_of(self.state_and_version())
    }

    /// Attempt the transition `snapshot -> new_state`, bumping the
    /// version. Returns the new packed word, or the currently observed
    /// word if some other thread moved the frame first.
    #[inline]
    pub fn try_transition(&self, snapshot: u64, new_state: FrameState) -> Result<u64, u64> {
        debug_assert!(
            transition_permitted(state_of(snapshot), new_state),
            "illegal frame transition {:?} -> {:?}",
            state_of(snapshot),
            new_state
        );
        let new = pack(new_state, version_of(snapshot).wrapping_add(1));
        match self.state_and_version.compare_exchange(
            snapshot,
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(new),
            Err(actual) => Err(actual),
        }
    }

    #[inline]
    pub fn pin_count(&self) -> u64 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Optimistically add a pin. The caller must re-validate the frame
    /// state afterwards and call `sub_pin` if validation fails.
    #[inline]
    pub fn add_pin(&self) -> u64 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remove a pin, returns the remaining count.
    #[inline]
    pub fn sub_pin(&self) -> u64 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin on unpinned frame");
        prev - 1
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub fn eviction_timestamp(&self) -> u64 {
        self.eviction_timestamp.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_eviction_timestamp(&self, version: u64) {
        self.eviction_timestamp.store(version, Ordering::Release);
    }

    #[inline]
    pub fn memory_node(&self) -> u8 {
        self.memory_node.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_memory_node(&self, node: u8) {
        self.memory_node.store(node, Ordering::Release);
    }

    /// CAS the tier tag; used when pins race on promoting a page.
    #[inline]
    pub fn try_set_memory_node(&self, from: u8, to: u8) -> bool {
        self.memory_node
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bump_access_count(&self) -> u32 {
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn reset_access_count(&self) {
        self.access_count.store(0, Ordering::Relaxed);
    }
}

impl Default for Frame {
    #[inline]
    fn default() -> Self {
        Frame::new(INVALID_PAGE_ID)
    }
}
