use crate::bitmap::AllocMap;
use crate::buffer::alloc::PackedAllocState;
use crate::buffer::evict::{
    EvictionItem, EvictionQueue, IDLE_EVICTION_QUEUE_PURGE, MAX_EVICTION_QUEUE_PURGES,
};
use crate::buffer::frame::{Frame, FrameState, state_of, version_of};
use crate::buffer::page::{PageID, PageSizeClass, SIZE_CLASS_COUNT};
use crate::buffer::page_table::PageTable;
use crate::buffer::ssd::SsdRegion;
use crate::buffer::stats::BufferManagerStats;
use crate::buffer::volatile::{VolatileRegion, create_volatile_regions, mmap_release, mmap_reserve};
use crate::buffer::{MAX_REPEAT_COUNT, yield_backoff};
use crate::error::{Error, Result};
use crate::lifetime::StaticLifetime;
use crate::thread::spawn_named;
use byte_unit::Byte;
use crossbeam_utils::CachePadded;
use event_listener::{Event, Listener, listener};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Pins on a NUMA-resident page before it is promoted to DRAM under
/// the Lazy policy.
pub const LAZY_PROMOTE_THRESHOLD: u32 = 2;

/// Controls when pages move between the DRAM tier and the optional
/// NUMA tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPolicy {
    /// Load misses into the NUMA tier, promote to DRAM on repeated
    /// access.
    Lazy,
    /// Load misses straight into DRAM; DRAM victims are demoted to
    /// the NUMA tier instead of going to SSD.
    #[default]
    Eager,
    /// Never touch the NUMA tier.
    DramOnly,
    /// Keep all residency on the NUMA tier.
    NumaOnly,
}

impl FromStr for MigrationPolicy {
    type Err = Error;
    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        let res = match s.to_lowercase().as_str() {
            "lazy" => MigrationPolicy::Lazy,
            "eager" => MigrationPolicy::Eager,
            "dram_only" | "dramonly" => MigrationPolicy::DramOnly,
            "numa_only" | "numaonly" => MigrationPolicy::NumaOnly,
            _ => return Err(Error::InvalidArgument),
        };
        Ok(res)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolTier {
    Dram = 0,
    Numa = 1,
}

/// One capacity tier: byte budget, usage accounting and the eviction
/// queue feeding victim selection for this tier.
struct BufferPool {
    max_bytes: usize,
    used_bytes: CachePadded<AtomicUsize>,
    eviction_queue: EvictionQueue,
    memory_node: u32,
}

impl BufferPool {
    fn new(max_bytes: usize, memory_node: u32) -> Self {
        BufferPool {
            max_bytes,
            used_bytes: CachePadded::new(AtomicUsize::new(0)),
            eviction_queue: EvictionQueue::new(),
            memory_node,
        }
    }

    /// Reserve budget for one page; fails when the tier is full.
    fn try_reserve(&self, bytes: usize) -> bool {
        let mut used = self.used_bytes.load(Ordering::Acquire);
        loop {
            if used + bytes > self.max_bytes {
                return false;
            }
            match self.used_bytes.compare_exchange(
                used,
                used + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    #[inline]
    fn release(&self, bytes: usize) {
        let prev = self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes);
    }

    #[inline]
    fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }
}

const DEFAULT_SSD_PATH: &str = "opal_buffer.bin";
const DEFAULT_DRAM_POOL_SIZE: Byte = Byte::from_u64(1024 * 1024 * 1024); // 1 GiB
const DEFAULT_NUMA_POOL_SIZE: Byte = Byte::from_u64(4 * 1024 * 1024 * 1024); // 4 GiB
const DEFAULT_RESERVED_VIRTUAL_MEMORY: Byte = Byte::from_u64(16 * 1024 * 1024 * 1024); // 16 GiB

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferManagerConfig {
    /// Max bytes held simultaneously in the DRAM tier.
    dram_buffer_pool_size: Byte,
    /// Second-tier capacity on a remote NUMA node; unused unless
    /// `enable_numa` is set.
    numa_buffer_pool_size: Byte,
    /// Node the primary DRAM region is allocated on.
    cpu_node: u32,
    /// Node backing the second tier.
    numa_memory_node: u32,
    enable_numa: bool,
    migration_policy: MigrationPolicy,
    /// File or block device for the SSD region.
    ssd_path: String,
    /// Virtual address space reserved up front; bounds the number of
    /// distinct PageIDs per size class.
    reserved_virtual_memory: Byte,
    enable_eviction_purge_worker: bool,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        BufferManagerConfig {
            dram_buffer_pool_size: DEFAULT_DRAM_POOL_SIZE,
            numa_buffer_pool_size: DEFAULT_NUMA_POOL_SIZE,
            cpu_node: 0,
            numa_memory_node: 1,
            enable_numa: false,
            migration_policy: MigrationPolicy::default(),
            ssd_path: String::from(DEFAULT_SSD_PATH),
            reserved_virtual_memory: DEFAULT_RESERVED_VIRTUAL_MEMORY,
            enable_eviction_purge_worker: true,
        }
    }
}

impl BufferManagerConfig {
    /// Load the configuration from the environment, falling back to
    /// defaults for unset options.
    pub fn from_env() -> Self {
        let mut config = BufferManagerConfig::default();
        if let Ok(v) = std::env::var("OPAL_DRAM_BUFFER_POOL_SIZE")
            && let Ok(bytes) = Byte::parse_str(&v, true)
        {
            config.dram_buffer_pool_size = bytes;
        }
        if let Ok(v) = std::env::var("OPAL_NUMA_BUFFER_POOL_SIZE")
            && let Ok(bytes) = Byte::parse_str(&v, true)
        {
            config.numa_buffer_pool_size = bytes;
        }
        if let Ok(v) = std::env::var("OPAL_CPU_NODE")
            && let Ok(node) = v.parse()
        {
            config.cpu_node = node;
        }
        if let Ok(v) = std::env::var("OPAL_ENABLE_NUMA") {
            config.enable_numa = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("OPAL_MIGRATION_POLICY")
            && let Ok(policy) = v.parse()
        {
            config.migration_policy = policy;
        }
        if let Ok(v) = std::env::var("OPAL_SSD_PATH") {
            config.ssd_path = v;
        }
        config
    }

    #[inline]
    pub fn with_main_dir(mut self, main_dir: impl AsRef<Path>) -> Self {
        let path = main_dir.as_ref().join(&self.ssd_path);
        self.ssd_path = path.to_string_lossy().to_string();
        self
    }

    #[inline]
    pub fn dram_buffer_pool_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.dram_buffer_pool_size = Byte::from(size);
        self
    }

    #[inline]
    pub fn numa_buffer_pool_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.numa_buffer_pool_size = Byte::from(size);
        self
    }

    #[inline]
    pub fn reserved_virtual_memory<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.reserved_virtual_memory = Byte::from(size);
        self
    }

    #[inline]
    pub fn cpu_node(mut self, node: u32) -> Self {
        self.cpu_node = node;
        self
    }

    #[inline]
    pub fn numa_memory_node(mut self, node: u32) -> Self {
        self.numa_memory_node = node;
        self
    }

    #[inline]
    pub fn enable_numa(mut self, enable: bool) -> Self {
        self.enable_numa = enable;
        self
    }

    #[inline]
    pub fn migration_policy(mut self, policy: MigrationPolicy) -> Self {
        self.migration_policy = policy;
        self
    }

    #[inline]
    pub fn ssd_path(mut self, path: impl Into<String>) -> Self {
        self.ssd_path = path.into();
        self
    }

    #[inline]
    pub fn enable_eviction_purge_worker(mut self, enable: bool) -> Self {
        self.enable_eviction_purge_worker = enable;
        self
    }

    pub fn build(self) -> Result<BufferManager> {
        let dram_bytes = self.dram_buffer_pool_size.as_u64() as usize;
        let numa_bytes = self.numa_buffer_pool_size.as_u64() as usize;
        let reserved = self.reserved_virtual_memory.as_u64() as usize;
        if dram_bytes < PageSizeClass::MIN.bytes() {
            return Err(Error::BufferPoolSizeTooSmall);
        }

        // Over-reserve by one max-class page so the region base can be
        // rounded up; slot addresses then satisfy any alignment up to
        // the page size.
        let max_class_bytes = PageSizeClass::MAX.bytes();
        let mapped_bytes = reserved + max_class_bytes;
        let mapped_raw = unsafe { mmap_reserve(mapped_bytes)? };
        let aligned_base = ((mapped_raw as usize + max_class_bytes - 1) & !(max_class_bytes - 1))
            as *mut u8;
        let regions = create_volatile_regions(aligned_base, reserved);

        let mut capacities = [0usize; SIZE_CLASS_COUNT];
        for (k, region) in regions.iter().enumerate() {
            capacities[k] = region.capacity();
        }
        let ssd = match SsdRegion::create(&self.ssd_path, capacities) {
            Ok(ssd) => ssd,
            Err(e) => {
                unsafe { mmap_release(mapped_raw, mapped_bytes) };
                return Err(e);
            }
        };
        let alloc_maps = regions
            .iter()
            .map(|region| AllocMap::new(region.capacity()))
            .collect();

        let dram_pool = BufferPool::new(dram_bytes, self.cpu_node);
        let numa_pool = (self.enable_numa && numa_bytes > 0)
            .then(|| BufferPool::new(numa_bytes, self.numa_memory_node));
        log::info!(
            "buffer manager: dram={} bytes, numa={:?} bytes, policy={:?}",
            dram_bytes,
            numa_pool.as_ref().map(|p| p.max_bytes),
            self.migration_policy
        );

        Ok(BufferManager {
            config: self,
            mapped_raw,
            mapped_bytes,
            regions,
            alloc_maps,
            page_table: PageTable::new(),
            dram_pool,
            numa_pool,
            ssd,
            stats: BufferManagerStats::default(),
            alloc_state: PackedAllocState::default(),
            shutdown: AtomicBool::new(false),
            purge_ev: Event::new(),
            purge_thread: Mutex::new(None),
        })
    }

    /// Build the manager, leak it and start the background eviction
    /// purge worker when configured.
    pub fn build_static(self) -> Result<&'static BufferManager> {
        let manager = self.build()?;
        let manager = StaticLifetime::new_static(manager);
        if manager.config.enable_eviction_purge_worker {
            manager.start_purge_worker();
        }
        Ok(manager)
    }
}

/// The buffer manager: page identity, residency, pinning, tiered
/// eviction and the allocator façade consumed by column storage.
///
/// All page bytes live at fixed virtual addresses inside the reserved
/// per-class regions; residency oscillation never moves a page, so a
/// `{PageID, offset}` pair stays valid across evictions and reloads.
pub struct BufferManager {
    config: BufferManagerConfig,
    mapped_raw: *mut u8,
    mapped_bytes: usize,
    regions: Vec<VolatileRegion>,
    alloc_maps: Vec<AllocMap>,
    page_table: PageTable,
    dram_pool: BufferPool,
    numa_pool: Option<BufferPool>,
    ssd: SsdRegion,
    stats: BufferManagerStats,
    pub(super) alloc_state: PackedAllocState,
    shutdown: AtomicBool,
    purge_ev: Event,
    purge_thread: Mutex<Option<JoinHandle<()>>>,
}

unsafe impl Send for BufferManager {}
unsafe impl Sync for BufferManager {}
unsafe impl StaticLifetime for BufferManager {}

impl BufferManager {
    #[inline]
    pub fn config(&self) -> &BufferManagerConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &BufferManagerStats {
        &self.stats
    }

    #[inline]
    pub fn ssd_read_count(&self) -> u64 {
        self.ssd.read_count()
    }

    #[inline]
    pub fn ssd_write_count(&self) -> u64 {
        self.ssd.write_count()
    }

    /// Number of pages currently in a non-evicted state.
    #[inline]
    pub fn resident_page_count(&self) -> usize {
        self.page_table.len()
    }

    #[inline]
    pub fn pool_used_bytes(&self, tier: PoolTier) -> usize {
        self.pool(tier).used_bytes()
    }

    #[inline]
    fn region(&self, page_id: PageID) -> &VolatileRegion {
        &self.regions[page_id.size_class() as usize]
    }

    #[inline]
    pub(super) fn frame(&self, page_id: PageID) -> &Frame {
        self.region(page_id).frame(page_id.index())
    }

    #[inline]
    fn pool(&self, tier: PoolTier) -> &BufferPool {
        match tier {
            PoolTier::Dram => &self.dram_pool,
            PoolTier::Numa => self
                .numa_pool
                .as_ref()
                .expect("numa tier is not configured"),
        }
    }

    #[inline]
    fn frame_tier(&self, frame: &Frame) -> PoolTier {
        if frame.memory_node() == PoolTier::Numa as u8 && self.numa_pool.is_some() {
            PoolTier::Numa
        } else {
            PoolTier::Dram
        }
    }

    /// Tier a missed page is loaded into.
    #[inline]
    fn target_load_tier(&self) -> PoolTier {
        if self.numa_pool.is_none() {
            return PoolTier::Dram;
        }
        match self.config.migration_policy {
            MigrationPolicy::NumaOnly | MigrationPolicy::Lazy => PoolTier::Numa,
            MigrationPolicy::Eager | MigrationPolicy::DramOnly => PoolTier::Dram,
        }
    }

    /// Allocate a fresh page of the given class. The page comes back
    /// RESIDENT, unpinned, dirty (there is no copy on disk yet) and
    /// already registered as an eviction candidate.
    pub fn new_page(&self, size_class: PageSizeClass) -> Result<PageID> {
        let class_idx = size_class as usize;
        let Some(index) = self.alloc_maps[class_idx].try_allocate() else {
            // PageID space exhausted surfaces like memory exhaustion.
            return Err(Error::OutOfMemory);
        };
        let page_id = PageID::new(size_class, index as u64);
        let tier = match self.config.migration_policy {
            MigrationPolicy::NumaOnly if self.numa_pool.is_some() => PoolTier::Numa,
            _ => PoolTier::Dram,
        };
        if let Err(e) = self.ensure_free_bytes(tier, size_class.bytes()) {
            self.alloc_maps[class_idx].deallocate(index);
            return Err(e);
        }

        let frame = self.frame(page_id);
        debug_assert_eq!(frame.state(), FrameState::Evicted);
        debug_assert_eq!(frame.pin_count(), 0);
        let region = self.region(page_id);
        region.unprotect_page(page_id.index());
        // Fresh pages walk EVICTED -> LOADING -> RESIDENT without an
        // SSD read; the slot is zero-filled by the kernel on first
        // touch after the previous MADV_DONTNEED.
        let sv = frame.state_and_version();
        let sv = frame
            .try_transition(sv, FrameState::Loading)
            .unwrap_or_else(|_| unreachable!("fresh page raced on loading"));
        self.page_table.insert_if_absent(page_id);
        frame.set_dirty(true);
        frame.set_memory_node(tier as u8);
        frame.reset_access_count();
        if self.config.enable_numa {
            region.bind_page_to_node(page_id.index(), self.pool(tier).memory_node);
        }
        let res = frame.try_transition(sv, FrameState::Resident);
        debug_assert!(res.is_ok());
        // Unpinned resident pages are eviction candidates right away.
        self.add_to_eviction_queue(page_id, frame);
        Ok(page_id)
    }

    /// Release a page entirely: drop its bytes from the volatile
    /// region and free its PageID for reuse. The on-disk slot keeps
    /// stale bytes; a future page under the same ID starts dirty, so
    /// they are never observed.
    pub fn release_page(&self, page_id: PageID) {
        let frame = self.frame(page_id);
        let mut repeat = 0;
        loop {
            let sv = frame.state_and_version();
            match state_of(sv) {
                FrameState::Evicted => break,
                FrameState::Resident | FrameState::MarkedForEviction => {
                    debug_assert_eq!(frame.pin_count(), 0, "release of pinned page");
                    let marked_sv = if state_of(sv) == FrameState::Resident {
                        match frame.try_transition(sv, FrameState::MarkedForEviction) {
                            Ok(sv) => sv,
                            Err(_) => continue,
                        }
                    } else {
                        sv
                    };
                    if frame
                        .try_transition(marked_sv, FrameState::Evicted)
                        .is_ok()
                    {
                        self.region(page_id).free_page(page_id.index());
                        self.page_table.erase(page_id);
                        self.pool(self.frame_tier(frame))
                            .release(page_id.num_bytes());
                        frame.set_dirty(false);
                        frame.reset_access_count();
                        break;
                    }
                }
                FrameState::Loading | FrameState::LockedExclusive => {
                    yield_backoff(repeat);
                }
            }
            repeat += 1;
        }
        self.alloc_maps[page_id.size_class() as usize].deallocate(page_id.index() as usize);
    }

    /// Pin the page, guaranteeing it is RESIDENT, and return its raw
    /// address. Valid until the matching `unpin`. Triggers read-through
    /// on miss.
    pub fn pin(&self, page_id: PageID) -> Result<*mut u8> {
        debug_assert!(page_id.valid(), "pin of invalid page id");
        debug_assert!(
            self.alloc_maps[page_id.size_class() as usize].is_allocated(page_id.index() as usize),
            "pin of unallocated page"
        );
        let frame = self.frame(page_id);
        let mut repeat = 0;
        let mut missed = false;
        loop {
            let sv = frame.state_and_version();
            match state_of(sv) {
                FrameState::Resident => {
                    frame.add_pin();
                    // Re-validate: the frame may have moved away
                    // between the snapshot and the increment.
                    if frame.state() == FrameState::Resident {
                        if !missed {
                            self.stats.bump_hits();
                        }
                        self.maybe_promote(page_id, frame);
                        return Ok(self.region(page_id).page_data(page_id.index()));
                    }
                    frame.sub_pin();
                }
                FrameState::MarkedForEviction => {
                    // Re-pin wins over the pending eviction.
                    if frame.try_transition(sv, FrameState::Resident).is_ok() {
                        frame.add_pin();
                        if !missed {
                            self.stats.bump_hits();
                        }
                        self.maybe_promote(page_id, frame);
                        return Ok(self.region(page_id).page_data(page_id.index()));
                    }
                }
                FrameState::Loading | FrameState::LockedExclusive => {
                    yield_backoff(repeat);
                }
                FrameState::Evicted => {
                    missed = true;
                    self.make_resident(page_id, frame, sv)?;
                }
            }
            repeat += 1;
        }
    }

    /// Drop one pin. `dirty = true` records that bytes were modified
    /// under the pin. A pin count reaching zero makes the page an
    /// eviction candidate.
    pub fn unpin(&self, page_id: PageID, dirty: bool) {
        let frame = self.frame(page_id);
        if dirty {
            frame.set_dirty(true);
        }
        if frame.sub_pin() == 0 {
            self.add_to_eviction_queue(page_id, frame);
        }
    }

    /// Pin-and-deref convenience; the caller balances with `unpin`.
    #[inline]
    pub fn get_page(&self, page_id: PageID) -> Result<*mut u8> {
        self.pin(page_id)
    }

    /// RAII pin: unpins (with the recorded dirty flag) on drop.
    pub fn pin_scoped(&self, page_id: PageID) -> Result<PageGuard<'_>> {
        let data = self.pin(page_id)?;
        Ok(PageGuard {
            manager: self,
            page_id,
            data,
            dirty: false,
        })
    }

    /// Resolve a page to its stable raw address without touching the
    /// pin count, loading it from SSD if necessary. Callers that need
    /// the address to stay mapped pair this with `pin`/`unpin`.
    pub fn resolve_address(&self, page_id: PageID) -> Result<*mut u8> {
        debug_assert!(page_id.valid(), "resolve of invalid page id");
        let frame = self.frame(page_id);
        let mut repeat = 0;
        loop {
            let sv = frame.state_and_version();
            match state_of(sv) {
                FrameState::Resident
                | FrameState::MarkedForEviction
                | FrameState::LockedExclusive => {
                    return Ok(self.region(page_id).page_data(page_id.index()));
                }
                FrameState::Loading => yield_backoff(repeat),
                FrameState::Evicted => {
                    self.make_resident(page_id, frame, sv)?;
                }
            }
            repeat += 1;
        }
    }

    /// Inverse resolution: map a raw address inside some volatile
    /// region back to its `{PageID, offset}` pair.
    pub fn unswizzle(&self, ptr: *const u8) -> Option<(PageID, usize)> {
        for region in &self.regions {
            if let Some((index, offset)) = region.find_page(ptr) {
                let page_id = PageID::new(region.size_class(), index);
                if !self.alloc_maps[region.size_class() as usize].is_allocated(index as usize) {
                    return None;
                }
                return Some((page_id, offset));
            }
        }
        None
    }

    /// Read-through: the winner of the EVICTED -> LOADING race
    /// reserves tier budget, reads the page from SSD into its fixed
    /// slot and publishes it RESIDENT. Losers observe LOADING and
    /// retry with backoff.
    fn make_resident(&self, page_id: PageID, frame: &Frame, snapshot: u64) -> Result<()> {
        let tier = self.target_load_tier();
        let bytes = page_id.num_bytes();
        // Budget first: a failed reservation must not leave the frame
        // in LOADING.
        self.ensure_free_bytes(tier, bytes)?;
        let sv = match frame.try_transition(snapshot, FrameState::Loading) {
            Ok(sv) => sv,
            Err(_) => {
                // Lost the race; another thread is handling the miss.
                self.pool(tier).release(bytes);
                return Ok(());
            }
        };
        self.stats.bump_misses();
        self.page_table.insert_if_absent(page_id);
        let region = self.region(page_id);
        region.unprotect_page(page_id.index());
        let data = region.page_data(page_id.index());
        if let Err(e) = self.ssd.read_page(page_id, data) {
            log::error!("fatal read error on {}: {}", page_id, e);
            std::process::abort();
        }
        frame.set_dirty(false);
        frame.set_memory_node(tier as u8);
        frame.reset_access_count();
        if self.config.enable_numa {
            region.bind_page_to_node(page_id.index(), self.pool(tier).memory_node);
        }
        // Only the loading thread leaves LOADING.
        let res = frame.try_transition(sv, FrameState::Resident);
        debug_assert!(res.is_ok());
        Ok(())
    }

    /// Lazy policy: promote a NUMA-resident page to DRAM once it has
    /// been pinned often enough and DRAM has room.
    fn maybe_promote(&self, page_id: PageID, frame: &Frame) {
        let access_count = frame.bump_access_count();
        if self.config.migration_policy != MigrationPolicy::Lazy
            || access_count < LAZY_PROMOTE_THRESHOLD
        {
            return;
        }
        let Some(numa_pool) = &self.numa_pool else {
            return;
        };
        if frame.memory_node() != PoolTier::Numa as u8 {
            return;
        }
        let bytes = page_id.num_bytes();
        if !self.dram_pool.try_reserve(bytes) {
            return;
        }
        // One promoter wins the tier tag; the losers give the budget
        // back.
        if frame.try_set_memory_node(PoolTier::Numa as u8, PoolTier::Dram as u8) {
            numa_pool.release(bytes);
            if self.config.enable_numa {
                self.region(page_id)
                    .bind_page_to_node(page_id.index(), self.dram_pool.memory_node);
            }
            self.stats.bump_promotions();
        } else {
            self.dram_pool.release(bytes);
        }
    }

    /// Reserve budget on a tier, evicting (or demoting) victims under
    /// memory pressure. Popping a stale hint still drains the queue
    /// and does not count as failure; an empty queue does. After a
    /// bounded number of empty attempts allocation fails with
    /// `OutOfMemory`.
    fn ensure_free_bytes(&self, tier: PoolTier, bytes: usize) -> Result<()> {
        let pool = self.pool(tier);
        let mut failed_attempts = 0;
        loop {
            if pool.try_reserve(bytes) {
                return Ok(());
            }
            if failed_attempts >= MAX_REPEAT_COUNT {
                return Err(Error::OutOfMemory);
            }
            if self.evict_or_demote_one(tier) {
                failed_attempts = 0;
            } else {
                failed_attempts += 1;
            }
        }
    }

    /// Pop one candidate from the tier's queue and act on it if it is
    /// still valid. DRAM victims are demoted to the NUMA tier when one
    /// exists and the policy allows; everything else is written back
    /// (if dirty) and evicted to SSD. Returns whether an item was
    /// popped at all.
    fn evict_or_demote_one(&self, tier: PoolTier) -> bool {
        let pool = self.pool(tier);
        let Some(item) = pool.eviction_queue.pop() else {
            return false;
        };
        let frame = self.frame(item.page_id);
        let sv = frame.state_and_version();
        if !item.can_evict(sv) || frame.pin_count() > 0 {
            // Stale hint; the version moved on or the page is pinned.
            return true;
        }
        if tier == PoolTier::Dram
            && self.numa_pool.is_some()
            && self.config.migration_policy != MigrationPolicy::DramOnly
            && self.demote(item.page_id, frame, sv)
        {
            return true;
        }
        self.evict(item.page_id, frame, sv, tier);
        true
    }

    /// Move a DRAM victim to the NUMA tier: the page stays RESIDENT,
    /// only its physical backing and accounting change. Returns false
    /// when the NUMA tier has no room, falling back to SSD eviction.
    fn demote(&self, page_id: PageID, frame: &Frame, snapshot: u64) -> bool {
        let numa_pool = self.numa_pool.as_ref().unwrap();
        let bytes = page_id.num_bytes();
        if !numa_pool.try_reserve(bytes) {
            // Make room on the second tier once, then retry.
            self.evict_or_demote_one(PoolTier::Numa);
            if !numa_pool.try_reserve(bytes) {
                return false;
            }
        }
        let sv = match frame.try_transition(snapshot, FrameState::Resident) {
            Ok(sv) => sv,
            Err(_) => {
                // A pin slipped in; the candidate is gone either way.
                numa_pool.release(bytes);
                return true;
            }
        };
        frame.set_memory_node(PoolTier::Numa as u8);
        if self.config.enable_numa {
            self.region(page_id)
                .bind_page_to_node(page_id.index(), numa_pool.memory_node);
        }
        self.dram_pool.release(bytes);
        self.stats.bump_demotions();
        // Still unpinned: immediately a candidate on the NUMA tier.
        if let Ok(marked) = frame.try_transition(sv, FrameState::MarkedForEviction) {
            let timestamp = version_of(marked);
            frame.set_eviction_timestamp(timestamp);
            numa_pool.eviction_queue.push(EvictionItem {
                page_id,
                timestamp,
            });
        }
        true
    }

    /// Evict a validated victim to SSD. Dirty pages take the
    /// write-back chain MARKED -> RESIDENT -> LOCKED_EXCLUSIVE ->
    /// (write) -> RESIDENT -> MARKED before the final MARKED ->
    /// EVICTED step; every CAS aborts the chain when a concurrent pin
    /// intervenes.
    fn evict(&self, page_id: PageID, frame: &Frame, snapshot: u64, tier: PoolTier) {
        let region = self.region(page_id);
        let mut sv = snapshot;
        if frame.is_dirty() {
            sv = match frame.try_transition(sv, FrameState::Resident) {
                Ok(sv) => sv,
                Err(_) => return,
            };
            sv = match frame.try_transition(sv, FrameState::LockedExclusive) {
                Ok(sv) => sv,
                Err(_) => return,
            };
            if let Err(e) = self.ssd.write_page(page_id, region.page_data(page_id.index())) {
                log::error!("fatal write error on {}: {}", page_id, e);
                std::process::abort();
            }
            frame.set_dirty(false);
            sv = match frame.try_transition(sv, FrameState::Resident) {
                Ok(sv) => sv,
                Err(_) => return,
            };
            sv = match frame.try_transition(sv, FrameState::MarkedForEviction) {
                Ok(sv) => sv,
                Err(_) => return,
            };
            if frame.pin_count() > 0 {
                // A pin arrived while the page was briefly RESIDENT.
                let _ = frame.try_transition(sv, FrameState::Resident);
                return;
            }
        }
        if frame.try_transition(sv, FrameState::Evicted).is_err() {
            return;
        }
        region.free_page(page_id.index());
        self.page_table.erase(page_id);
        self.pool(tier).release(page_id.num_bytes());
        frame.reset_access_count();
        self.stats.bump_evictions();
    }

    /// Mark an unpinned resident page and enqueue it as an eviction
    /// candidate with its fresh version.
    fn add_to_eviction_queue(&self, page_id: PageID, frame: &Frame) {
        loop {
            let sv = frame.state_and_version();
            match state_of(sv) {
                FrameState::Resident => {
                    if frame.pin_count() > 0 {
                        return;
                    }
                    if let Ok(marked) = frame.try_transition(sv, FrameState::MarkedForEviction) {
                        let timestamp = version_of(marked);
                        frame.set_eviction_timestamp(timestamp);
                        self.pool(self.frame_tier(frame))
                            .eviction_queue
                            .push(EvictionItem {
                                page_id,
                                timestamp,
                            });
                        return;
                    }
                }
                FrameState::MarkedForEviction => {
                    // Re-arm the candidate: a previous item for this
                    // mark may have been consumed while the page was
                    // pinned. Duplicates are fine, the version check
                    // discards them.
                    let timestamp = version_of(sv);
                    frame.set_eviction_timestamp(timestamp);
                    self.pool(self.frame_tier(frame))
                        .eviction_queue
                        .push(EvictionItem {
                            page_id,
                            timestamp,
                        });
                    return;
                }
                _ => return,
            }
        }
    }

    /// Drop stale items so the queues stay bounded by live candidates.
    fn purge_eviction_queue(&self, tier: PoolTier) {
        let pool = self.pool(tier);
        let sweep = pool.eviction_queue.len().min(MAX_EVICTION_QUEUE_PURGES);
        for _ in 0..sweep {
            let Some(item) = pool.eviction_queue.pop() else {
                return;
            };
            if item.is_stale(self.frame(item.page_id)) {
                self.stats.bump_purged_items();
            } else {
                pool.eviction_queue.push(item);
            }
        }
    }

    fn start_purge_worker(&'static self) {
        let handle = spawn_named("opal-eviction-purge", move || self.purge_loop());
        *self.purge_thread.lock() = Some(handle);
    }

    fn purge_loop(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            listener!(self.purge_ev => l);
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            l.wait_timeout(IDLE_EVICTION_QUEUE_PURGE);
            self.purge_eviction_queue(PoolTier::Dram);
            if self.numa_pool.is_some() {
                self.purge_eviction_queue(PoolTier::Numa);
            }
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.purge_ev.notify(usize::MAX);
        if let Some(handle) = self.purge_thread.lock().take() {
            handle.join().unwrap();
        }
        unsafe {
            mmap_release(self.mapped_raw, self.mapped_bytes);
        }
    }
}

/// Scoped pin: releases the pin (with the recorded dirty flag) when
/// dropped.
pub struct PageGuard<'a> {
    manager: &'a BufferManager,
    page_id: PageID,
    data: *mut u8,
    dirty: bool,
}

impl PageGuard<'_> {
    #[inline]
    pub fn page_id(&self) -> PageID {
        self.page_id
    }

    #[inline]
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the pin keeps the page resident; the slot spans a
        // full page.
        unsafe { std::slice::from_raw_parts(self.data, self.page_id.num_bytes()) }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        // SAFETY: as above, and the guard is unique for writes at this
        // layer; byte-range ownership is the storage layer's contract.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.page_id.num_bytes()) }
    }

    #[inline]
    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.manager.unpin(self.page_id, self.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easy_parallel::Parallel;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Zipf};
    use tempfile::TempDir;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    fn small_config(dir: &TempDir) -> BufferManagerConfig {
        BufferManagerConfig::default()
            .with_main_dir(dir.path())
            .reserved_virtual_memory(Byte::from_u64(256 * MIB))
            .enable_eviction_purge_worker(false)
    }

    #[test]
    fn test_new_page_is_resident_and_dirty() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(MIB))
            .build()
            .unwrap();
        let page_id = manager.new_page(PageSizeClass::KiB4).unwrap();
        let frame = manager.frame(page_id);
        // Fresh pages are candidates right away, hence marked.
        assert_eq!(frame.state(), FrameState::MarkedForEviction);
        assert!(frame.is_dirty());
        assert!(manager.resident_page_count() == 1);
        assert_eq!(manager.pool_used_bytes(PoolTier::Dram), 4096);

        // The slot starts zero-filled.
        let guard = manager.pin_scoped(page_id).unwrap();
        assert!(guard.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_release_page_reuses_page_id() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(MIB))
            .build()
            .unwrap();
        let a = manager.new_page(PageSizeClass::KiB4).unwrap();
        manager.release_page(a);
        assert_eq!(manager.resident_page_count(), 0);
        assert_eq!(manager.pool_used_bytes(PoolTier::Dram), 0);
        let b = manager.new_page(PageSizeClass::KiB4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_page_roundtrip_across_eviction() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(2 * MIB))
            .build()
            .unwrap();

        // One dedicated 1 MiB page.
        let ptr = manager.allocate(1024 * 1024, 8).unwrap();
        let addr_before = ptr.resolve(&manager).unwrap();
        {
            let mut guard = manager.pin_scoped(ptr.page_id()).unwrap();
            for (i, b) in guard.bytes_mut().iter_mut().enumerate() {
                *b = (i % 256) as u8;
            }
        }

        // Fill the pool so the first page must be written out.
        let _b = manager.allocate(1024 * 1024, 8).unwrap();
        let _c = manager.allocate(1024 * 1024, 8).unwrap();
        assert_eq!(manager.frame(ptr.page_id()).state(), FrameState::Evicted);
        assert!(manager.ssd_write_count() >= 1);

        // Reload through the same pointer value.
        let addr_after = ptr.resolve(&manager).unwrap();
        assert_eq!(addr_before, addr_after);
        let guard = manager.pin_scoped(ptr.page_id()).unwrap();
        for (i, b) in guard.bytes().iter().enumerate() {
            assert_eq!(*b, (i % 256) as u8, "byte {} corrupted", i);
        }
    }

    #[test]
    fn test_hot_cold_eviction_bounded_residency() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            // Room for exactly 4 pages of the smallest class.
            .dram_buffer_pool_size(Byte::from_u64(16 * KIB))
            .build()
            .unwrap();

        let pages: Vec<PageID> = (0..64)
            .map(|_| manager.new_page(PageSizeClass::KiB4).unwrap())
            .collect();
        // Warm-up: cycle every freshly-allocated (hence dirty) page
        // through its first eviction so the measured phase starts from
        // clean on-disk copies.
        for _ in 0..2 {
            for &page_id in &pages {
                drop(manager.pin_scoped(page_id).unwrap());
            }
        }
        let base_reads = manager.ssd_read_count();
        let base_writes = manager.ssd_write_count();

        for _ in 0..2 {
            for &page_id in &pages {
                let guard = manager.pin_scoped(page_id).unwrap();
                assert!(guard.bytes().iter().all(|&b| b == 0));
                drop(guard);
                assert!(
                    manager.resident_page_count() <= 4,
                    "resident set exceeded the pool budget"
                );
            }
        }
        // Clean pages never go back to disk.
        assert_eq!(manager.ssd_write_count(), base_writes);
        // Every page came from SSD at least once.
        assert!(manager.ssd_read_count() - base_reads >= 64);
    }

    #[test]
    fn test_pinned_pages_are_never_evicted() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(16 * KIB))
            .build()
            .unwrap();
        let pages: Vec<PageID> = (0..4)
            .map(|_| manager.new_page(PageSizeClass::KiB4).unwrap())
            .collect();
        let guards: Vec<PageGuard<'_>> = pages
            .iter()
            .map(|&p| manager.pin_scoped(p).unwrap())
            .collect();

        // All budget pinned: allocation must fail, not evict.
        assert!(matches!(
            manager.new_page(PageSizeClass::KiB4),
            Err(Error::OutOfMemory)
        ));
        for &page_id in &pages {
            assert_ne!(manager.frame(page_id).state(), FrameState::Evicted);
        }

        drop(guards);
        manager.new_page(PageSizeClass::KiB4).unwrap();
    }

    #[test]
    fn test_dirty_page_is_written_back_before_eviction() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(16 * KIB))
            .build()
            .unwrap();
        let page_id = manager.new_page(PageSizeClass::KiB4).unwrap();
        {
            let mut guard = manager.pin_scoped(page_id).unwrap();
            guard.bytes_mut().fill(0x5A);
        }
        let writes_before = manager.ssd_write_count();
        for _ in 0..4 {
            manager.new_page(PageSizeClass::KiB4).unwrap();
        }
        assert_eq!(manager.frame(page_id).state(), FrameState::Evicted);
        assert!(manager.ssd_write_count() > writes_before);

        let guard = manager.pin_scoped(page_id).unwrap();
        assert!(guard.bytes().iter().all(|&b| b == 0x5A));
        // Reloaded copy is clean until somebody writes again.
        assert!(!manager.frame(page_id).is_dirty());
    }

    #[test]
    fn test_unswizzle_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(MIB))
            .build()
            .unwrap();
        let ptr = manager.allocate(64, 8).unwrap();
        let raw = ptr.resolve(&manager).unwrap();
        assert_eq!(
            manager.unswizzle(raw),
            Some((ptr.page_id(), ptr.byte_offset()))
        );
        let inner = unsafe { raw.add(10) };
        assert_eq!(manager.unswizzle(inner), Some((ptr.page_id(), 10)));

        let on_stack = 0u64;
        assert_eq!(manager.unswizzle(&on_stack as *const u64 as *const u8), None);
    }

    #[test]
    fn test_eviction_queue_purge_drops_stale_items() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(MIB))
            .build()
            .unwrap();
        let page_id = manager.new_page(PageSizeClass::KiB4).unwrap();
        // Each pin/unpin cycle leaves one more dead item behind.
        for _ in 0..10 {
            let guard = manager.pin_scoped(page_id).unwrap();
            drop(guard);
        }
        let before = manager.dram_pool.eviction_queue.len();
        assert!(before > 1);
        manager.purge_eviction_queue(PoolTier::Dram);
        assert_eq!(manager.dram_pool.eviction_queue.len(), 1);
        assert!(manager.stats().purged_items() > 0);
    }

    #[test]
    fn test_numa_tier_demotion_and_lazy_promotion() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(16 * KIB))
            .numa_buffer_pool_size(Byte::from_u64(64 * KIB))
            .enable_numa(true)
            .migration_policy(MigrationPolicy::Lazy)
            .build()
            .unwrap();

        // Overflowing DRAM demotes instead of writing to SSD.
        let pages: Vec<PageID> = (0..8)
            .map(|_| manager.new_page(PageSizeClass::KiB4).unwrap())
            .collect();
        assert!(manager.stats().demotions() >= 4);
        assert_eq!(manager.ssd_write_count(), 0);
        assert!(manager.pool_used_bytes(PoolTier::Numa) >= 4 * 4096);

        // Find a page on the second tier and make room in DRAM.
        let numa_page = pages
            .iter()
            .copied()
            .find(|&p| manager.frame(p).memory_node() == PoolTier::Numa as u8)
            .expect("no page was demoted");
        let dram_page = pages
            .iter()
            .copied()
            .find(|&p| manager.frame(p).memory_node() == PoolTier::Dram as u8)
            .expect("no page stayed in DRAM");
        manager.release_page(dram_page);

        // The second pin crosses the Lazy threshold.
        drop(manager.pin_scoped(numa_page).unwrap());
        drop(manager.pin_scoped(numa_page).unwrap());
        assert!(manager.stats().promotions() >= 1);
        assert_eq!(
            manager.frame(numa_page).memory_node(),
            PoolTier::Dram as u8
        );
    }

    #[test]
    fn test_skewed_reads_favor_the_cache() {
        let hit_rate_for_skew = |skew: f64| -> f64 {
            let dir = TempDir::new().unwrap();
            let manager = small_config(&dir)
                .dram_buffer_pool_size(Byte::from_u64(64 * KIB))
                .build()
                .unwrap();
            let pages: Vec<PageID> = (0..256)
                .map(|_| manager.new_page(PageSizeClass::KiB4).unwrap())
                .collect();

            Parallel::new()
                .each(0..4, |thread_id| {
                    let mut rng = StdRng::seed_from_u64(42 + thread_id as u64);
                    let dist = Zipf::new(pages.len() as f64, skew).unwrap();
                    for _ in 0..2000 {
                        let idx = dist.sample(&mut rng) as usize - 1;
                        let guard = manager.pin_scoped(pages[idx]).unwrap();
                        assert!(guard.bytes()[0] == 0);
                    }
                })
                .run();
            manager.stats().hit_rate()
        };

        let mut previous = 0.0f64;
        for skew in [0.001, 0.5, 0.999] {
            let rate = hit_rate_for_skew(skew);
            assert!(
                rate >= previous - 0.05,
                "hit rate dropped from {} to {} at skew {}",
                previous,
                rate,
                skew
            );
            previous = rate;
        }
    }

    #[test]
    fn test_config_env_and_serde() {
        let config = BufferManagerConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: BufferManagerConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.dram_buffer_pool_size.as_u64(),
            config.dram_buffer_pool_size.as_u64()
        );
        assert_eq!(parsed.migration_policy, config.migration_policy);

        assert_eq!(
            "lazy".parse::<MigrationPolicy>().unwrap(),
            MigrationPolicy::Lazy
        );
        assert!("bogus".parse::<MigrationPolicy>().is_err());
    }

    #[test]
    fn test_build_static_runs_purge_worker() {
        let dir = TempDir::new().unwrap();
        let manager = small_config(&dir)
            .dram_buffer_pool_size(Byte::from_u64(MIB))
            .enable_eviction_purge_worker(true)
            .build_static()
            .unwrap();
        let page_id = manager.new_page(PageSizeClass::KiB4).unwrap();
        drop(manager.pin_scoped(page_id).unwrap());
        unsafe {
            StaticLifetime::drop_static(manager);
        }
    }
}
