use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the buffer manager. All counters are
/// monotonically increasing and relaxed; they exist for observability
/// and tests, not for control flow.
#[derive(Default)]
pub struct BufferManagerStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    demotions: AtomicU64,
    promotions: AtomicU64,
    purged_items: AtomicU64,
}

macro_rules! counter {
    ($field:ident, $bump:ident) => {
        #[inline]
        pub fn $field(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }

        #[inline]
        pub(super) fn $bump(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl BufferManagerStats {
    counter!(hits, bump_hits);
    counter!(misses, bump_misses);
    counter!(evictions, bump_evictions);
    counter!(demotions, bump_demotions);
    counter!(promotions, bump_promotions);
    counter!(purged_items, bump_purged_items);

    /// Hit rate over all resolved pins so far.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let misses = self.misses() as f64;
        if hits + misses == 0.0 {
            return 0.0;
        }
        hits / (hits + misses)
    }
}
