//! Shared fixtures for unit tests.
//!
//! Every component is exercised against a `MemoryStore` whose expiries follow a
//! `ManualClock`, so time-dependent behavior (OTP throttling, rate windows) is
//! driven by hand.

use std::sync::Arc;

use crate::cache::Cache;
use crate::clock::ManualClock;
use crate::memory_store::MemoryStore;
use crate::CacheConfig;

/// Start of a 60-second-aligned window, so window arithmetic in tests is exact.
pub const START_SECS: i64 = 1_700_000_040;

pub struct Harness {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub cache: Cache,
}

pub fn harness() -> Harness {
    harness_with(CacheConfig::default())
}

pub fn harness_with(config: CacheConfig) -> Harness {
    let clock = ManualClock::new(START_SECS);
    let store = MemoryStore::with_clock(Arc::new(clock.clone()));
    let cache = Cache::new(Arc::new(store.clone()), &config);
    Harness {
        store,
        clock,
        cache,
    }
}

impl Harness {
    pub fn clock_handle(&self) -> Arc<ManualClock> {
        Arc::new(self.clock.clone())
    }
}
