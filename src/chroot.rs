//! Chroot environments and the concurrency governor that caps how many are
//! constructed in parallel.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A reusable isolated build environment, keyed by (distribution,
/// architecture, components). Rebuilding a `chroot`-type Build reconstructs
/// one from this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chroot {
    pub id: i64,
    pub build_id: i64,
    pub architecture: String,
    pub basemirror: BaseMirror,
}

/// The distribution snapshot a build environment is constructed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseMirror {
    pub project: String,
    pub name: String,
    pub distribution: String,
    pub components: Vec<String>,
    pub url: String,
    pub keys: Vec<String>,
}

/// Process-wide counter gating parallel `buildenv` construction. Not
/// persisted: a restart resets it to zero, which is safe because no
/// `CreateBuildEnv` job survives a restart either.
pub struct ChrootGovernor {
    count: AtomicI64,
    max_parallel: i64,
    /// Mirrors `count` into the metrics gauge on every change.
    on_change: Option<Box<dyn Fn(i64) + Send + Sync>>,
    throttled_total: AtomicU64,
}

impl ChrootGovernor {
    /// `max_parallel <= 0` disables the cap, matching the upstream
    /// "absent/zero/non-int disables" config semantics.
    pub fn new(max_parallel: i64) -> Self {
        Self {
            count: AtomicI64::new(0),
            max_parallel,
            on_change: None,
            throttled_total: AtomicU64::new(0),
        }
    }

    pub fn with_on_change(mut self, f: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Box::new(f));
        self
    }

    fn report(&self, value: i64) {
        if let Some(cb) = &self.on_change {
            cb(value);
        }
    }

    /// Returns `true` and increments the counter if a slot was available;
    /// otherwise returns `false` (the caller must requeue and yield) and
    /// records a throttle event.
    pub fn try_acquire(&self) -> bool {
        if self.max_parallel > 0 && self.count.load(Ordering::SeqCst) >= self.max_parallel {
            self.throttled_total.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_chroot_throttled();
            return false;
        }
        let new_value = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.report(new_value);
        true
    }

    /// Called when a `CreateBuildEnv` job completes, success or failure.
    pub fn release(&self) {
        let new_value = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.report(new_value);
    }

    pub fn current(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn throttled_total(&self) -> u64 {
        self.throttled_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_cap_never_throttles() {
        let governor = ChrootGovernor::new(0);
        for _ in 0..50 {
            assert!(governor.try_acquire());
        }
    }

    #[test]
    fn cap_blocks_once_reached_and_frees_on_release() {
        let governor = ChrootGovernor::new(2);
        assert!(governor.try_acquire());
        assert!(governor.try_acquire());
        assert!(!governor.try_acquire());
        assert_eq!(governor.throttled_total(), 1);

        governor.release();
        assert!(governor.try_acquire());
    }

    #[test]
    fn current_tracks_outstanding_acquisitions() {
        let governor = ChrootGovernor::new(4);
        governor.try_acquire();
        governor.try_acquire();
        assert_eq!(governor.current(), 2);
        governor.release();
        assert_eq!(governor.current(), 1);
    }
}
