//! Countdown fault injectors.

use std::sync::atomic::{AtomicUsize, Ordering};

use lode_core::{FaultInjector, FaultSite};

/// Lets the first `n` matching calls through, then fails every one after.
///
/// With `site` set to `None` every site counts.
#[derive(Debug)]
pub struct FailAfter {
    site: Option<FaultSite>,
    remaining: AtomicUsize,
}

impl FailAfter {
    pub fn new(site: Option<FaultSite>, n: usize) -> Self {
        Self {
            site,
            remaining: AtomicUsize::new(n),
        }
    }

    /// Fail every matching call, starting now.
    pub fn always(site: FaultSite) -> Self {
        Self::new(Some(site), 0)
    }
}

impl FaultInjector for FailAfter {
    fn should_fail(&self, site: FaultSite) -> bool {
        if self.site.is_some_and(|s| s != site) {
            return false;
        }
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
    }
}

/// Fails exactly the `n`th matching call (0-based) and nothing else.
#[derive(Debug)]
pub struct FailNth {
    site: Option<FaultSite>,
    n: usize,
    calls: AtomicUsize,
}

impl FailNth {
    pub fn new(site: Option<FaultSite>, n: usize) -> Self {
        Self {
            site,
            n,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of matching calls seen so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl FaultInjector for FailNth {
    fn should_fail(&self, site: FaultSite) -> bool {
        if self.site.is_some_and(|s| s != site) {
            return false;
        }
        self.calls.fetch_add(1, Ordering::Relaxed) == self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_after_counts_only_its_site() {
        let inj = FailAfter::new(Some(FaultSite::Commit), 2);
        assert!(!inj.should_fail(FaultSite::Allocate));
        assert!(!inj.should_fail(FaultSite::Commit));
        assert!(!inj.should_fail(FaultSite::Commit));
        assert!(inj.should_fail(FaultSite::Commit));
        assert!(inj.should_fail(FaultSite::Commit));
        assert!(!inj.should_fail(FaultSite::Reserve));
    }

    #[test]
    fn fail_nth_fails_once() {
        let inj = FailNth::new(None, 1);
        assert!(!inj.should_fail(FaultSite::Allocate));
        assert!(inj.should_fail(FaultSite::Reserve));
        assert!(!inj.should_fail(FaultSite::Allocate));
        assert_eq!(inj.calls(), 3);
    }
}
