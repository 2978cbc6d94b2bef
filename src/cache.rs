//! Location cache: which servers hold which paths.
//!
//! Each entry tracks the servers known to hold a path read-only and
//! read-write, the servers bouncing (recently reported but transitioning),
//! and an optional deadline. A live deadline marks the answer provisional:
//! a lookup broadcast is in flight and the selector must tell the client to
//! wait rather than answer from the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::sched::{Job, Scheduler};
use crate::types::SMask;

/// Snapshot of one cache entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheInfo {
    /// Servers holding the path (read access).
    pub rovec: SMask,
    /// Servers holding the path writable. Always a subset of `rovec`.
    pub rwvec: SMask,
    /// Servers that reported the path but are transitioning.
    pub sbvec: SMask,
    /// Set while a lookup broadcast is outstanding.
    pub deadline: Option<Instant>,
}

struct Entry {
    rovec: SMask,
    rwvec: SMask,
    sbvec: SMask,
    deadline: Option<Instant>,
    last_access: Instant,
}

/// The path-to-servers table.
pub struct LocationCache {
    table: Mutex<HashMap<String, Entry>>,
    lifetime: Duration,
}

impl LocationCache {
    /// Create a cache whose entries expire after `lifetime` without access.
    pub fn new(lifetime: Duration) -> Arc<LocationCache> {
        Arc::new(LocationCache {
            table: Mutex::new(HashMap::new()),
            lifetime,
        })
    }

    /// Entry lifetime, also the scrub cadence.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Record that the servers in `mask` hold `path`; `rw` says whether
    /// they hold it writable. A positive `delay` instead marks the entry
    /// provisional: the vectors are cleared and the deadline set, meaning
    /// a lookup is under way. A fresh report clears the reporting servers'
    /// bounce bits.
    pub fn add_file(&self, path: &str, mask: SMask, rw: bool, delay: Option<Duration>) {
        let now = Instant::now();
        let mut table = self.table.lock();
        match table.get_mut(path) {
            Some(entry) => {
                entry.last_access = now;
                match delay {
                    Some(d) if d > Duration::ZERO => {
                        entry.deadline = Some(now + d);
                        entry.rovec = SMask::EMPTY;
                        entry.rwvec = SMask::EMPTY;
                    }
                    _ => {
                        entry.rovec |= mask;
                        if rw {
                            entry.rwvec |= mask;
                        } else {
                            entry.rwvec &= !mask;
                        }
                        entry.sbvec &= !mask;
                    }
                }
            }
            None => {
                let deadline = match delay {
                    Some(d) if d > Duration::ZERO => Some(now + d),
                    _ => None,
                };
                table.insert(
                    path.to_owned(),
                    Entry {
                        rovec: mask,
                        rwvec: if rw { mask } else { SMask::EMPTY },
                        sbvec: SMask::EMPTY,
                        deadline,
                        last_access: now,
                    },
                );
            }
        }
    }

    /// Clear the servers in `mask` from `path`. With no `delay`, an entry
    /// left with no servers is removed; a positive `delay` keeps it so a
    /// lookup already under way can repopulate it.
    pub fn del_file(&self, path: &str, mask: SMask, delay: Option<Duration>) {
        let keep = delay.is_some_and(|d| d > Duration::ZERO);
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(path) {
            entry.rovec &= !mask;
            entry.rwvec &= !mask;
            entry.sbvec &= !mask;
            if !keep
                && entry.rovec.is_empty()
                && entry.rwvec.is_empty()
                && entry.sbvec.is_empty()
            {
                table.remove(path);
            }
        }
    }

    /// Look up `path`, clearing an expired deadline on the way out.
    pub fn get_file(&self, path: &str) -> Option<CacheInfo> {
        let now = Instant::now();
        let mut table = self.table.lock();
        let entry = table.get_mut(path)?;
        entry.last_access = now;
        if entry.deadline.is_some_and(|d| d <= now) {
            entry.deadline = None;
        }
        Some(CacheInfo {
            rovec: entry.rovec,
            rwvec: entry.rwvec,
            sbvec: entry.sbvec,
            deadline: entry.deadline,
        })
    }

    /// All cached keys under `prefix`, for a state-refresh broadcast to a
    /// newly bound server.
    pub fn extract(&self, prefix: &str) -> Vec<String> {
        let table = self.table.lock();
        table
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Move the given servers' claims on `path` (or on every entry when
    /// `path` is `None`) into the bounce set.
    pub fn bounce(&self, mask: SMask, path: Option<&str>) {
        let mut table = self.table.lock();
        let mut apply = |entry: &mut Entry| {
            entry.sbvec |= (entry.rovec | entry.rwvec) & mask;
            entry.rovec &= !mask;
            entry.rwvec &= !mask;
        };
        match path {
            Some(p) => {
                if let Some(entry) = table.get_mut(p) {
                    apply(entry);
                }
            }
            None => table.values_mut().for_each(apply),
        }
    }

    /// Drop a server from every entry; entries left empty are removed.
    /// Used when a slot is released.
    pub fn reset(&self, slot: usize) {
        let keep = !SMask::bit(slot);
        let mut table = self.table.lock();
        table.retain(|_, entry| {
            entry.rovec &= keep;
            entry.rwvec &= keep;
            entry.sbvec &= keep;
            !entry.rovec.is_empty() || !entry.rwvec.is_empty() || !entry.sbvec.is_empty()
        });
    }

    /// Remove entries unaccessed past the lifetime.
    pub fn scrub(&self) {
        let now = Instant::now();
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, entry| now.duration_since(entry.last_access) <= self.lifetime);
        let dropped = before - table.len();
        if dropped > 0 {
            debug!("cache scrub: dropped {dropped} stale entries");
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl std::fmt::Debug for LocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocationCache({} entries)", self.len())
    }
}

/// Periodic job that scrubs the cache and reschedules itself.
#[derive(Debug)]
pub struct CacheScrubber {
    cache: Arc<LocationCache>,
}

impl CacheScrubber {
    /// Build a scrubber over `cache`; schedule it once to start the cycle.
    pub fn new(cache: Arc<LocationCache>) -> Arc<CacheScrubber> {
        Arc::new(CacheScrubber { cache })
    }
}

impl Job for CacheScrubber {
    fn comment(&self) -> &'static str {
        "file cache scrubber"
    }

    fn run(self: Arc<Self>, sched: &Arc<Scheduler>) {
        self.cache.scrub();
        let again = self.cache.lifetime();
        sched.schedule_in(self, again);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<LocationCache> {
        LocationCache::new(Duration::from_secs(3600))
    }

    #[test]
    fn add_then_get_round_trip() {
        let c = cache();
        let m = SMask::bit(4);
        c.add_file("/d/f1", m, true, None);
        let info = c.get_file("/d/f1").unwrap();
        assert!(info.rovec.has(4));
        assert!(info.rwvec.has(4));
        assert!(info.deadline.is_none());
    }

    #[test]
    fn rw_downgrade_keeps_ro() {
        let c = cache();
        let m = SMask::bit(9);
        c.add_file("/d/f", m, true, None);
        c.add_file("/d/f", m, false, None);
        let info = c.get_file("/d/f").unwrap();
        assert!(info.rovec.has(9));
        assert!(!info.rwvec.has(9));
    }

    #[test]
    fn rwvec_subset_of_rovec() {
        let c = cache();
        for (slot, rw) in [(1usize, true), (2, false), (3, true)] {
            c.add_file("/p", SMask::bit(slot), rw, None);
        }
        let info = c.get_file("/p").unwrap();
        assert_eq!(info.rwvec & info.rovec, info.rwvec);
    }

    #[test]
    fn delete_removes_empty_entry() {
        let c = cache();
        let m = SMask::bit(2);
        c.add_file("/d/f", m, false, None);
        c.del_file("/d/f", m, None);
        assert!(c.get_file("/d/f").is_none());
    }

    #[test]
    fn pending_lookup_sets_deadline_and_clears_vectors() {
        let c = cache();
        c.add_file("/d/f", SMask::bit(5), false, None);
        c.add_file("/d/f", SMask::EMPTY, false, Some(Duration::from_secs(5)));
        let info = c.get_file("/d/f").unwrap();
        assert!(info.rovec.is_empty());
        assert!(info.deadline.is_some());
    }

    #[test]
    fn expired_deadline_cleared_on_read() {
        let c = cache();
        c.add_file("/d/f", SMask::EMPTY, false, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        let info = c.get_file("/d/f").unwrap();
        assert!(info.deadline.is_none());
    }

    #[test]
    fn fresh_have_clears_bounce_bit() {
        let c = cache();
        let m = SMask::bit(6);
        c.add_file("/d/f", m, false, None);
        c.bounce(m, Some("/d/f"));
        assert!(c.get_file("/d/f").unwrap().sbvec.has(6));
        c.add_file("/d/f", m, false, None);
        let info = c.get_file("/d/f").unwrap();
        assert!(!info.sbvec.has(6));
        assert!(info.rovec.has(6));
    }

    #[test]
    fn extract_matches_prefix() {
        let c = cache();
        c.add_file("/a/one", SMask::bit(1), false, None);
        c.add_file("/a/two", SMask::bit(1), false, None);
        c.add_file("/b/one", SMask::bit(1), false, None);
        let mut keys = c.extract("/a/");
        keys.sort();
        assert_eq!(keys, vec!["/a/one", "/a/two"]);
    }

    #[test]
    fn reset_drops_servers_entries() {
        let c = cache();
        c.add_file("/x", SMask::bit(1), false, None);
        c.add_file("/y", SMask::bit(1) | SMask::bit(2), false, None);
        c.reset(1);
        assert!(c.get_file("/x").is_none());
        assert!(c.get_file("/y").unwrap().rovec.has(2));
    }
}
