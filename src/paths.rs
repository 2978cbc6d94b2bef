//! Path registry: longest-prefix capability matching.
//!
//! Patterns map a path prefix to the set of servers that can read, write,
//! or stage files under it. Lookup walks patterns longest-prefix-first; a
//! bare `/` pattern is the default. A trailing `*` on an inserted prefix
//! matches as a wildcard segment (raw prefix match); without it a pattern
//! matches only whole path segments.

use std::fmt;

use log::debug;
use parking_lot::RwLock;

use crate::types::SMask;

/// Capability sets for one prefix: readable, writable, stageable servers.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PathInfo {
    /// Servers that can serve the path read-only.
    pub rovec: SMask,
    /// Servers that can serve the path read-write.
    pub rwvec: SMask,
    /// Servers that can stage files in under the path.
    pub ssvec: SMask,
}

impl PathInfo {
    /// Build the info a single server advertises with `addpath <perms>`.
    /// Permission letters are `r`, `w`, `s`; unknown letters are rejected.
    pub fn from_perms(perms: &str, mask: SMask) -> Option<PathInfo> {
        let mut info = PathInfo::default();
        if perms.is_empty() {
            return None;
        }
        for c in perms.chars() {
            match c {
                'r' => info.rovec |= mask,
                'w' => {
                    info.rovec |= mask;
                    info.rwvec |= mask;
                }
                's' => {
                    info.rovec |= mask;
                    info.ssvec |= mask;
                }
                _ => return None,
            }
        }
        Some(info)
    }

    /// Permission letters for a `have` response (`r`, `w`, `s` in order).
    pub fn perm_letters(&self, mask: SMask) -> &'static str {
        let w = self.rwvec.overlaps(mask);
        let s = self.ssvec.overlaps(mask);
        match (w, s) {
            (true, true) => "ws",
            (true, false) => "w",
            (false, true) => "rs",
            (false, false) => "r",
        }
    }
}

impl fmt::Debug for PathInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PathInfo(ro={} rw={} ss={})",
            self.rovec.count(),
            self.rwvec.count(),
            self.ssvec.count()
        )
    }
}

struct Pattern {
    prefix: String,
    wildcard: bool,
    info: PathInfo,
}

impl Pattern {
    fn matches(&self, path: &str) -> bool {
        if !path.starts_with(&self.prefix) {
            return false;
        }
        if self.wildcard || self.prefix == "/" || path.len() == self.prefix.len() {
            return true;
        }
        // Whole-segment match: the prefix must end at a separator.
        self.prefix.ends_with('/') || path.as_bytes()[self.prefix.len()] == b'/'
    }
}

/// The set of known path patterns, ordered longest-prefix-first.
pub struct PathList {
    patterns: RwLock<Vec<Pattern>>,
}

impl Default for PathList {
    fn default() -> Self {
        PathList::new()
    }
}

impl PathList {
    /// An empty registry.
    pub fn new() -> PathList {
        PathList {
            patterns: RwLock::new(Vec::new()),
        }
    }

    /// Record a server's claim on `prefix`, merging with an existing
    /// pattern for the same prefix. Returns the pattern's cumulative
    /// read set after the merge (the servers sharing this prefix), which
    /// the manager uses to equalize reference counters. Inserting the
    /// same claim twice is a no-op with the same return value.
    pub fn insert(&self, prefix: &str, info: &PathInfo) -> SMask {
        let (prefix, wildcard) = match prefix.strip_suffix('*') {
            Some(p) => (p, true),
            None => (prefix, false),
        };
        let mut patterns = self.patterns.write();
        if let Some(p) = patterns
            .iter_mut()
            .find(|p| p.prefix == prefix && p.wildcard == wildcard)
        {
            p.info.rovec |= info.rovec;
            p.info.rwvec |= info.rwvec;
            p.info.ssvec |= info.ssvec;
            return p.info.rovec;
        }
        debug!("path registry: new pattern {prefix}{}", if wildcard { "*" } else { "" });
        let pos = patterns.partition_point(|p| p.prefix.len() >= prefix.len());
        patterns.insert(
            pos,
            Pattern {
                prefix: prefix.to_owned(),
                wildcard,
                info: *info,
            },
        );
        info.rovec
    }

    /// Clear the given servers from every pattern; patterns left with no
    /// servers are dropped.
    pub fn remove(&self, mask: SMask) {
        let keep = !mask;
        let mut patterns = self.patterns.write();
        for p in patterns.iter_mut() {
            p.info.rovec &= keep;
            p.info.rwvec &= keep;
            p.info.ssvec &= keep;
        }
        patterns.retain(|p| !p.info.rovec.is_empty());
    }

    /// Longest-prefix lookup.
    pub fn find(&self, path: &str) -> Option<PathInfo> {
        let patterns = self.patterns.read();
        patterns.iter().find(|p| p.matches(path)).map(|p| p.info)
    }

    /// Union of every pattern's read set; used to cross-check the server
    /// table's bound bits.
    pub fn union(&self) -> SMask {
        let patterns = self.patterns.read();
        patterns
            .iter()
            .fold(SMask::EMPTY, |acc, p| acc | p.info.rovec)
    }

    /// Snapshot of all patterns for the login advertisement.
    pub fn entries(&self) -> Vec<(String, PathInfo)> {
        let patterns = self.patterns.read();
        patterns
            .iter()
            .map(|p| {
                let mut s = p.prefix.clone();
                if p.wildcard {
                    s.push('*');
                }
                (s, p.info)
            })
            .collect()
    }

    /// Capability letters a server would report for `path`.
    pub fn ptype(&self, path: &str, mask: SMask) -> &'static str {
        match self.find(path) {
            Some(info) => info.perm_letters(mask),
            None => "?",
        }
    }
}

impl fmt::Debug for PathList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathList({} patterns)", self.patterns.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let list = PathList::new();
        let a = SMask::bit(1);
        let b = SMask::bit(2);
        list.insert("/", &PathInfo::from_perms("r", a).unwrap());
        list.insert("/data/hot", &PathInfo::from_perms("w", b).unwrap());
        assert_eq!(list.find("/data/hot/f1").unwrap().rwvec, b);
        assert_eq!(list.find("/other").unwrap().rovec, a);
    }

    #[test]
    fn wildcard_suffix_matches_partial_segment() {
        let list = PathList::new();
        let m = SMask::bit(7);
        list.insert("/tmp/data*", &PathInfo::from_perms("r", m).unwrap());
        assert!(list.find("/tmp/database").is_some());
        assert!(list.find("/tmp/data/f").is_some());
        assert!(list.find("/tmp/dat").is_none());

        let strict = PathList::new();
        strict.insert("/tmp/data", &PathInfo::from_perms("r", m).unwrap());
        assert!(strict.find("/tmp/database").is_none());
        assert!(strict.find("/tmp/data/f").is_some());
        assert!(strict.find("/tmp/data").is_some());
    }

    #[test]
    fn insert_is_idempotent() {
        let list = PathList::new();
        let m = SMask::bit(3);
        let info = PathInfo::from_perms("rw", m).unwrap();
        let first = list.insert("/data", &info);
        let second = list.insert("/data", &info);
        assert_eq!(first, second);
        assert_eq!(list.entries().len(), 1);
    }

    #[test]
    fn remove_clears_and_drops() {
        let list = PathList::new();
        let a = SMask::bit(1);
        let b = SMask::bit(2);
        list.insert("/d", &PathInfo::from_perms("rw", a).unwrap());
        list.insert("/d", &PathInfo::from_perms("r", b).unwrap());
        list.remove(a);
        let info = list.find("/d/x").unwrap();
        assert_eq!(info.rovec, b);
        assert!(info.rwvec.is_empty());
        list.remove(b);
        assert!(list.find("/d/x").is_none());
    }
}
