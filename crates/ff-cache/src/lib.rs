#![forbid(unsafe_code)]

//! Memo tables for interpretation results and content-addressed cache keys.
//!
//! A [`MemoCache`] maps a [`CacheKey`] to the term an interpretation produced
//! for a construction request. Keys combine the interpretation name with the
//! request digest, so one cache can serve several interpretations without
//! mixing their answers. Digests hash dense payloads by buffer identity, so
//! keying never walks array contents. The cache is a cheap shared handle:
//! clones see the same table, which lets a caller hand one cache to several
//! memoized scopes and inspect it afterwards.

use ff_core::{Term, TermKind};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

/// Key for the result of constructing `kind` under `interpretation`.
#[must_use]
pub fn build_cache_key(interpretation: &str, kind: &TermKind) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update((interpretation.len() as u64).to_le_bytes());
    hasher.update(interpretation.as_bytes());
    hasher.update(kind.digest());
    CacheKey {
        namespace: "ffx",
        digest_hex: bytes_to_hex(&hasher.finalize()),
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Default)]
struct MemoTable {
    entries: FxHashMap<CacheKey, Term>,
    hits: u64,
    misses: u64,
}

/// Shared memo table from cache key to result.
#[derive(Clone, Default)]
pub struct MemoCache {
    table: Rc<RefCell<MemoTable>>,
}

impl MemoCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `key`, counting the hit or miss.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<Term> {
        let mut table = self.table.borrow_mut();
        let found = table.entries.get(key).cloned();
        if found.is_some() {
            table.hits += 1;
        } else {
            table.misses += 1;
        }
        found
    }

    pub fn insert(&self, key: CacheKey, value: Term) {
        self.table.borrow_mut().entries.insert(key, value);
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.table.borrow().entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.borrow().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let table = self.table.borrow();
        CacheStats {
            hits: table.hits,
            misses: table.misses,
            entries: table.entries.len(),
        }
    }

    pub fn clear(&self) {
        let mut table = self.table.borrow_mut();
        tracing::debug!(entries = table.entries.len(), "clearing memo cache");
        table.entries.clear();
        table.hits = 0;
        table.misses = 0;
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.table, &other.table)
    }
}

impl std::fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoCache")
            .field("entries", &stats.entries)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoCache, build_cache_key};
    use ff_core::{Domain, Dtype, Term, TermKind};

    fn number_kind(value: f64) -> TermKind {
        TermKind::Number {
            value,
            dtype: Dtype::Real,
        }
    }

    #[test]
    fn cache_key_depends_on_interpretation_and_term() {
        let a = build_cache_key("eager", &number_kind(1.0));
        let b = build_cache_key("eager", &number_kind(1.0));
        let c = build_cache_key("lazy", &number_kind(1.0));
        let d = build_cache_key("eager", &number_kind(2.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.as_string().starts_with("ffx-"));
        assert_eq!(a.digest_hex.len(), 64);
    }

    #[test]
    fn memo_cache_counts_hits_and_shares_state_across_clones() {
        let cache = MemoCache::new();
        let handle = cache.clone();
        let x = Term::variable("x", Domain::real()).expect("variable should build");
        let key = build_cache_key("reflect", x.kind());

        assert!(cache.lookup(&key).is_none());
        handle.insert(key.clone(), x.clone());
        let found = cache.lookup(&key).expect("entry should be visible through clone");
        assert!(found.ptr_eq(&x));
        assert!(cache.ptr_eq(&handle));

        let stats = handle.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));

        cache.clear();
        assert!(handle.is_empty());
        assert!(!handle.contains(&key));
    }
}
