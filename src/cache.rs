use crate::models::Link;
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Short code -> destination URL for links the redirect path may serve.
///
/// Only active links belong here. Two kinds of writers touch it:
///
/// * Management writes call [`remove`](Self::remove) or
///   [`refresh`](Self::refresh) *after* the store write commits. Both bump
///   the generation before changing the map.
/// * The redirect path fills misses from the store. It takes a
///   [`generation`](Self::generation) before reading and hands it to
///   [`fill`](Self::fill), which backs the entry out again if a management
///   write landed in between, so a stale read cannot outlive an eviction.
#[derive(Clone, Debug, Default)]
pub struct LinkCache {
    inner: Arc<DashMap<String, String>>,
    generation: Arc<AtomicU64>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional insert, for links just created or loaded at startup.
    pub fn set(&self, short_code: impl Into<String>, destination_url: impl Into<String>) {
        self.inner.insert(short_code.into(), destination_url.into());
    }

    pub fn get(&self, short_code: &str) -> Option<String> {
        self.inner.get(short_code).map(|v| v.clone())
    }

    /// Current management-write generation; take it before a store read.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Insert a value read from the store while `seen` was current. Returns
    /// `false` (and leaves the code uncached) if a management write happened
    /// since.
    pub fn fill(&self, seen: u64, short_code: &str, destination_url: &str) -> bool {
        self.inner
            .insert(short_code.to_owned(), destination_url.to_owned());
        if self.generation() == seen {
            return true;
        }
        self.inner.remove(short_code);
        false
    }

    pub fn remove(&self, short_code: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(short_code);
    }

    /// Make the cache match `link` after it was written to the store: the
    /// entry under `old_code` is dropped, and the link is cached under its
    /// current code only while active.
    pub fn refresh(&self, old_code: &str, link: &Link) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(old_code);
        if link.is_active {
            self.set(&link.short_code, &link.destination_url);
        } else {
            self.inner.remove(&link.short_code);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
