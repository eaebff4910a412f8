//! # Ownership Registry (refcount.rs)
//!
//! Values handed across threads as request `data` live in this registry until
//! the last request using them finishes, at which point their cleanup runs.
//! A claimed value survives its last visit until it is unclaimed.
//!
//! ```text
//!     add(data) ─► visits: 1 ─► begin ─► visits: 2 ─► finish ─► visits: 1
//!                                                                   │
//!                                      last decr ─► claims > 0 ? refuse : cleanup(data)
//! ```
//!
//! Entries are keyed by the address of the shared allocation, so clones of the
//! same `Arc` refer to the same entry.

use crate::rest::error::{RestError, Result};
use crate::rest::request::UserData;
use ahash::RandomState;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

pub(crate) type Cleanup = Box<dyn FnOnce(UserData) + Send + Sync>;

struct Entry {
    data: UserData,
    visits: usize,
    claims: usize,
    cleanup: Option<Cleanup>,
}

fn key_of(data: &UserData) -> usize {
    Arc::as_ptr(data) as *const () as usize
}

/// Registry of shared values and their visit/claim counts.
pub(crate) struct Refcounter {
    entries: DashMap<usize, Entry, RandomState>,
}

impl fmt::Debug for Refcounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refcounter")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Refcounter {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }

    fn insert(&self, data: &UserData, cleanup: Option<Cleanup>) {
        self.entries.insert(
            key_of(data),
            Entry {
                data: Arc::clone(data),
                visits: 1,
                claims: 0,
                cleanup,
            },
        );
    }

    /// Registers `data` with a single visit, replacing any previous entry.
    pub(crate) fn add(&self, data: &UserData, cleanup: Option<Cleanup>) {
        self.insert(data, cleanup);
        debug!("[refcount] Adding resource {:#x}", key_of(data));
    }

    /// Adds a visit, registering `data` without cleanup when unknown.
    pub(crate) fn visit(&self, data: &UserData) {
        self.entries
            .entry(key_of(data))
            .and_modify(|entry| entry.visits += 1)
            .or_insert_with(|| Entry {
                data: Arc::clone(data),
                visits: 1,
                claims: 0,
                cleanup: None,
            });
    }

    /// Adds a visit to a registered value.
    pub(crate) fn incr(&self, data: &UserData) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(&key_of(data))
            .ok_or(RestError::ResourceUnavailable)?;
        entry.visits += 1;
        trace!("[refcount] Increment {:#x} ({} visits)", key_of(data), entry.visits);
        Ok(())
    }

    /// Removes a visit; the last one runs the cleanup.
    ///
    /// A claimed value refuses its last decrement with `ResourceOwnership`.
    pub(crate) fn decr(&self, data: &UserData) -> Result<()> {
        self.release_visit(key_of(data), false)
    }

    /// Keeps `data` alive past its last request until [`unclaim`](Self::unclaim).
    pub(crate) fn claim(&self, data: &UserData) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(&key_of(data))
            .ok_or(RestError::ResourceUnavailable)?;
        entry.claims += 1;
        entry.visits += 1;
        trace!("[refcount] Claiming {:#x} (claims: {})", key_of(data), entry.claims);
        Ok(())
    }

    /// Drops a claim and the visit it held.
    pub(crate) fn unclaim(&self, data: &UserData) -> Result<()> {
        self.release_visit(key_of(data), true)
    }

    pub(crate) fn contains(&self, data: &UserData) -> bool {
        self.entries.contains_key(&key_of(data))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks and removal happen under one shard lock; the cleanup runs
    /// after it is released.
    fn release_visit(&self, key: usize, unclaim: bool) -> Result<()> {
        let MapEntry::Occupied(mut slot) = self.entries.entry(key) else {
            return Err(RestError::ResourceUnavailable);
        };

        let entry = slot.get_mut();
        if unclaim {
            if entry.claims == 0 {
                error!("[refcount] Resource {:#x} hasn't been claimed", key);
                return Err(RestError::ResourceOwnership);
            }
            entry.claims -= 1;
        }
        if entry.visits > 1 {
            entry.visits -= 1;
            trace!("[refcount] Decrement {:#x} ({} visits)", key, entry.visits);
            return Ok(());
        }
        if entry.claims != 0 {
            error!("[refcount] Caught attempt to cleanup claimed resource {:#x}", key);
            return Err(RestError::ResourceOwnership);
        }

        let (_, entry) = slot.remove_entry();
        debug!("[refcount] Fully decremented and released {:#x}", key);
        if let Some(cleanup) = entry.cleanup {
            cleanup(entry.data);
        }
        Ok(())
    }
}
