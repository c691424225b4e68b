/// Versioned entity store
///
/// Applies the optimistic concurrency rules on top of the prefix index and
/// keeps the live/dead counters that drive log compaction. The store never
/// touches the log; the queue worker sequences the two.

use crate::error::CurrentVersion;
use crate::radix::PrefixLookup;
use crate::{Entity, Error, Result, Version, NEW_VERSION};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Version an accepted write of `version` is stored under
pub fn next_version(key: &str, version: Version) -> Result<Version> {
    version
        .checked_add(1)
        .ok_or_else(|| Error::InvalidArgument(format!("version of {} would overflow", key)))
}

/// Check `incoming` against what is stored for its key and return the
/// version it will be stored under.
///
/// A tombstoned key only accepts a write from the "new" state; the
/// recreated entity continues the tombstone's version sequence so replay
/// still sees it as the newer change.
fn admit<E: Entity>(existing: Option<&E>, incoming: &E) -> Result<Version> {
    let attempted = incoming.version();
    let current = match existing {
        None if attempted == NEW_VERSION => return next_version(incoming.key(), attempted),
        None => CurrentVersion::Missing,
        Some(stored) if stored.is_deleted() => {
            if attempted == NEW_VERSION {
                return next_version(incoming.key(), stored.version());
            }
            CurrentVersion::Deleted(stored.version())
        }
        Some(stored) if stored.version() > attempted => CurrentVersion::Live(stored.version()),
        Some(_) => return next_version(incoming.key(), attempted),
    };

    Err(Error::Concurrency {
        key: incoming.key().to_string(),
        attempted,
        current,
    })
}

pub struct EntityStore<E> {
    index: PrefixLookup<E>,
    entity_count: AtomicU64,
    dead_entity_count: AtomicU64,
}

impl<E: Entity> Default for EntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityStore<E> {
    pub fn new() -> Self {
        Self {
            index: PrefixLookup::new(),
            entity_count: AtomicU64::new(0),
            dead_entity_count: AtomicU64::new(0),
        }
    }

    /// Live entity stored under `key`
    pub fn get(&self, key: &str) -> Option<E> {
        self.index.get(key).filter(|e| !e.is_deleted())
    }

    /// Live entities whose key starts with `prefix`
    pub fn get_by_prefix(&self, prefix: &str, sort: bool) -> Vec<E> {
        let mut entities: Vec<E> = self
            .index
            .get_by_prefix(prefix)
            .into_iter()
            .filter(|e| !e.is_deleted())
            .collect();
        if sort {
            entities.sort_by(|a, b| a.key().cmp(b.key()));
        }
        entities
    }

    /// Validate and apply a set of writes atomically.
    ///
    /// Either every entity passes the version check and is stored with its
    /// new version, or nothing changes. Returns the stored values.
    pub fn process_transaction(&self, entities: Vec<E>) -> Result<Vec<E>> {
        self.process_transaction_with(entities, |stored| Ok(stored))
    }

    /// Like [`process_transaction`](Self::process_transaction), but hands
    /// the versioned entities to `prepare` before anything is applied. An
    /// error from `prepare` aborts the transaction; whatever it returns is
    /// what gets stored.
    pub fn process_transaction_with<F>(&self, entities: Vec<E>, prepare: F) -> Result<Vec<E>>
    where
        F: FnOnce(Vec<E>) -> Result<Vec<E>>,
    {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let mut tree = self.index.write();

        let mut seen = HashSet::with_capacity(entities.len());
        let mut versioned = Vec::with_capacity(entities.len());
        for entity in &entities {
            if !seen.insert(entity.key()) {
                return Err(Error::InvalidArgument(format!(
                    "key {} appears more than once in one transaction",
                    entity.key()
                )));
            }
            let version = admit(tree.get(entity.key().as_bytes()), entity)?;
            versioned.push(entity.with_version(version));
        }

        let stored = prepare(versioned)?;
        if stored.len() != entities.len() {
            return Err(Error::Internal(format!(
                "prepared {} entities for a transaction of {}",
                stored.len(),
                entities.len()
            )));
        }

        for entity in &stored {
            match tree.insert(entity.key().as_bytes(), entity.clone()) {
                Some(_) => self.dead_entity_count.fetch_add(1, Ordering::Relaxed),
                None => self.entity_count.fetch_add(1, Ordering::Relaxed),
            };
        }

        Ok(stored)
    }

    /// Apply a replayed change. The newer version wins; returns false when
    /// the change was older than what is already stored.
    pub fn load_change(&self, entity: E) -> bool {
        let mut tree = self.index.write();
        let key = entity.key().as_bytes().to_vec();

        match tree.get_mut(&key) {
            Some(existing) if existing.version() >= entity.version() => {
                // Superseded record that compaction has not dropped yet
                self.dead_entity_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(existing) => {
                *existing = entity;
                self.dead_entity_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                tree.insert(&key, entity);
                self.entity_count.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Clone of every non-tombstoned entity, taken under one read lock
    pub fn live_snapshot(&self) -> Vec<E> {
        self.index
            .read()
            .values_with_prefix(b"")
            .into_iter()
            .filter(|e| !e.is_deleted())
            .cloned()
            .collect()
    }

    pub fn remove_all(&self) {
        let mut tree = self.index.write();
        tree.clear();
        self.entity_count.store(0, Ordering::Relaxed);
        self.dead_entity_count.store(0, Ordering::Relaxed);
    }

    /// Forget `count` superseded versions once a rewrite has dropped them
    pub fn forget_dead(&self, count: u64) {
        let _ = self
            .dead_entity_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |dead| {
                Some(dead.saturating_sub(count))
            });
    }

    /// Number of distinct keys, tombstones included.
    ///
    /// Tombstones stay in memory after a rewrite drops them from the log,
    /// so this can be higher than what a reopen of the same log reports.
    pub fn entity_count(&self) -> u64 {
        self.entity_count.load(Ordering::Relaxed)
    }

    /// Number of superseded versions still present in the log
    pub fn dead_entity_count(&self) -> u64 {
        self.dead_entity_count.load(Ordering::Relaxed)
    }

    /// Share of log records that are superseded, between 0.0 and 1.0
    pub fn dead_space_ratio(&self) -> f64 {
        let dead = self.dead_entity_count() as f64;
        let total = self.entity_count() as f64 + dead;
        if total == 0.0 {
            0.0
        } else {
            dead / total
        }
    }
}
