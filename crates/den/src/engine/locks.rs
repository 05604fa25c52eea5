//! Lock ordering for the storage tiers.
//!
//! Three resource categories guard the tiers: the memory tier, the log
//! segment set and the page set. Locks are always taken in the order
//! Memory, Log, Page. Only composite guards are handed out, so no caller can
//! take two categories in another order.

use parking_lot::{
    RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};

/// Category locks for one engine.
#[derive(Debug, Default)]
pub struct LockManager {
    memory: RwLock<()>,
    log: RwLock<()>,
    page: RwLock<()>,
}

/// Shared access to every tier, held by queries.
#[must_use]
pub struct ReadAll<'a> {
    _memory: RwLockReadGuard<'a, ()>,
    _log: RwLockReadGuard<'a, ()>,
    _page: RwLockReadGuard<'a, ()>,
}

/// Exclusive access to one source tier and the page set, held by drains.
#[must_use]
pub struct Drain<'a> {
    _source: RwLockWriteGuard<'a, ()>,
    _page: RwLockWriteGuard<'a, ()>,
}

/// Page set access that excludes other writers but admits readers.
#[must_use]
pub struct PagesUpgradable<'a> {
    page: RwLockUpgradableReadGuard<'a, ()>,
}

/// Exclusive access to the page set.
#[must_use]
pub struct PagesExclusive<'a> {
    _page: RwLockWriteGuard<'a, ()>,
}

/// Exclusive access to every tier.
#[must_use]
pub struct StorageExclusive<'a> {
    _memory: RwLockWriteGuard<'a, ()>,
    _log: RwLockWriteGuard<'a, ()>,
    _page: RwLockWriteGuard<'a, ()>,
}

impl<'a> PagesUpgradable<'a> {
    /// Waits for readers to leave and turns this guard exclusive.
    pub fn upgrade(self) -> PagesExclusive<'a> {
        PagesExclusive {
            _page: RwLockUpgradableReadGuard::upgrade(self.page),
        }
    }
}

impl LockManager {
    /// Creates unlocked categories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared locks on Memory, Log and Page.
    pub fn read_all(&self) -> ReadAll<'_> {
        let memory = self.memory.read();
        let log = self.log.read();
        let page = self.page.read();
        ReadAll {
            _memory: memory,
            _log: log,
            _page: page,
        }
    }

    /// Exclusive Log, then exclusive Page.
    pub fn drain_log(&self) -> Drain<'_> {
        let log = self.log.write();
        let page = self.page.write();
        Drain {
            _source: log,
            _page: page,
        }
    }

    /// Exclusive Memory, then exclusive Page.
    pub fn drain_memory(&self) -> Drain<'_> {
        let memory = self.memory.write();
        let page = self.page.write();
        Drain {
            _source: memory,
            _page: page,
        }
    }

    /// Upgradable Page lock for compaction: readers proceed until the swap.
    pub fn pages_upgradable(&self) -> PagesUpgradable<'_> {
        PagesUpgradable {
            page: self.page.upgradable_read(),
        }
    }

    /// Exclusive Page.
    pub fn pages_exclusive(&self) -> PagesExclusive<'_> {
        PagesExclusive {
            _page: self.page.write(),
        }
    }

    /// Exclusive Memory, Log and Page.
    pub fn storage_exclusive(&self) -> StorageExclusive<'_> {
        let memory = self.memory.write();
        let log = self.log.write();
        let page = self.page.write();
        StorageExclusive {
            _memory: memory,
            _log: log,
            _page: page,
        }
    }
}
