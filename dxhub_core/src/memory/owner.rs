//! Atomic owner-word primitive backing both per-slot acquisition and the
//! DataBlock management mutex's robustness semantics.
//!
//! A lock's entire state lives in a single `AtomicU64`: `0` means free, any
//! other value is the unique token of the [`AtomicGuard`] currently holding
//! it. `AtomicGuard::acquire`/`release` are the only ways to change that
//! word, via compare-and-swap; `AtomicOwner` itself exposes no direct
//! mutation, only `is_free()`, so the lock state cannot be corrupted by code
//! that forgot to go through a guard.
//!
//! This is deliberately the *only* lock-state shape in this crate: it is
//! used unmodified both for per-slot ownership (pid+generation packed into
//! the token) and for the segment's single management lock, so a process
//! that dies mid-acquisition leaves behind a stale, recoverable token rather
//! than a poisoned OS mutex.

use std::sync::atomic::{AtomicU64, Ordering};

/// Owner of a lock: `0` is free, any other value is a live guard's token.
#[derive(Debug)]
#[repr(C)]
pub struct AtomicOwner {
    state: AtomicU64,
}

impl AtomicOwner {
    pub const fn new() -> Self {
        Self { state: AtomicU64::new(0) }
    }

    pub fn is_free(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }

    /// Current owner token, or `0` if free. Exposed for recovery logic that
    /// needs to inspect the holder without acquiring (e.g. decode a pid from
    /// the token to check liveness).
    pub fn load(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    fn compare_exchange(&self, expected: u64, desired: u64) -> bool {
        self.state
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force the owner word back to free. Used only by management-mutex-held
    /// recovery once a dead holder's pid has been confirmed; bypasses the
    /// normal matching-token release because the original token is, by
    /// definition, never coming back.
    pub fn force_clear(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Publish a token that some other mechanism (a slot's own state CAS)
    /// has already serialized exclusive access for. Used when the owner
    /// word encodes caller-chosen bits (e.g. pid+generation) rather than
    /// `AtomicGuard`'s own counter, so the normal CAS-based `acquire` can't
    /// be used to set it.
    pub(crate) fn publish(&self, token: u64) {
        self.state.store(token, Ordering::Release);
    }
}

impl Default for AtomicOwner {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    loop {
        let t = NEXT.fetch_add(1, Ordering::Relaxed);
        if t != 0 {
            return t;
        }
    }
}

/// Move-only RAII guard over an [`AtomicOwner`]. The guard holds no belief
/// about whether it is active — [`AtomicGuard::active`] always re-reads the
/// owner word, so guard and owner can never desynchronize.
#[derive(Debug)]
pub struct AtomicGuard<'a> {
    owner: Option<&'a AtomicOwner>,
    token: u64,
}

impl<'a> AtomicGuard<'a> {
    /// Create a detached guard with a fresh token.
    pub fn new() -> Self {
        Self { owner: None, token: generate_token() }
    }

    /// Attach to `owner` and, if `try_acquire`, attempt to take the lock.
    pub fn attached(owner: &'a AtomicOwner, try_acquire: bool) -> Self {
        let mut guard = Self { owner: Some(owner), token: generate_token() };
        if try_acquire {
            let _ = guard.acquire();
        }
        guard
    }

    /// Attempt to acquire the lock. Returns `false` if already held.
    #[must_use]
    pub fn acquire(&mut self) -> bool {
        match self.owner {
            Some(owner) => owner.compare_exchange(0, self.token),
            None => false,
        }
    }

    /// Attempt to release the lock. Returns `false` if this guard is not the
    /// current holder.
    #[must_use]
    pub fn release(&mut self) -> bool {
        match self.owner {
            Some(owner) => owner.compare_exchange(self.token, 0),
            None => false,
        }
    }

    /// Authoritative check: does the owner word currently equal our token?
    pub fn active(&self) -> bool {
        match self.owner {
            Some(owner) => owner.load() == self.token,
            None => false,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Attach to a new owner without acquiring. Leaks the previous lock if
    /// this guard was active on another owner — callers must release first.
    pub fn attach(&mut self, owner: &'a AtomicOwner) {
        debug_assert!(!self.active(), "attach() called on an active guard; lock leaked");
        self.owner = Some(owner);
    }

    /// Detach without releasing. Leaks the lock if active.
    pub fn detach(&mut self) {
        self.owner = None;
    }
}

impl Default for AtomicGuard<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AtomicGuard<'_> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner {
            owner.compare_exchange(self.token, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_owner_is_free() {
        let owner = AtomicOwner::new();
        assert!(owner.is_free());
    }

    #[test]
    fn acquire_then_release_roundtrips() {
        let owner = AtomicOwner::new();
        let mut guard = AtomicGuard::attached(&owner, true);
        assert!(guard.active());
        assert!(!owner.is_free());
        assert!(guard.release());
        assert!(owner.is_free());
    }

    #[test]
    fn second_guard_cannot_acquire_held_lock() {
        let owner = AtomicOwner::new();
        let mut first = AtomicGuard::attached(&owner, true);
        let mut second = AtomicGuard::attached(&owner, false);
        assert!(!second.acquire());
        assert!(first.release());
        assert!(second.acquire());
    }

    #[test]
    fn drop_releases_if_active() {
        let owner = AtomicOwner::new();
        {
            let _guard = AtomicGuard::attached(&owner, true);
            assert!(!owner.is_free());
        }
        assert!(owner.is_free());
    }

    #[test]
    fn drop_is_noop_if_not_active() {
        let owner = AtomicOwner::new();
        let mut guard = AtomicGuard::attached(&owner, true);
        assert!(guard.release());
        drop(guard);
        assert!(owner.is_free());
    }

    #[test]
    fn move_transfers_ownership() {
        let owner = AtomicOwner::new();
        let guard = AtomicGuard::attached(&owner, true);
        let token = guard.token();
        let moved = guard;
        assert!(moved.active());
        assert_eq!(moved.token(), token);
    }

    #[test]
    fn force_clear_recovers_abandoned_lock() {
        let owner = AtomicOwner::new();
        let guard = AtomicGuard::attached(&owner, true);
        std::mem::forget(guard); // simulate a holder that crashed
        assert!(!owner.is_free());
        owner.force_clear();
        assert!(owner.is_free());
    }
}
