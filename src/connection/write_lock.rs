//! Write-serialization lock shared by every writer of one connection.
//!
//! The transport accepts one write at a time. [`WriteLock`] records which
//! [`WriterId`] currently owns the right to write and keeps one parked
//! continuation per writer that is waiting for it. Waiters are not served in
//! arrival order: when the owner releases, [`WriteLock::resume_next`] walks
//! [`WriterId::PRIORITY`] and hands ownership to the first occupied slot.
//! The releasing writer goes last in that walk.
//!
//! ```text
//!   try_lock ──ok──────────────────────────────┐
//!      │                                       ▼
//!      └─fail─► enqueue ──(resume_next)──► lock ──► write ──► unlock ──► resume_next
//! ```
//!
//! The lock itself never blocks. Callers guard it with the connection's
//! low-level mutex and never hold that across an `.await`.

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// The kind of writer competing for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriterId {
    /// Close frame sender.
    Close,
    /// Application ping or pong.
    Ping,
    /// Keep-alive ping driven by the idle timer.
    IdlePing,
    /// Replies produced while reading (automatic pongs, close echo).
    Read,
    /// Application data.
    Write,
}

impl WriterId {
    /// Hand-off order after a release. The releasing writer is tried last.
    pub const PRIORITY: [WriterId; 5] = [
        WriterId::Close,
        WriterId::Ping,
        WriterId::IdlePing,
        WriterId::Read,
        WriterId::Write,
    ];

    const fn slot(self) -> usize {
        match self {
            WriterId::Close => 0,
            WriterId::Ping => 1,
            WriterId::IdlePing => 2,
            WriterId::Read => 3,
            WriterId::Write => 4,
        }
    }
}

impl std::fmt::Display for WriterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A parked writer. Firing it tells the writer it now owns the lock.
pub(crate) type Waiter = oneshot::Sender<()>;

/// Single-owner lock with one waiter slot per [`WriterId`].
#[derive(Debug, Default)]
pub struct WriteLock {
    owner: Option<WriterId>,
    slots: [Option<Waiter>; 5],
}

impl WriteLock {
    /// Create an unlocked lock with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership for `id` if nobody holds the lock.
    pub fn try_lock(&mut self, id: WriterId) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.owner = Some(id);
        true
    }

    /// Re-affirm ownership after being resumed by [`resume_next`].
    ///
    /// The dispatcher has already reserved the lock for `id`; this never
    /// waits.
    ///
    /// [`resume_next`]: WriteLock::resume_next
    pub fn lock(&mut self, id: WriterId) {
        debug_assert!(
            self.owner.is_none() || self.owner == Some(id),
            "write lock reserved for {:?}, not {id:?}",
            self.owner
        );
        self.owner = Some(id);
    }

    /// Release ownership.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not the current owner.
    pub fn unlock(&mut self, id: WriterId) {
        assert_eq!(
            self.owner,
            Some(id),
            "write lock released by {id:?} which does not own it"
        );
        self.owner = None;
    }

    /// Debug helper: is the lock held by `id`?
    #[must_use]
    pub fn is_locked(&self, id: WriterId) -> bool {
        self.owner == Some(id)
    }

    /// Current owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<WriterId> {
        self.owner
    }

    /// Is a live writer parked in `id`'s slot?
    #[must_use]
    pub fn is_waiting(&self, id: WriterId) -> bool {
        self.slots[id.slot()]
            .as_ref()
            .is_some_and(|waiter| !waiter.is_closed())
    }

    /// Park `id` until the lock is handed to it.
    ///
    /// A slot whose waiter has gone away is reused.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyInProgress` if a live writer already occupies
    /// the slot.
    pub fn enqueue(&mut self, id: WriterId) -> Result<oneshot::Receiver<()>> {
        if self.is_waiting(id) {
            return Err(Error::AlreadyInProgress(id));
        }
        let (tx, rx) = oneshot::channel();
        self.slots[id.slot()] = Some(tx);
        Ok(rx)
    }

    /// Acquire now, or park in the writer's slot.
    ///
    /// Returns `None` when the lock was taken, or the receiver to await.
    ///
    /// # Errors
    ///
    /// See [`enqueue`](WriteLock::enqueue).
    pub fn try_lock_or_enqueue(&mut self, id: WriterId) -> Result<Option<oneshot::Receiver<()>>> {
        if self.try_lock(id) {
            Ok(None)
        } else {
            self.enqueue(id).map(Some)
        }
    }

    /// Drop the parked waiter for `id` without resuming it.
    pub fn cancel(&mut self, id: WriterId) {
        self.slots[id.slot()] = None;
    }

    /// Hand the free lock to the highest-priority waiter other than
    /// `released`.
    ///
    /// A second instance of `released` parked behind the first is only
    /// considered after every other writer, so it cannot starve them and
    /// is never stranded either.
    ///
    /// Ownership is reserved for the chosen writer before it is woken, so no
    /// other writer can slip in before it runs. Waiters whose receiving side
    /// is gone are discarded and the next slot is tried. At most one writer
    /// is resumed.
    pub fn resume_next(&mut self, released: WriterId) -> Option<WriterId> {
        debug_assert!(self.owner.is_none(), "resume_next with lock held");
        let others = WriterId::PRIORITY.into_iter().filter(|id| *id != released);
        for id in others.chain(std::iter::once(released)) {
            let Some(waiter) = self.slots[id.slot()].take() else {
                continue;
            };
            self.owner = Some(id);
            if waiter.send(()).is_ok() {
                return Some(id);
            }
            self.owner = None;
        }
        None
    }

    /// Unlock for `id` and resume the next waiter.
    pub fn release(&mut self, id: WriterId) -> Option<WriterId> {
        self.unlock(id);
        self.resume_next(id)
    }
}
