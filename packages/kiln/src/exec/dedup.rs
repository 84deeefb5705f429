//! At-most-one build per fingerprint.
//!
//! Within one build, concurrent pips that map to the same weak fingerprint
//! must not execute twice: the first claimant becomes the owner and builds;
//! everyone else waits for the owner's outcome and then re-reads the cache,
//! which the owner has just populated. The table is build-scoped and holds
//! no entries across builds.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::trace;

use crate::fingerprint::WeakFingerprint;

/// How the owner's build turned out, from a follower's point of view.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum OwnerOutcome {
    /// Still building.
    #[default]
    Pending,
    /// The owner published a descriptor; a fresh cache lookup will hit.
    Published,
    /// The owner finished without publishing (failed or uncacheable);
    /// followers must build for themselves.
    NotPublished,
}

/// The result of claiming a fingerprint.
pub enum Claim {
    /// This pip builds; complete the guard when done.
    Owner(OwnerGuard),
    /// Another pip is building; wait on the receiver.
    Follower(watch::Receiver<OwnerOutcome>),
}

/// Held by the building pip; completing (or dropping) it releases the
/// followers.
pub struct OwnerGuard {
    weak: WeakFingerprint,
    table: Arc<DashMap<WeakFingerprint, watch::Receiver<OwnerOutcome>>>,
    sender: watch::Sender<OwnerOutcome>,
    completed: bool,
}

impl OwnerGuard {
    /// Announce the outcome and release the entry.
    pub fn complete(mut self, outcome: OwnerOutcome) {
        self.completed = true;
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: OwnerOutcome) {
        trace!(weak = %self.weak, ?outcome, "fingerprint build complete");
        self.table.remove(&self.weak);
        let _ = self.sender.send(outcome);
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if !self.completed {
            // The owner died without an announcement; followers build for
            // themselves rather than wait forever.
            self.finish(OwnerOutcome::NotPublished);
        }
    }
}

/// The in-flight fingerprint table.
#[derive(Clone, Default)]
pub struct InFlightTable {
    entries: Arc<DashMap<WeakFingerprint, watch::Receiver<OwnerOutcome>>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a fingerprint: first caller owns the build, the rest follow.
    pub fn claim(&self, weak: WeakFingerprint) -> Claim {
        match self.entries.entry(weak) {
            dashmap::Entry::Occupied(entry) => Claim::Follower(entry.get().clone()),
            dashmap::Entry::Vacant(slot) => {
                let (sender, receiver) = watch::channel(OwnerOutcome::Pending);
                slot.insert(receiver);
                Claim::Owner(OwnerGuard {
                    weak,
                    table: self.entries.clone(),
                    sender,
                    completed: false,
                })
            }
        }
    }

    /// The number of in-flight fingerprints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wait for the owner's outcome.
pub async fn await_owner(mut receiver: watch::Receiver<OwnerOutcome>) -> OwnerOutcome {
    loop {
        let current = *receiver.borrow();
        if current != OwnerOutcome::Pending {
            return current;
        }
        if receiver.changed().await.is_err() {
            // Sender gone without a terminal value.
            return OwnerOutcome::NotPublished;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use wire::ContentHash;

    fn weak(tag: &str) -> WeakFingerprint {
        WeakFingerprint(ContentHash::from_buffer(tag))
    }

    #[tokio::test]
    async fn first_claim_owns_second_follows() {
        let table = InFlightTable::new();
        let Claim::Owner(owner) = table.claim(weak("w")) else {
            panic!("first claim must own");
        };
        let Claim::Follower(receiver) = table.claim(weak("w")) else {
            panic!("second claim must follow");
        };

        let waiter = tokio::spawn(await_owner(receiver));
        owner.complete(OwnerOutcome::Published);
        pretty_assert_eq!(waiter.await.unwrap(), OwnerOutcome::Published);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn dropped_owner_releases_followers() {
        let table = InFlightTable::new();
        let Claim::Owner(owner) = table.claim(weak("w")) else {
            panic!("first claim must own");
        };
        let Claim::Follower(receiver) = table.claim(weak("w")) else {
            panic!("second claim must follow");
        };

        drop(owner);
        pretty_assert_eq!(await_owner(receiver).await, OwnerOutcome::NotPublished);
    }

    #[tokio::test]
    async fn distinct_fingerprints_do_not_interfere() {
        let table = InFlightTable::new();
        assert!(matches!(table.claim(weak("a")), Claim::Owner(_)));
        assert!(matches!(table.claim(weak("b")), Claim::Owner(_)));
        pretty_assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn fingerprint_is_reclaimable_after_completion() {
        let table = InFlightTable::new();
        let Claim::Owner(owner) = table.claim(weak("w")) else {
            panic!("first claim must own");
        };
        owner.complete(OwnerOutcome::NotPublished);
        assert!(matches!(table.claim(weak("w")), Claim::Owner(_)));
    }
}
