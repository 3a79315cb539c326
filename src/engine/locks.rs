use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;
use tokio::time::timeout_at;
use tracing::warn;
use ulid::Ulid;

use crate::limits::MAX_INTERVALS_PER_INSTRUCTOR;

use super::store::{InstructorSlot, WriteSet};
use super::{Engine, EngineError};

/// Commit locks held on a set of instructors, ascending by id.
pub(super) struct CommitLocks {
    slots: Vec<(Ulid, Arc<InstructorSlot>)>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl CommitLocks {
    /// Fails if any locked calendar is already at its interval limit.
    pub(super) async fn ensure_capacity(&self) -> Result<(), EngineError> {
        for (_, slot) in &self.slots {
            if slot.calendar.read().await.interval_count() >= MAX_INTERVALS_PER_INSTRUCTOR {
                return Err(EngineError::LimitExceeded("too many intervals on instructor"));
            }
        }
        Ok(())
    }

    /// Take the calendar write locks, ascending.
    pub(super) async fn write(&self) -> WriteSet {
        let mut guards = Vec::with_capacity(self.slots.len());
        for (id, slot) in &self.slots {
            guards.push((*id, slot.calendar.clone().write_owned().await));
        }
        WriteSet(guards)
    }
}

impl Engine {
    /// Acquire the commit locks of `ids` in ascending order, giving up with
    /// `Busy` once the configured timeout has elapsed for the whole set.
    /// Unknown instructors fail with `InvalidInput`.
    pub(super) async fn lock_instructors(&self, ids: &[Ulid]) -> Result<CommitLocks, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let slots = self.resolve_slots(&ids)?;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.lock_timeout;
        let mut guards = Vec::with_capacity(slots.len());
        for (id, slot) in ids.iter().zip(&slots) {
            match timeout_at(deadline, slot.commit_lock.clone().lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                    warn!(
                        "commit lock on instructor {id} not acquired within {:?}",
                        self.config.lock_timeout
                    );
                    return Err(EngineError::Busy);
                }
            }
        }
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());

        Ok(CommitLocks {
            slots: ids.into_iter().zip(slots).collect(),
            _guards: guards,
        })
    }

    /// Every commit lock in the organization, for compaction.
    pub(super) async fn lock_all(&self) -> CommitLocks {
        let ids = self.store.instructor_ids();
        let mut slots = Vec::with_capacity(ids.len());
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(slot) = self.store.slot(&id) {
                guards.push(slot.commit_lock.clone().lock_owned().await);
                slots.push((id, slot));
            }
        }
        CommitLocks {
            slots,
            _guards: guards,
        }
    }
}
