//! In-process claim set.
//!
//! A claim marks a record as queued or in flight on this node, so a sweep
//! and a transition notification never dispatch the same record twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::record::RecordId;

#[derive(Debug, Default)]
pub struct ClaimSet {
    claimed: Mutex<HashSet<RecordId>>,
}

impl ClaimSet {
    fn claimed(&self) -> MutexGuard<'_, HashSet<RecordId>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id`; false if it is already claimed.
    pub fn claim(&self, id: &RecordId) -> bool {
        self.claimed().insert(id.clone())
    }

    pub fn release(&self, id: &RecordId) {
        self.claimed().remove(id);
    }

    pub fn is_claimed(&self, id: &RecordId) -> bool {
        self.claimed().contains(id)
    }

    pub fn len(&self) -> usize {
        self.claimed().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed().is_empty()
    }

    /// Claim `id` for the lifetime of the returned guard.
    pub fn try_claim(self: &Arc<Self>, id: &RecordId) -> Option<ClaimGuard> {
        self.claim(id).then(|| ClaimGuard {
            claims: self.clone(),
            id: id.clone(),
        })
    }
}

/// Releases its claim on drop, including when the holder panics.
#[derive(Debug)]
pub struct ClaimGuard {
    claims: Arc<ClaimSet>,
    id: RecordId,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.release(&self.id);
    }
}
