//! Process-global bucket states and their transition algebra.
//!
//! Every live bucket id has an entry here, guarded by the catalog-wide
//! mutex. Clearing is decoupled from the stripes so that a direct
//! modification of a persisted bucket can invalidate the in-memory bucket
//! without taking its stripe lock.

use std::collections::HashMap;

use value::ObjectId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketState {
    // Bucket can be inserted into, and does not have an outstanding prepared
    // commit
    Normal,
    // Bucket can be inserted into, and has a prepared commit outstanding.
    Prepared,
    // Bucket can no longer be inserted into, does not have an outstanding
    // prepared commit.
    Cleared,
    // Bucket can no longer be inserted into, but still has an outstanding
    // prepared commit. Any writer other than the one who prepared the
    // commit should receive a WriteConflict.
    PreparedAndCleared,
}

impl BucketState {
    pub fn conflicts_with_insertion(&self) -> bool {
        matches!(self, BucketState::Cleared | BucketState::PreparedAndCleared)
    }
}

/// Apply a transition target to a current state.
///
/// `Normal` unwinds a prepare: `Prepared` goes back to `Normal` and
/// `PreparedAndCleared` collapses to `Cleared`. `Prepared` only applies to
/// `Normal`. `Cleared` marks `Normal` as `Cleared` and `Prepared` as
/// `PreparedAndCleared`. Anything else leaves the state untouched.
/// `PreparedAndCleared` is never a legal target: it only arises as the image
/// of `Cleared` applied to `Prepared`.
fn apply_transition(state: BucketState, target: BucketState) -> BucketState {
    match target {
        BucketState::Normal => match state {
            BucketState::Prepared => BucketState::Normal,
            BucketState::PreparedAndCleared => BucketState::Cleared,
            other => other,
        },
        BucketState::Prepared => match state {
            BucketState::Normal => BucketState::Prepared,
            other => other,
        },
        BucketState::Cleared => match state {
            BucketState::Normal => BucketState::Cleared,
            BucketState::Prepared => BucketState::PreparedAndCleared,
            other => other,
        },
        BucketState::PreparedAndCleared => {
            panic!("PreparedAndCleared may not be named as a transition target")
        },
    }
}

#[derive(Default)]
pub(crate) struct BucketStateRegistry {
    states: HashMap<ObjectId, BucketState>,
}

impl BucketStateRegistry {
    /// Register a bucket. An existing entry is kept as-is: reopening a
    /// bucket whose state survived archival must not resurrect a cleared id.
    pub fn initialize(&mut self, id: ObjectId) {
        self.states.entry(id).or_insert(BucketState::Normal);
    }

    pub fn erase(&mut self, id: &ObjectId) {
        self.states.remove(id);
    }

    pub fn get(&self, id: &ObjectId) -> Option<BucketState> {
        self.states.get(id).copied()
    }

    /// Apply `target` to the bucket's state and return the resulting state,
    /// or `None` when the bucket is unknown.
    pub fn set(&mut self, id: &ObjectId, target: BucketState) -> Option<BucketState> {
        let state = self.states.get_mut(id)?;
        *state = apply_transition(*state, target);
        Some(*state)
    }
}

#[cfg(test)]
mod tests {
    use value::ObjectId;

    use super::{
        apply_transition,
        BucketState,
        BucketStateRegistry,
    };

    #[test]
    fn test_prepare_and_unprepare() {
        assert_eq!(
            apply_transition(BucketState::Normal, BucketState::Prepared),
            BucketState::Prepared
        );
        assert_eq!(
            apply_transition(BucketState::Prepared, BucketState::Normal),
            BucketState::Normal
        );
        // A second prepare of an already-prepared bucket does not stack.
        assert_eq!(
            apply_transition(BucketState::Prepared, BucketState::Prepared),
            BucketState::Prepared
        );
    }

    #[test]
    fn test_clear_of_prepared_becomes_prepared_and_cleared() {
        assert_eq!(
            apply_transition(BucketState::Prepared, BucketState::Cleared),
            BucketState::PreparedAndCleared
        );
        // Finishing the prepared batch collapses it to plain Cleared.
        assert_eq!(
            apply_transition(BucketState::PreparedAndCleared, BucketState::Normal),
            BucketState::Cleared
        );
    }

    #[test]
    fn test_cleared_is_terminal() {
        for target in [BucketState::Normal, BucketState::Prepared, BucketState::Cleared] {
            assert_eq!(
                apply_transition(BucketState::Cleared, target),
                BucketState::Cleared
            );
        }
    }

    #[test]
    #[should_panic(expected = "may not be named")]
    fn test_prepared_and_cleared_is_not_a_target() {
        apply_transition(BucketState::Normal, BucketState::PreparedAndCleared);
    }

    #[test]
    fn test_registry_initialize_does_not_resurrect() {
        let mut registry = BucketStateRegistry::default();
        let id = ObjectId::generate();
        registry.initialize(id);
        registry.set(&id, BucketState::Cleared);
        registry.initialize(id);
        assert_eq!(registry.get(&id), Some(BucketState::Cleared));
    }

    #[test]
    fn test_registry_set_unknown_bucket() {
        let mut registry = BucketStateRegistry::default();
        assert_eq!(registry.set(&ObjectId::generate(), BucketState::Cleared), None);
    }
}
