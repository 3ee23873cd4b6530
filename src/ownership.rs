//! # ownership: which records this instance may act on
//!
//! Every instance sees the full Position / Action stream and keeps only the
//! records whose `ownerId` equals its own `userId`. This single predicate is
//! the whole partitioning scheme; no handler compares owner strings itself.

use crate::models::{Action, Position};

pub trait Owned {
    fn owner_id(&self) -> &str;
}

impl Owned for Position {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

impl Owned for Action {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    user_id: String,
}

impl InstanceIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Exact match on owner id. An empty identity owns nothing.
    pub fn owns<R: Owned + ?Sized>(&self, record: &R) -> bool {
        !self.user_id.is_empty() && record.owner_id() == self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, ExecutionType};
    use uuid::Uuid;

    #[test]
    fn test_owns_exact_match_only() {
        let me = InstanceIdentity::new("user-a");
        let mine = Position::new("user-a", "acc", "EURUSD", 0.1, ExecutionType::Entry, 0.0);
        let theirs = Position::new("user-A", "acc", "EURUSD", 0.1, ExecutionType::Entry, 0.0);
        assert!(me.owns(&mine));
        assert!(!me.owns(&theirs));

        let action = Action::new("user-b", Uuid::new_v4(), ActionType::Close);
        assert!(!me.owns(&action));
    }

    #[test]
    fn test_empty_identity_owns_nothing() {
        let nobody = InstanceIdentity::new("");
        let blank = Position::new("", "acc", "EURUSD", 0.1, ExecutionType::Entry, 0.0);
        assert!(!nobody.owns(&blank));
    }
}
