use std::{collections::HashSet, sync::RwLock};

use shared::domain::UserId;

use crate::{read_lock, write_lock};

/// Set of identities the server currently reports as online.
///
/// Each presence frame carries the full set, so updates replace rather than merge.
#[derive(Default)]
pub struct PresenceTracker {
    online: RwLock<HashSet<UserId>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn replace(&self, ids: impl IntoIterator<Item = UserId>) {
        *write_lock(&self.online) = ids.into_iter().collect();
    }

    pub(crate) fn clear(&self) {
        write_lock(&self.online).clear();
    }

    pub fn is_online(&self, id: &UserId) -> bool {
        read_lock(&self.online).contains(id)
    }

    /// Sorted snapshot of the online set.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = read_lock(&self.online).iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        read_lock(&self.online).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
