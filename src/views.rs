use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::structs::UserId;

/// Marks a user's rendered views as stale after their ledger changes.
pub trait ViewInvalidator: Send + Sync {
    fn invalidate(&self, user: &UserId);
}

/// Per-user dashboard revision. Each write bumps the revision; the
/// dashboard endpoint reports it as its entity tag so that clients and
/// caches drop renderings made before the write.
#[derive(Default)]
pub struct DashboardViews {
    revisions: RwLock<HashMap<UserId, u64>>,
}

impl DashboardViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self, user: &UserId) -> u64 {
        self.revisions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .copied()
            .unwrap_or(0)
    }

    /// Entity tag for a dashboard rendered at `revision`.
    pub fn etag(revision: u64) -> String {
        format!("W/\"dashboard-{revision}\"")
    }
}

impl ViewInvalidator for DashboardViews {
    fn invalidate(&self, user: &UserId) {
        let mut revisions = self
            .revisions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let revision = revisions.entry(user.clone()).or_insert(0);
        *revision += 1;
        debug!(user = %user, revision = *revision, "Dashboard invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_bumps_only_that_user() {
        let views = DashboardViews::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        assert_eq!(views.revision(&alice), 0);
        views.invalidate(&alice);
        views.invalidate(&alice);

        assert_eq!(views.revision(&alice), 2);
        assert_eq!(views.revision(&bob), 0);
        assert_eq!(DashboardViews::etag(views.revision(&alice)), "W/\"dashboard-2\"");
    }
}
