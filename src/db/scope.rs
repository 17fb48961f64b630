/// The set of owner IDs a query should match.
///
/// Administrators are configured as a group that shares panels, settings and
/// subscribers: a lookup for any admin ID must see rows written under any
/// other admin ID. Agents always resolve to exactly their own ID. Writes go
/// to the canonical (first) ID of the scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerScope {
    ids: Vec<i64>,
}

impl OwnerScope {
    /// Expand `owner_id` against the configured admin group.
    pub fn expand(admin_ids: &[i64], owner_id: i64) -> Self {
        if admin_ids.contains(&owner_id) {
            let mut ids = admin_ids.to_vec();
            ids.sort_unstable();
            OwnerScope { ids }
        } else {
            OwnerScope {
                ids: vec![owner_id],
            }
        }
    }

    /// Scope containing a single ID, with no group expansion.
    pub fn single(owner_id: i64) -> Self {
        OwnerScope {
            ids: vec![owner_id],
        }
    }

    /// Candidate IDs, for `owner_id = ANY($1)` bindings.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// ID used for inserts, updates and notification addressing.
    pub fn canonical(&self) -> i64 {
        self.ids[0]
    }
}
