//! Mention validation for group messages.
//!
//! The valid mention set for a send is the intersection of the candidate
//! list with the group's current membership, checked server-side on every
//! send. The resulting visibility scope ({sender} plus valid mentions) is
//! assembled by the dispatcher, not here.

use std::collections::HashSet;

use crate::db::GroupRepository;
use crate::Result;

/// Resolve the subset of candidate user ids that are current members of the
/// group, preserving candidate order and dropping duplicates.
///
/// An empty candidate list, or a group that doesn't exist, yields an empty
/// result; the message then has unrestricted visibility.
pub async fn resolve_mentions(
    groups: &GroupRepository<'_>,
    group_id: &str,
    candidates: &[String],
) -> Result<Vec<String>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let Some(group) = groups.get_by_id(group_id).await? else {
        return Ok(Vec::new());
    };

    let member_ids = group.member_ids();
    let mut seen = HashSet::new();
    Ok(candidates
        .iter()
        .filter(|id| member_ids.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect())
}
