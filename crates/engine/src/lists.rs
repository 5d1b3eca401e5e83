//! Dynamic list membership, kept current from event rule results.

use tracing::debug;

use campaign_core::types::User;
use campaign_rules::RuleResults;

use crate::context::EngineContext;
use crate::store::ListKind;

/// List ids the user joined or left.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListChanges {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
}

/// Add the user to dynamic lists whose rule just became true and remove
/// them from those whose rule just became false. Lists whose rule was not
/// recomputed are left alone, as are static lists.
pub async fn update_users_lists(
    ctx: &EngineContext,
    user: &User,
    results: &RuleResults,
) -> anyhow::Result<ListChanges> {
    let mut changes = ListChanges::default();
    if results.success.is_empty() && results.failure.is_empty() {
        return Ok(changes);
    }

    for list in ctx.lists.dynamic_lists(user.project_id).await? {
        let ListKind::Dynamic { rule_uuid } = list.kind else {
            continue;
        };
        if results.is_success(&rule_uuid) {
            if ctx.lists.add_user(list.id, user.id).await? {
                changes.added.push(list.id);
            }
        } else if results.is_failure(&rule_uuid) && ctx.lists.remove_user(list.id, user.id).await? {
            changes.removed.push(list.id);
        }
    }

    if !changes.added.is_empty() || !changes.removed.is_empty() {
        debug!(user_id = user.id, added = ?changes.added, removed = ?changes.removed, "List membership updated");
    }
    Ok(changes)
}
