//! Inbound event pipeline. Every event, whether reported for a user or
//! emitted by a send, goes through `event_post`: store it, recompute the
//! rules it touches, then update lists and journeys from that one result.

use tracing::{debug, info, warn};

use campaign_core::types::{NewEvent, User, UserEvent};
use campaign_journey::JourneyAdvance;

use crate::context::EngineContext;
use crate::jobs::{event_post_job, EventPostTrigger};
use crate::lists::{update_users_lists, ListChanges};

/// What processing one event changed.
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    pub event_id: i64,
    pub lists: ListChanges,
    pub journeys: Vec<JourneyAdvance>,
}

/// Store an event for `user` and queue its processing.
pub async fn create_event(ctx: &EngineContext, user: &User, event: NewEvent) -> anyhow::Result<UserEvent> {
    let mut trigger = EventPostTrigger::new(user.project_id, user.id, event);
    let stored = ctx.events.insert_event(trigger.key, user, &trigger.event).await?;
    trigger.event_id = Some(stored.id);
    ctx.queue.enqueue(event_post_job(&trigger)?).await?;
    metrics::counter!("events.created").increment(1);
    debug!(user_id = user.id, event = %stored.name, event_id = stored.id, "Event created");
    Ok(stored)
}

/// Handle one `event_post`. Unknown users are dropped with a warning.
pub async fn process_event(ctx: &EngineContext, trigger: &EventPostTrigger) -> anyhow::Result<Option<EventOutcome>> {
    let user = ctx
        .users
        .get_user(trigger.user_id)
        .await?
        .filter(|u| u.project_id == trigger.project_id);
    let Some(user) = user else {
        warn!(
            project_id = trigger.project_id,
            user_id = trigger.user_id,
            event = %trigger.event.name,
            "Event for unknown user dropped"
        );
        return Ok(None);
    };

    let stored = match trigger.event_id {
        Some(id) => ctx.events.get_event(id).await?,
        None => None,
    };
    let event = match stored {
        Some(event) => event,
        None => ctx.events.insert_event(trigger.key, &user, &trigger.event).await?,
    };

    let results = ctx.rules.matching_rules_for_event(&user, &event).await?;
    let lists = update_users_lists(ctx, &user, &results).await?;
    let journeys = ctx.journeys.apply_rule_results(&user, &results).await?;

    metrics::counter!("events.processed").increment(1);
    info!(
        user_id = user.id,
        event = %event.name,
        rules_true = results.success.len(),
        rules_false = results.failure.len(),
        lists_added = lists.added.len(),
        lists_removed = lists.removed.len(),
        journeys = journeys.len(),
        "Event processed"
    );
    Ok(Some(EventOutcome {
        event_id: event.id,
        lists,
        journeys,
    }))
}
