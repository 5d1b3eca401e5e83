#![warn(clippy::unwrap_used)]

//! Campaign automation engine: audience generation under a distributed
//! lock, throttled dispatch, the inbound event pipeline and the job
//! handlers that drive them.

pub mod actions;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod generator;
pub mod jobs;
pub mod lists;
pub mod store;

pub use actions::CampaignActions;
pub use context::{Backends, EngineContext, MemoryBackend, Stores};
pub use dispatcher::{deliver, send_campaign, DeliveryOutcome, DispatchSummary};
pub use events::{create_event, process_event, EventOutcome};
pub use generator::{estimated_send_size, generate_send_list, schedule_campaign};
pub use jobs::{job_registry, EventPostTrigger, MessageTrigger};
pub use lists::{update_users_lists, ListChanges};
pub use store::{
    send_ready_stream, CampaignStore, EventStore, ListKind, ListStore, MemoryStore, SendStore, UserList, UserStore,
};
