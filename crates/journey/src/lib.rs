//! Journey orchestration: step graphs users traverse as events arrive,
//! with rule gates, value maps, delays and campaign actions.

pub mod engine;
pub mod evaluator;
pub mod graph;
pub mod store;
pub mod types;

pub use engine::{ActionTrigger, JourneyAdvance, JourneyRunner, JOURNEY_DELAY_JOB};
pub use evaluator::{JourneyEvaluator, StepOutcome};
pub use graph::JourneyGraph;
pub use store::{JourneyStore, MemoryJourneyStore};
