//! Rule trees over user and event facts: evaluation, the per-user
//! evaluation cache, and the orchestrator that keeps it current as
//! events arrive.

pub mod cache;
pub mod engine;
pub mod operators;
pub mod service;
pub mod store;
pub mod tree;
pub mod types;

pub use cache::{EvaluationCache, MemoryEvaluationCache, RedisEvaluationCache};
pub use engine::{check, check_combinator, evaluate};
pub use service::{MergeResult, RuleOrchestrator, RuleResults};
pub use store::{MemoryRuleStore, RuleStore};
pub use tree::{compile_rule, decompile_rule, NestedRule, RuleTree};
pub use types::{Combinator, Rule, RuleGroup, RuleKind};
