#![warn(clippy::unwrap_used)]

//! Delivery plumbing: per-provider send-rate windows and the providers
//! that carry a rendered message to a user.

pub mod providers;
pub mod throttle;

pub use providers::{
    LoggerProvider, Message, Provider, ProviderFactory, ProviderRecord, ProviderRegistry,
    SendReceipt, Template,
};
pub use throttle::{MemoryThrottle, ProviderThrottle, RedisThrottle, ThrottleResult};
