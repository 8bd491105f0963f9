pub mod dead_letter;
pub mod dedup;
pub mod delegate;
pub mod health;
pub mod job;
pub mod metrics;
pub mod mock;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod validation;
