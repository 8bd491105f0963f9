pub mod config;
pub mod error;
pub mod handlers;
pub mod processor;
pub mod worker;
