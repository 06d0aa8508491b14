pub mod backoff;
pub mod broker;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod sink;
