pub mod agent;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod source;
