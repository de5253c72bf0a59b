pub mod admin;
pub mod commands;
pub mod config;
pub mod context;
pub mod events;
pub mod logging;
pub mod notifier;
pub mod platform;
pub mod profile;
pub mod registry;
pub mod scanner;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
