pub mod app;
pub mod catalog;
pub mod clock;
pub mod completeness;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod highlight;
pub mod orchestrator;
pub mod output;
pub mod poller;
pub mod scheduler;
pub mod store;
pub mod tui;
