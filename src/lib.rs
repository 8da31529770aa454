pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod models;
pub mod poller;
pub mod session;
pub mod stats;
pub mod store;
